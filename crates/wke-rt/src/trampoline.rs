//! Native-callable entry points that route a callback invocation to its host
//! closure by correlation token.
//!
//! One entry point exists per raw argument shape, calling convention and context
//! position. The engine passes the token back as the context argument; the entry
//! looks up the live registration, converts arguments in place (stage 1), and
//! runs the bound closure on the thread its affinity requires (stage 2).

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

use crate::abi::CallConv;
use crate::callbacks::{self, Deferred, Thread};
use crate::dispatch;
use crate::error::{Result, RtError};

/// A value that crosses the native boundary unchanged.
pub trait RawValue: Copy + Default + Send + 'static {}

macro_rules! raw_values {
    ($($t:ty),*) => { $(impl RawValue for $t {})* };
}

raw_values!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize, f32, f64, bool, ());

/// Tuple of raw callback arguments, context slot excluded.
pub trait ArgShape: Send + 'static {
    const ARITY: usize;

    fn entry<R: RawValue>(conv: CallConv, ctx: usize) -> Option<usize>;
}

// Never constructed; the entry points hang off its inherent impls.
#[allow(dead_code)]
struct Entries<A, R>(PhantomData<fn() -> (A, R)>);

macro_rules! arg_shape {
    () => {
        impl<R: RawValue> Entries<(), R> {
            extern "C" fn c_ctx0(token: usize) -> R {
                invoke::<(), R>(token, ())
            }
            extern "system" fn sys_ctx0(token: usize) -> R {
                invoke::<(), R>(token, ())
            }
        }

        impl ArgShape for () {
            const ARITY: usize = 0;

            fn entry<R: RawValue>(conv: CallConv, ctx: usize) -> Option<usize> {
                Some(match (conv, ctx) {
                    (CallConv::C, 0) => Entries::<Self, R>::c_ctx0 as usize,
                    (CallConv::System, 0) => Entries::<Self, R>::sys_ctx0 as usize,
                    _ => return None,
                })
            }
        }
    };
    ($n:expr; ($t0:ident $v0:ident) $(($t:ident $v:ident))*) => {
        impl<R: RawValue, $t0: RawValue $(, $t: RawValue)*> Entries<($t0, $($t,)*), R> {
            extern "C" fn c_ctx0(token: usize, $v0: $t0 $(, $v: $t)*) -> R {
                invoke::<($t0, $($t,)*), R>(token, ($v0, $($v,)*))
            }
            extern "system" fn sys_ctx0(token: usize, $v0: $t0 $(, $v: $t)*) -> R {
                invoke::<($t0, $($t,)*), R>(token, ($v0, $($v,)*))
            }
            extern "C" fn c_ctx1($v0: $t0, token: usize $(, $v: $t)*) -> R {
                invoke::<($t0, $($t,)*), R>(token, ($v0, $($v,)*))
            }
            extern "system" fn sys_ctx1($v0: $t0, token: usize $(, $v: $t)*) -> R {
                invoke::<($t0, $($t,)*), R>(token, ($v0, $($v,)*))
            }
        }

        impl<$t0: RawValue $(, $t: RawValue)*> ArgShape for ($t0, $($t,)*) {
            const ARITY: usize = $n;

            fn entry<R: RawValue>(conv: CallConv, ctx: usize) -> Option<usize> {
                Some(match (conv, ctx) {
                    (CallConv::C, 0) => Entries::<Self, R>::c_ctx0 as usize,
                    (CallConv::System, 0) => Entries::<Self, R>::sys_ctx0 as usize,
                    (CallConv::C, 1) => Entries::<Self, R>::c_ctx1 as usize,
                    (CallConv::System, 1) => Entries::<Self, R>::sys_ctx1 as usize,
                    _ => return None,
                })
            }
        }
    };
}

arg_shape!();
arg_shape!(1; (A0 a0));
arg_shape!(2; (A0 a0) (A1 a1));
arg_shape!(3; (A0 a0) (A1 a1) (A2 a2));
arg_shape!(4; (A0 a0) (A1 a1) (A2 a2) (A3 a3));
arg_shape!(5; (A0 a0) (A1 a1) (A2 a2) (A3 a3) (A4 a4));
arg_shape!(6; (A0 a0) (A1 a1) (A2 a2) (A3 a3) (A4 a4) (A5 a5));
arg_shape!(7; (A0 a0) (A1 a1) (A2 a2) (A3 a3) (A4 a4) (A5 a5) (A6 a6));
arg_shape!(8; (A0 a0) (A1 a1) (A2 a2) (A3 a3) (A4 a4) (A5 a5) (A6 a6) (A7 a7));

/// Address of the entry point for shape `A` returning `R`, with the context
/// argument at position `ctx`.
pub fn entry<A: ArgShape, R: RawValue>(conv: CallConv, ctx: usize) -> Result<usize> {
    A::entry::<R>(conv, ctx).ok_or_else(|| {
        RtError::Internal(format!(
            "no trampoline for a {}-argument callback with context at position {ctx}",
            A::ARITY
        ))
    })
}

fn fatal(message: String) -> ! {
    tracing::error!("{message}");
    std::process::abort()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn run_guarded<R: RawValue>(callback: &'static str, call: Deferred<R>) -> R {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(r) => r,
        Err(payload) => {
            callbacks::report(RtError::Callback {
                callback,
                message: panic_message(payload.as_ref()),
            });
            R::default()
        }
    }
}

fn invoke<A: 'static, R: RawValue>(token: usize, args: A) -> R {
    let Some(reg) = callbacks::lookup(token) else {
        fatal(format!("native callback fired for unknown token {token}"));
    };
    let Some(adapter) = reg.adapter::<A, R>() else {
        fatal(format!(
            "callback `{}` invoked through a trampoline of the wrong shape",
            reg.callback
        ));
    };
    let name = reg.callback;
    let call = match panic::catch_unwind(AssertUnwindSafe(|| adapter(args))) {
        Ok(call) => call,
        Err(payload) => {
            callbacks::report(RtError::Callback {
                callback: name,
                message: panic_message(payload.as_ref()),
            });
            return R::default();
        }
    };
    match reg.thread {
        Thread::Any => run_guarded(name, call),
        Thread::Ui { .. } if dispatch::is_ui_thread() => run_guarded(name, call),
        Thread::Ui { blocking: true } => {
            dispatch::run_blocking(move || run_guarded(name, call)).unwrap_or_else(|err| {
                callbacks::report(err);
                R::default()
            })
        }
        Thread::Ui { blocking: false } => {
            if let Err(err) = dispatch::post(Box::new(move || {
                run_guarded(name, call);
            })) {
                callbacks::report(err);
            }
            R::default()
        }
    }
}
