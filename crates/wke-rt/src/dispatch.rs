//! UI-thread hand-off: the designated thread id and a task queue the host message
//! loop drains.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, RwLock};
use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;

use crate::error::{Result, RtError};

pub type Task = Box<dyn FnOnce() + Send>;

struct Dispatcher {
    ui: ThreadId,
    tx: Sender<Task>,
    rx: Mutex<Receiver<Task>>,
}

static DISPATCH: OnceCell<RwLock<Option<Dispatcher>>> = OnceCell::new();

fn dispatch() -> &'static RwLock<Option<Dispatcher>> {
    DISPATCH.get_or_init(|| RwLock::new(None))
}

/// Makes the calling thread the UI thread.
pub(crate) fn designate_current() {
    let (tx, rx) = mpsc::channel();
    if let Ok(mut guard) = dispatch().write() {
        *guard = Some(Dispatcher {
            ui: thread::current().id(),
            tx,
            rx: Mutex::new(rx),
        });
    }
}

/// Drops the queue; tasks still queued are discarded.
pub(crate) fn release() {
    if let Ok(mut guard) = dispatch().write() {
        *guard = None;
    }
}

pub fn ui_thread() -> Option<ThreadId> {
    dispatch().read().ok()?.as_ref().map(|d| d.ui)
}

/// True on the UI thread, and everywhere while no UI thread is designated.
pub fn is_ui_thread() -> bool {
    ui_thread().map_or(true, |id| id == thread::current().id())
}

/// Queues `task` for the UI thread.
pub fn post(task: Task) -> Result<()> {
    let guard = dispatch()
        .read()
        .map_err(|_| RtError::Internal("dispatch lock poisoned".to_string()))?;
    let Some(d) = guard.as_ref() else {
        return Err(RtError::NotInitialized);
    };
    d.tx.send(task).map_err(|_| RtError::NotInitialized)
}

/// Runs `f` on the UI thread and waits for its result. On the UI thread itself `f`
/// runs in place.
pub fn run_blocking<R, F>(f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    if is_ui_thread() {
        return Ok(f());
    }
    let (tx, rx) = mpsc::sync_channel(1);
    post(Box::new(move || {
        let _ = tx.send(f());
    }))?;
    rx.recv().map_err(|_| RtError::NotInitialized)
}

/// Runs every queued task. Call from the UI thread's message loop; returns how many
/// tasks ran.
pub fn drain() -> usize {
    if !is_ui_thread() {
        tracing::warn!("dispatch::drain called off the UI thread");
        return 0;
    }
    let mut ran = 0;
    loop {
        let task = {
            let Ok(guard) = dispatch().read() else {
                return ran;
            };
            let Some(d) = guard.as_ref() else {
                return ran;
            };
            let Ok(rx) = d.rx.lock() else {
                return ran;
            };
            match rx.try_recv() {
                Ok(task) => task,
                Err(_) => return ran,
            }
        };
        task();
        ran += 1;
    }
}
