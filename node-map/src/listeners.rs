//! Change listeners and their isolated invocation.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::error::{BoxError, Error};

/// A callback run after every observed change.
pub type Listener = dyn Fn() -> Result<(), BoxError> + Send + Sync;

/// Receives every error the map swallows.
pub type ErrorHandler = dyn Fn(&Error) + Send + Sync;

/// Append-only, ordered listener list.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: Mutex<Vec<Arc<Listener>>>,
}

impl Listeners {
    pub(crate) fn push(&self, listener: Arc<Listener>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.push(listener);
        }
    }

    /// Runs every listener in registration order on a snapshot of the list,
    /// so listeners may register further listeners or re-enter the map.
    pub(crate) fn fire(&self, on_error: &ErrorHandler) {
        let snapshot: Vec<Arc<Listener>> = match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for listener in snapshot {
            invoke(&*listener, on_error);
        }
    }
}

/// Runs one listener; an error or panic goes to `on_error`.
pub(crate) fn invoke(listener: &Listener, on_error: &ErrorHandler) {
    match panic::catch_unwind(AssertUnwindSafe(|| listener())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => on_error(&Error::Listener(e)),
        Err(payload) => on_error(&Error::Listener(panic_message(payload).into())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}
