//! Clock abstractions used by the state machines.
use crate::net::LocalTime;
use std::sync::{Arc, Mutex};

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

/// A clock that can be moved forward by the reactor on every tick.
pub trait SettableClock: Clock {
    /// Set the local time.
    fn set(&mut self, local_time: LocalTime);
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// Clock with interior mutability, shared between the state machines.
#[derive(Debug, Clone, Default)]
pub struct RefClock {
    inner: Arc<Mutex<LocalTime>>,
}

impl From<LocalTime> for RefClock {
    fn from(time: LocalTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(time)),
        }
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.lock().unwrap()
    }
}

impl SettableClock for RefClock {
    fn set(&mut self, local_time: LocalTime) {
        *self.inner.lock().unwrap() = local_time;
    }
}
