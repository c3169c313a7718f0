use super::Endpoint;
use crate::error::CollectorError;
use parking_lot::{Condvar, Mutex};
use std::{sync::Arc, time::Duration};

#[derive(Debug)]
enum State {
    Pending,
    Ready(Arc<Endpoint>),
    Failed(String),
    Stopped,
}

/// One-shot signal carrying the endpoint chosen by the role task to waiting callers.
#[derive(Debug)]
pub struct Readiness {
    state: Mutex<State>,
    changed: Condvar,
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            changed: Condvar::new(),
        }
    }

    pub fn set_ready(&self, endpoint: Arc<Endpoint>) {
        self.transition(State::Ready(endpoint));
    }

    pub fn set_failed(&self, reason: String) {
        self.transition(State::Failed(reason));
    }

    pub fn set_stopped(&self) {
        self.transition(State::Stopped);
    }

    fn transition(&self, next: State) {
        let mut state = self.state.lock();
        // A failure stays visible to late callers rather than being masked by shutdown.
        if matches!((&*state, &next), (State::Failed(_), State::Stopped)) {
            return;
        }
        *state = next;
        self.changed.notify_all();
    }

    /// The endpoint, if one is currently running.
    pub fn current(&self) -> Option<Arc<Endpoint>> {
        match &*self.state.lock() {
            State::Ready(endpoint) => Some(Arc::clone(endpoint)),
            _ => None,
        }
    }

    /// Blocks until the endpoint is ready, has failed, or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Arc<Endpoint>, CollectorError> {
        let mut state = self.state.lock();
        let pending = |state: &mut State| matches!(state, State::Pending);
        match timeout {
            Some(timeout) => {
                self.changed.wait_while_for(&mut state, pending, timeout);
            }
            None => self.changed.wait_while(&mut state, pending),
        }

        match &*state {
            State::Ready(endpoint) => Ok(Arc::clone(endpoint)),
            State::Failed(reason) => Err(CollectorError::StartFailed(reason.clone())),
            State::Stopped => Err(CollectorError::Stopped),
            State::Pending => Err(CollectorError::Timeout(timeout.unwrap_or_default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pending_wait_times_out() {
        let readiness = Readiness::new();
        let timeout = Duration::from_millis(20);
        assert!(matches!(
            readiness.wait(Some(timeout)),
            Err(CollectorError::Timeout(t)) if t == timeout
        ));
    }

    #[test]
    fn failure_wakes_waiters_and_survives_stop() {
        let readiness = Arc::new(Readiness::new());
        let waiter = {
            let readiness = Arc::clone(&readiness);
            thread::spawn(move || readiness.wait(None))
        };
        readiness.set_failed("connection refused".into());
        assert!(matches!(
            waiter.join().unwrap(),
            Err(CollectorError::StartFailed(reason)) if reason == "connection refused"
        ));

        readiness.set_stopped();
        assert!(matches!(
            readiness.wait(Some(Duration::ZERO)),
            Err(CollectorError::StartFailed(_))
        ));
        assert!(readiness.current().is_none());
    }

    #[test]
    fn stopped_is_reported() {
        let readiness = Readiness::new();
        readiness.set_stopped();
        assert!(matches!(readiness.wait(None), Err(CollectorError::Stopped)));
    }
}
