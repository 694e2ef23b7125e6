//! External control of a running session (pause, resume, stop).

use std::sync::Arc;

use tokio::sync::watch;

use super::SessionStatus;

/// Requested run mode, observed by the runner between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

/// Cloneable handle to steer one session from outside its loop.
#[derive(Debug, Clone)]
pub struct SessionControl {
    signal: Arc<watch::Sender<ControlSignal>>,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(ControlSignal::Run);
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            signal: Arc::new(signal),
            status: Arc::new(status),
        }
    }

    /// Ask the session to pause. Only accepted while it is running.
    pub fn pause(&self) -> bool {
        if !self.status.borrow().is_running() {
            return false;
        }
        self.signal.send_replace(ControlSignal::Pause);
        true
    }

    /// Resume a paused session.
    pub fn resume(&self) -> bool {
        if *self.signal.borrow() != ControlSignal::Pause {
            return false;
        }
        self.signal.send_replace(ControlSignal::Run);
        true
    }

    /// Stop the session; it completes at the next await point.
    pub fn stop(&self) {
        self.signal.send_replace(ControlSignal::Stop);
    }

    pub fn signal(&self) -> ControlSignal {
        *self.signal.borrow()
    }

    /// Latest status published by the runner.
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn signals(&self) -> watch::Receiver<ControlSignal> {
        self.signal.subscribe()
    }

    pub(crate) fn publish_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }
}

/// Resolve once a stop has been requested; never resolves otherwise.
pub(crate) async fn stopped(signals: &mut watch::Receiver<ControlSignal>) {
    loop {
        if *signals.borrow_and_update() == ControlSignal::Stop {
            return;
        }
        if signals.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pause_rejected_unless_running() {
        let control = SessionControl::new();
        assert!(!control.pause());

        control.publish_status(SessionStatus::Thinking);
        assert!(control.pause());
        assert_eq!(control.signal(), ControlSignal::Pause);

        assert!(control.resume());
        assert_eq!(control.signal(), ControlSignal::Run);
        assert!(!control.resume());
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_stop() {
        let control = SessionControl::new();
        let mut signals = control.signals();

        let waiter = tokio::spawn(async move { stopped(&mut signals).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        control.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_stopped_pending_until_stop() {
        let control = SessionControl::new();
        let mut signals = control.signals();
        let mut fut = tokio_test::task::spawn(stopped(&mut signals));
        tokio_test::assert_pending!(fut.poll());

        control.pause();
        tokio_test::assert_pending!(fut.poll());

        control.stop();
        assert!(fut.is_woken());
        tokio_test::assert_ready!(fut.poll());
    }
}
