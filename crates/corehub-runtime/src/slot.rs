//! Background thread owning one engine instance.
//!
//! The body passed to [`InstanceSlot::launch`] runs on a named thread:
//! it constructs and starts the engine, reports the startup outcome, blocks
//! on the cancellation token, then tears the engine down. The slot keeps the
//! join handle and an exit channel so a stop can wait a bounded time.

use crate::cancel::CancellationToken;
use crate::RuntimeError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// How long a failed launch waits for its thread before detaching it.
const FAILED_LAUNCH_REAP: Duration = Duration::from_secs(1);

/// One-shot channel back to the launching thread.
#[derive(Debug)]
pub struct StartupReporter {
    tx: Option<Sender<Result<(), RuntimeError>>>,
}

impl StartupReporter {
    /// Signal that the engine is up. Later calls are ignored.
    pub fn ready(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    pub fn is_reported(&self) -> bool {
        self.tx.is_none()
    }

    fn fail(&mut self, err: RuntimeError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

struct ActiveInstance {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    exited: Receiver<()>,
    handle: JoinHandle<()>,
}

impl ActiveInstance {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait up to `grace` for the thread to exit. Returns `false` when the
    /// thread was abandoned.
    fn reap(self, grace: Duration) -> bool {
        match self.exited.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    error!("instance thread terminated abnormally");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Holds at most one background engine instance.
pub struct InstanceSlot {
    label: String,
    active: Mutex<Option<ActiveInstance>>,
}

impl InstanceSlot {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            active: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `body` on a fresh thread bound to `token` and wait at most
    /// `startup_timeout` for its startup report.
    ///
    /// A report that is still pending when the window closes counts as a
    /// successful, scheduled start.
    pub fn launch<F>(
        &self,
        token: CancellationToken,
        startup_timeout: Duration,
        body: F,
    ) -> Result<(), RuntimeError>
    where
        F: FnOnce(&CancellationToken, &mut StartupReporter) -> Result<(), RuntimeError>
            + Send
            + 'static,
    {
        let mut active = self.lock();
        if let Some(current) = active.take() {
            if !current.is_finished() {
                *active = Some(current);
                return Err(RuntimeError::AlreadyRunning(self.label.clone()));
            }
            current.reap(Duration::ZERO);
        }

        let (startup_tx, startup_rx) = mpsc::channel();
        let (exit_tx, exited) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let handle = {
            let token = token.clone();
            let finished = Arc::clone(&finished);
            let label = self.label.clone();
            thread::Builder::new()
                .name(format!("corehub-{label}"))
                .spawn(move || {
                    let mut reporter = StartupReporter {
                        tx: Some(startup_tx),
                    };
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| body(&token, &mut reporter)))
                            .unwrap_or_else(|payload| {
                                let msg = panic_message(payload.as_ref());
                                error!("{label} instance thread panicked: {msg}");
                                Err(RuntimeError::Panicked(msg))
                            });
                    match outcome {
                        Ok(()) => debug!("{label} instance thread exited"),
                        Err(e) if reporter.is_reported() => {
                            error!("{label} instance exited with error: {e}");
                        }
                        Err(e) => reporter.fail(e),
                    }
                    finished.store(true, Ordering::SeqCst);
                    let _ = exit_tx.send(());
                })?
        };

        let instance = ActiveInstance {
            token: token.clone(),
            finished,
            exited,
            handle,
        };

        match startup_rx.recv_timeout(startup_timeout) {
            Ok(Ok(())) => {
                debug!("{} instance reported ready", self.label);
                *active = Some(instance);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(
                    "{} startup still pending after {startup_timeout:?}; treating as scheduled",
                    self.label
                );
                *active = Some(instance);
                Ok(())
            }
            Ok(Err(e)) => {
                token.cancel();
                instance.reap(FAILED_LAUNCH_REAP);
                Err(e)
            }
            Err(RecvTimeoutError::Disconnected) => {
                token.cancel();
                instance.reap(FAILED_LAUNCH_REAP);
                Err(RuntimeError::StartFailed(format!(
                    "{} instance exited before reporting startup",
                    self.label
                )))
            }
        }
    }

    /// Cancel the current instance and wait at most `grace` for its thread.
    ///
    /// No-op when nothing is running. When the bound elapses the instance is
    /// abandoned and `StopTimedOut` is returned; the slot is empty either way.
    pub fn halt(&self, grace: Duration) -> Result<(), RuntimeError> {
        let Some(instance) = self.lock().take() else {
            return Ok(());
        };
        instance.token.cancel();
        if instance.reap(grace) {
            debug!("{} instance stopped", self.label);
            Ok(())
        } else {
            warn!(
                "{} instance did not exit within {grace:?}; abandoning it",
                self.label
            );
            Err(RuntimeError::StopTimedOut(self.label.clone()))
        }
    }

    /// Whether an instance thread is alive in this slot.
    pub fn is_active(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|instance| !instance.is_finished())
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveInstance>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const STARTUP: Duration = Duration::from_millis(500);
    const GRACE: Duration = Duration::from_secs(2);

    fn run_until_cancelled(
        token: &CancellationToken,
        reporter: &mut StartupReporter,
    ) -> Result<(), RuntimeError> {
        reporter.ready();
        token.wait();
        Ok(())
    }

    #[test]
    fn launch_and_halt() {
        let slot = InstanceSlot::new("test");
        let token = CancellationToken::new();
        slot.launch(token.clone(), STARTUP, run_until_cancelled)
            .unwrap();
        assert!(slot.is_active());

        slot.halt(GRACE).unwrap();
        assert!(!slot.is_active());
        assert!(token.is_cancelled());
    }

    #[test]
    fn halt_when_empty_is_a_noop() {
        let slot = InstanceSlot::new("test");
        slot.halt(GRACE).unwrap();
        slot.halt(GRACE).unwrap();
    }

    #[test]
    fn second_launch_is_rejected_while_active() {
        let slot = InstanceSlot::new("test");
        slot.launch(CancellationToken::new(), STARTUP, run_until_cancelled)
            .unwrap();
        let err = slot
            .launch(CancellationToken::new(), STARTUP, run_until_cancelled)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyRunning(_)));
        slot.halt(GRACE).unwrap();
    }

    #[test]
    fn startup_error_is_returned_and_token_cancelled() {
        let slot = InstanceSlot::new("test");
        let token = CancellationToken::new();
        let err = slot
            .launch(token.clone(), STARTUP, |_, _| {
                Err(RuntimeError::StartFailed("bind: address in use".to_owned()))
            })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed(ref m) if m.contains("address in use")));
        assert!(token.is_cancelled());
        assert!(!slot.is_active());
    }

    #[test]
    fn panic_before_ready_is_reported() {
        let slot = InstanceSlot::new("test");
        let err = slot
            .launch(CancellationToken::new(), STARTUP, |_, _| {
                panic!("engine constructor exploded")
            })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Panicked(ref m) if m.contains("exploded")));
        assert!(!slot.is_active());

        // The slot stays usable after a panic.
        slot.launch(CancellationToken::new(), STARTUP, run_until_cancelled)
            .unwrap();
        slot.halt(GRACE).unwrap();
    }

    #[test]
    fn panic_after_ready_clears_the_slot() {
        let slot = InstanceSlot::new("test");
        slot.launch(CancellationToken::new(), STARTUP, |_, reporter| {
            reporter.ready();
            thread::sleep(Duration::from_millis(20));
            panic!("late failure")
        })
        .unwrap();

        let deadline = Instant::now() + GRACE;
        while slot.is_active() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!slot.is_active());
        slot.halt(GRACE).unwrap();
    }

    #[test]
    fn pending_startup_counts_as_scheduled() {
        let slot = InstanceSlot::new("test");
        slot.launch(CancellationToken::new(), Duration::from_millis(20), |token, reporter| {
            thread::sleep(Duration::from_millis(100));
            reporter.ready();
            token.wait();
            Ok(())
        })
        .unwrap();
        assert!(slot.is_active());
        slot.halt(GRACE).unwrap();
    }

    #[test]
    fn halt_abandons_a_stuck_instance() {
        let slot = InstanceSlot::new("stuck");
        let release = CancellationToken::new();
        let hold = release.clone();
        slot.launch(CancellationToken::new(), STARTUP, move |_, reporter| {
            reporter.ready();
            // Ignores its own token.
            hold.wait();
            Ok(())
        })
        .unwrap();

        let start = Instant::now();
        let err = slot.halt(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, RuntimeError::StopTimedOut(_)));
        assert!(start.elapsed() < GRACE);
        assert!(!slot.is_active());
        release.cancel();
    }
}
