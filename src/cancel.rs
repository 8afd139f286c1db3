//! Cooperative cancellation and one-shot readiness
//!
//! Both primitives are latches over a `crossbeam-channel`: the sender is
//! never used to send, and firing the latch drops it. Every receiver then
//! observes a disconnect, which wakes blocked `recv`/`select!` calls at once.

use crate::error::{GeosError, Result};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Latch {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
    fired: AtomicBool,
}

impl Latch {
    fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            fired: AtomicBool::new(false),
        }
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let mut sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.take();
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Cloneable cancellation flag shared by a request and its workers
#[derive(Clone)]
pub struct CancelToken {
    latch: Arc<Latch>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            latch: Arc::new(Latch::new()),
        }
    }

    /// Cancel every clone of this token; idempotent
    pub fn cancel(&self) {
        self.latch.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.latch.is_fired()
    }

    /// `Err(Cancelled)` once the token has fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GeosError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning `Cancelled` as soon as the token fires
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        match self.latch.receiver.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(GeosError::Cancelled),
        }
    }

    /// Channel that disconnects on cancellation, for use in `select!`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.latch.receiver
    }
}

/// One-shot "finished loading" notification
#[derive(Clone)]
pub struct ReadySignal {
    latch: Arc<Latch>,
}

impl std::fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadySignal")
            .field("set", &self.is_set())
            .finish()
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        Self {
            latch: Arc::new(Latch::new()),
        }
    }

    pub fn set(&self) {
        self.latch.fire();
    }

    pub fn is_set(&self) -> bool {
        self.latch.is_fired()
    }

    /// Block until the signal is set or `cancel` fires
    ///
    /// A signal that is already set wins over a cancelled token.
    pub fn wait(&self, cancel: &CancelToken) -> Result<()> {
        if self.is_set() {
            return Ok(());
        }
        select! {
            recv(self.latch.receiver) -> _ => Ok(()),
            recv(cancel.receiver()) -> _ => {
                if self.is_set() {
                    Ok(())
                } else {
                    Err(GeosError::Cancelled)
                }
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up with `NotReady` after `timeout`
    pub fn wait_timeout(&self, cancel: &CancelToken, timeout: Duration) -> Result<()> {
        if self.is_set() {
            return Ok(());
        }
        select! {
            recv(self.latch.receiver) -> _ => Ok(()),
            recv(cancel.receiver()) -> _ => Err(GeosError::Cancelled),
            default(timeout) => Err(GeosError::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_cancel_wakes_sleep() {
        let token = CancelToken::new();
        let worker = {
            let token = token.clone();
            thread::spawn(move || token.sleep(Duration::from_secs(30)))
        };

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        token.cancel();
        assert!(matches!(worker.join().unwrap(), Err(GeosError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(token.check().is_err());
    }

    #[test]
    fn test_sleep_elapses() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)).is_ok());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_ready_signal() {
        let ready = ReadySignal::new();
        let cancel = CancelToken::new();
        assert!(!ready.is_set());

        let waiter = {
            let (ready, cancel) = (ready.clone(), cancel.clone());
            thread::spawn(move || ready.wait(&cancel))
        };
        ready.set();
        assert!(waiter.join().unwrap().is_ok());

        // Set wins even if the caller has given up since
        cancel.cancel();
        assert!(ready.wait(&cancel).is_ok());
    }

    #[test]
    fn test_wait_cancelled_or_timed_out() {
        let ready = ReadySignal::new();
        let cancel = CancelToken::new();
        assert!(matches!(
            ready.wait_timeout(&cancel, Duration::from_millis(5)),
            Err(GeosError::NotReady)
        ));
        cancel.cancel();
        assert!(matches!(ready.wait(&cancel), Err(GeosError::Cancelled)));
    }
}
