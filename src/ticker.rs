//! Periodic background worker used by device models to simulate hardware
//! progress (receive traffic, DMA transfers).

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{AxError, AxResult};

use crate::signal::{self, IrqGuard};

/// A named thread that calls a closure once per `interval`.
///
/// The closure receives the tick number, starting at 1. [`stop`](Self::stop)
/// returns within one interval plus the duration of the running tick.
pub struct Ticker {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    thread: libc::pthread_t,
}

impl Ticker {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> AxResult<Self>
    where
        F: FnMut(u64) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                // Notification signals target driver threads only.
                let _irq = IrqGuard::new();
                let _ = tx.send(signal::current_thread());
                let mut count = 0u64;
                let mut deadline = Instant::now() + interval;
                while !flag.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < deadline {
                        thread::park_timeout(deadline - now);
                        continue;
                    }
                    count += 1;
                    tick(count);
                    deadline += interval;
                    // Skip missed ticks instead of bursting.
                    let now = Instant::now();
                    if deadline < now {
                        deadline = now + interval;
                    }
                }
            })
            .map_err(|_| AxError::NoMemory)?;
        let thread = rx.recv().map_err(|_| AxError::BadState)?;
        debug!("ticker {} started ({:?})", name, interval);
        Ok(Self {
            name: name.into(),
            stop,
            handle: Some(handle),
            thread,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops and joins the thread. Idempotent.
    ///
    /// Calling this from the ticker's own closure only raises the stop flag.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if signal::current_thread() == self.thread {
            return;
        }
        handle.thread().unpark();
        if handle.join().is_err() {
            error!("ticker {} panicked", self.name);
        } else {
            debug!("ticker {} stopped", self.name);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    #[test]
    fn test_ticks_until_stopped() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let mut ticker = Ticker::spawn("test-ticker", Duration::from_millis(1), move |n| {
            counter.store(n, Ordering::Release);
        })
        .unwrap();
        assert_eq!(ticker.name(), "test-ticker");
        assert!(ticker.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::Acquire) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(seen.load(Ordering::Acquire) >= 3);

        ticker.stop();
        assert!(!ticker.is_running());
        let last = seen.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(seen.load(Ordering::Acquire), last);
        ticker.stop();
    }

    #[test]
    fn test_stop_is_bounded_by_one_interval() {
        let mut ticker = Ticker::spawn("slow-ticker", Duration::from_secs(3600), |_| {}).unwrap();
        let started = Instant::now();
        ticker.stop();
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
