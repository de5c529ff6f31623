//! Interrupt dispatch table: simulated IRQ number to driver handler.
//!
//! The table is read from signal context, so lookups take only a read lock
//! on a fixed-capacity array and never allocate. Registration takes the
//! write lock under an [`IrqGuard`].

use std::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arrayvec::ArrayVec;
use axerrno::{AxError, AxResult, ax_err, ax_err_type};
use spin::RwLock;

use crate::signal::IrqGuard;

/// Maximum number of IRQ bindings.
pub const MAX_INTERRUPTS: usize = 32;

/// A driver interrupt service routine. Receives the IRQ number.
pub type InterruptHandler = Arc<dyn Fn(u32) + Send + Sync>;

struct IrqBinding {
    irq: u32,
    handler: InterruptHandler,
    enabled: AtomicBool,
}

/// Maps simulated IRQ numbers to handlers with an enable flag each.
///
/// Dispatching a disabled line is a successful no-op; dispatching a line
/// without a handler fails. Both are counted as dropped, never fatal.
pub struct InterruptTable {
    bindings: RwLock<ArrayVec<IrqBinding, MAX_INTERRUPTS>>,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl InterruptTable {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(ArrayVec::new()),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Installs or replaces the handler of `irq` and enables the line.
    ///
    /// Fails with `NoMemory` if `irq` is new and the table is full.
    pub fn register(&self, irq: u32, handler: InterruptHandler) -> AxResult {
        let _irq = IrqGuard::new();
        let mut bindings = self.bindings.write();
        if let Some(binding) = bindings.iter_mut().find(|b| b.irq == irq) {
            binding.handler = handler;
            binding.enabled.store(true, Ordering::Release);
            debug!("irq {} handler replaced", irq);
            return Ok(());
        }
        if bindings.is_full() {
            return ax_err!(NoMemory, "interrupt table is full");
        }
        bindings.push(IrqBinding {
            irq,
            handler,
            enabled: AtomicBool::new(true),
        });
        debug!("irq {} registered", irq);
        Ok(())
    }

    fn set_enabled(&self, irq: u32, enabled: bool) -> AxResult {
        let bindings = self.bindings.read();
        let binding = bindings
            .iter()
            .find(|b| b.irq == irq)
            .ok_or_else(|| ax_err_type!(NotFound, "unknown irq"))?;
        binding.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    pub fn enable(&self, irq: u32) -> AxResult {
        self.set_enabled(irq, true)?;
        debug!("irq {} enabled", irq);
        Ok(())
    }

    /// Disables `irq`. Disabling an already disabled line succeeds.
    pub fn disable(&self, irq: u32) -> AxResult {
        self.set_enabled(irq, false)?;
        debug!("irq {} disabled", irq);
        Ok(())
    }

    pub fn is_enabled(&self, irq: u32) -> Option<bool> {
        self.bindings
            .read()
            .iter()
            .find(|b| b.irq == irq)
            .map(|b| b.enabled.load(Ordering::Acquire))
    }

    /// Runs the handler of `irq` if the line is enabled.
    ///
    /// Returns whether the handler ran; a disabled line is a no-op. Fails
    /// with `NotFound` if `irq` has no handler.
    ///
    /// Async-signal-safe: no logging, no allocation. The handler runs after
    /// the table lock is released, so it may itself touch the table.
    pub fn try_dispatch(&self, irq: u32) -> AxResult<bool> {
        let handler = {
            let bindings = self.bindings.read();
            match bindings.iter().find(|b| b.irq == irq) {
                Some(b) if b.enabled.load(Ordering::Acquire) => b.handler.clone(),
                Some(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(false);
                }
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(AxError::NotFound);
                }
            }
        };
        handler(irq);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// [`try_dispatch`](Self::try_dispatch) with diagnostics, for normal
    /// thread context.
    pub fn dispatch(&self, irq: u32) -> AxResult<bool> {
        let result = self.try_dispatch(irq);
        match result {
            Ok(true) => trace!("irq {} dispatched", irq),
            Ok(false) => debug!("irq {} masked", irq),
            Err(_) => warn!("irq {} has no handler", irq),
        }
        result
    }

    /// `(dispatched, dropped)` counts.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.dispatched.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    fn counting(counter: &Arc<AtomicU32>) -> InterruptHandler {
        let counter = counter.clone();
        Arc::new(move |_irq| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_registered_irq_is_enabled() {
        let table = InterruptTable::new();
        let hits = Arc::new(AtomicU32::new(0));
        table.register(5, counting(&hits)).unwrap();
        assert_eq!(table.is_enabled(5), Some(true));
        assert_eq!(table.dispatch(5), Ok(true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_dispatch_is_noop() {
        let table = InterruptTable::new();
        let hits = Arc::new(AtomicU32::new(0));
        table.register(5, counting(&hits)).unwrap();

        table.disable(5).unwrap();
        table.disable(5).unwrap();
        assert_eq!(table.dispatch(5), Ok(false));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        table.enable(5).unwrap();
        assert_eq!(table.dispatch(5), Ok(true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(table.stats(), (1, 1));
    }

    #[test]
    fn test_register_replaces_and_reenables() {
        let table = InterruptTable::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        table.register(7, counting(&first)).unwrap();
        table.disable(7).unwrap();
        table.register(7, counting(&second)).unwrap();
        assert_eq!(table.is_enabled(7), Some(true));
        table.dispatch(7).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_irq() {
        let table = InterruptTable::new();
        assert_eq!(table.enable(8), Err(AxError::NotFound));
        assert_eq!(table.disable(8), Err(AxError::NotFound));
        assert_eq!(table.dispatch(8), Err(AxError::NotFound));
        assert_eq!(table.is_enabled(8), None);
    }

    #[test]
    fn test_table_capacity() {
        let table = InterruptTable::new();
        let hits = Arc::new(AtomicU32::new(0));
        for irq in 0..MAX_INTERRUPTS as u32 {
            table.register(irq, counting(&hits)).unwrap();
        }
        assert_eq!(
            table.register(100, counting(&hits)).unwrap_err(),
            AxError::NoMemory
        );
    }

    #[test]
    fn test_handler_receives_irq_number() {
        let table = InterruptTable::new();
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        table
            .register(12, Arc::new(move |irq| s.store(irq, Ordering::SeqCst)))
            .unwrap();
        table.enable(12).unwrap();
        table.dispatch(12).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 12);
    }
}
