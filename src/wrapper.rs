//! Registered model wrapper with lifecycle tracking, locking and statistics.

use std::sync::Arc;

use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::{AxError, AxResult};
use spin::Mutex;

use crate::device::DeviceModel;
use crate::lifecycle::ModelLifecycle;
use crate::protocol::{AccessWidth, ClockAction, ModuleName, ResetAction};
use crate::signal::IrqGuard;

/// Registration index of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelId(pub usize);

/// Per-model access counters.
#[derive(Debug, Default)]
pub struct ModelStats {
    reads: AtomicU64,
    writes: AtomicU64,
    controls: AtomicU64,
    errors: AtomicU64,
}

impl ModelStats {
    #[inline]
    fn record(&self, counter: &AtomicU64, ok: bool) {
        counter.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Clock, reset and interrupt requests.
    pub fn controls(&self) -> u64 {
        self.controls.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A model as held by the registry.
///
/// Every capability call goes through [`ModelWrapper::call`], which takes a
/// lifecycle token, serializes on the per-model lock and updates statistics.
pub struct ModelWrapper {
    inner: Arc<dyn DeviceModel>,
    name: ModuleName,
    id: ModelId,
    lifecycle: ModelLifecycle,
    lock: Mutex<()>,
    stats: ModelStats,
}

impl ModelWrapper {
    pub fn new(id: ModelId, name: ModuleName, model: Arc<dyn DeviceModel>) -> Self {
        Self {
            inner: model,
            name,
            id,
            lifecycle: ModelLifecycle::new(),
            lock: Mutex::new(()),
            stats: ModelStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> ModelId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn lifecycle(&self) -> &ModelLifecycle {
        &self.lifecycle
    }

    #[inline]
    pub fn stats(&self) -> &ModelStats {
        &self.stats
    }

    #[inline]
    pub fn inner(&self) -> &Arc<dyn DeviceModel> {
        &self.inner
    }

    /// Runs `f` against the model while holding an access token and the
    /// per-model lock. Fails with `BadState` once removal has started.
    ///
    /// Real-time signals stay blocked for the whole call, so an interrupt the
    /// model raises towards this thread is taken after the lock is released.
    fn call<T>(&self, f: impl FnOnce(&dyn DeviceModel) -> AxResult<T>) -> AxResult<T> {
        if self.lifecycle.try_begin_access().is_err() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(AxError::BadState);
        }
        let _irq = IrqGuard::new();
        let result = {
            let _guard = self.lock.lock();
            f(self.inner.as_ref())
        };
        self.lifecycle.end_access();
        result
    }

    pub fn read(&self, addr: usize, width: AccessWidth) -> AxResult<u32> {
        let result = self.call(|m| Ok(m.register_read(addr, width)));
        self.stats.record(&self.stats.reads, result.is_ok());
        result
    }

    pub fn write(&self, addr: usize, width: AccessWidth, value: u32) -> AxResult {
        let result = self.call(|m| m.register_write(addr, width, value));
        self.stats.record(&self.stats.writes, result.is_ok());
        result
    }

    pub fn clock(&self, action: ClockAction, cycles: u32) -> AxResult {
        let result = self.call(|m| m.clock(action, cycles));
        self.stats.record(&self.stats.controls, result.is_ok());
        result
    }

    pub fn reset(&self, action: ResetAction) -> AxResult {
        let result = self.call(|m| m.reset(action));
        self.stats.record(&self.stats.controls, result.is_ok());
        result
    }

    pub fn interrupt(&self, irq: u32) -> AxResult {
        let result = self.call(|m| m.interrupt(irq));
        self.stats.record(&self.stats.controls, result.is_ok());
        result
    }

    /// Stops accepting requests, waits for in-flight ones and calls the
    /// model's `cleanup`. Returns `false` if the model was already removed.
    pub fn retire(&self) -> bool {
        if !self.lifecycle.begin_removal() {
            return false;
        }
        self.lifecycle.drain();
        self.inner.cleanup();
        true
    }
}

impl core::fmt::Debug for ModelWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModelWrapper")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("lifecycle", &self.lifecycle)
            .field("stats", &self.stats)
            .finish()
    }
}
