//! Device-model registry keyed by module name.
//!
//! Models are kept in registration order. The table is small (at most
//! [`MAX_MODELS`] entries), so lookup is a linear scan under a read lock,
//! the same trade-off the range table makes.

use std::sync::Arc;
use std::vec::Vec;

use axerrno::{AxError, AxResult, ax_err};
use spin::RwLock;

use crate::device::DeviceModel;
use crate::protocol::module_name;
use crate::wrapper::{ModelId, ModelWrapper};

/// Maximum number of registered models.
pub const MAX_MODELS: usize = 32;

/// Holds every registered model.
///
/// # Lifecycle
///
/// - `register_model()` validates the name, runs `init` and publishes the model.
/// - `shutdown()` retires every model in registration order: it stops new
///   requests, waits for in-flight ones and calls `cleanup` exactly once.
pub struct ModelRegistry {
    models: RwLock<Vec<Arc<ModelWrapper>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(Vec::new()),
        }
    }

    /// Registers a model under its own name and runs its `init`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the name is empty or longer than 31 bytes.
    /// - `AlreadyExists` if a model with the same name is registered.
    /// - `NoMemory` if the registry is full.
    /// - Whatever `init` returns; the model is then not registered.
    pub fn register_model(&self, model: Arc<dyn DeviceModel>) -> AxResult<ModelId> {
        let name = module_name(model.name())?;

        let mut models = self.models.write();
        if models.iter().any(|w| w.name() == name.as_str()) {
            return ax_err!(AlreadyExists, "model name already registered");
        }
        if models.len() >= MAX_MODELS {
            return ax_err!(NoMemory, "model registry is full");
        }

        // `init` may start a background thread; nothing it does touches the
        // registry, so it is safe to run under the write lock.
        if let Err(err) = model.init() {
            warn!("model {} failed to initialize: {:?}", name, err);
            return Err(err);
        }

        let id = ModelId(models.len());
        models.push(Arc::new(ModelWrapper::new(id, name, model)));
        info!("registered model {} as {:?}", name, id);
        Ok(id)
    }

    /// Finds an active model by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<ModelWrapper>> {
        self.models
            .read()
            .iter()
            .find(|w| w.name() == name)
            .cloned()
    }

    /// Retires every model in registration order.
    ///
    /// Idempotent: a second call finds every model already retired.
    pub fn shutdown(&self) {
        let models: Vec<_> = self.models.read().iter().cloned().collect();
        for wrapper in models {
            if wrapper.retire() {
                debug!("model {} cleaned up", wrapper.name());
            }
        }
    }

    /// Names of registered models in registration order.
    pub fn list_models(&self) -> Vec<String> {
        self.models
            .read()
            .iter()
            .map(|w| String::from(w.name()))
            .collect()
    }

    /// `(reads, writes, errors)` for the named model.
    pub fn model_stats(&self, name: &str) -> AxResult<(u64, u64, u64)> {
        let wrapper = self.lookup(name).ok_or(AxError::NotFound)?;
        let stats = wrapper.stats();
        Ok((stats.reads(), stats.writes(), stats.errors()))
    }

    pub fn model_count(&self) -> usize {
        self.models.read().len()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AccessWidth;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Named {
        name: String,
        fail_init: bool,
        cleanups: AtomicUsize,
    }

    impl Named {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                fail_init: false,
                cleanups: AtomicUsize::new(0),
            })
        }
    }

    impl DeviceModel for Named {
        fn name(&self) -> &str {
            &self.name
        }
        fn init(&self) -> AxResult {
            if self.fail_init {
                Err(AxError::BadState)
            } else {
                Ok(())
            }
        }
        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
        fn register_read(&self, addr: usize, _width: AccessWidth) -> u32 {
            addr as u32
        }
        fn register_write(&self, _addr: usize, _width: AccessWidth, _value: u32) -> AxResult {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ModelRegistry::new();
        let id = registry.register_model(Named::new("uart")).unwrap();
        assert_eq!(id, ModelId(0));
        assert!(registry.lookup("uart").is_some());
        assert!(registry.lookup("dma").is_none());
        assert_eq!(registry.list_models(), vec![String::from("uart")]);
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let registry = ModelRegistry::new();
        assert_eq!(
            registry.register_model(Named::new("")).unwrap_err(),
            AxError::InvalidInput
        );
        assert_eq!(
            registry.register_model(Named::new(&"n".repeat(32))).unwrap_err(),
            AxError::InvalidInput
        );
        registry.register_model(Named::new("uart")).unwrap();
        assert_eq!(
            registry.register_model(Named::new("uart")).unwrap_err(),
            AxError::AlreadyExists
        );
    }

    #[test]
    fn test_register_capacity() {
        let registry = ModelRegistry::new();
        for i in 0..MAX_MODELS {
            registry.register_model(Named::new(&format!("m{i}"))).unwrap();
        }
        assert_eq!(
            registry.register_model(Named::new("extra")).unwrap_err(),
            AxError::NoMemory
        );
    }

    #[test]
    fn test_failed_init_is_not_registered() {
        let registry = ModelRegistry::new();
        let model = Arc::new(Named {
            name: "broken".into(),
            fail_init: true,
            cleanups: AtomicUsize::new(0),
        });
        assert!(registry.register_model(model).is_err());
        assert_eq!(registry.model_count(), 0);
    }

    #[test]
    fn test_shutdown_cleans_up_once() {
        let registry = ModelRegistry::new();
        let a = Named::new("a");
        let b = Named::new("b");
        registry.register_model(a.clone()).unwrap();
        registry.register_model(b.clone()).unwrap();
        registry.shutdown();
        registry.shutdown();
        assert_eq!(a.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(b.cleanups.load(Ordering::SeqCst), 1);
    }
}
