use std::any::TypeId;
use std::sync::{Arc, OnceLock};

use log::debug;
use parking_lot::RwLock;

use super::StorageAccess;
use crate::error::{Result, StorageError};

struct Registered {
    type_id: TypeId,
    provider: Arc<dyn StorageAccess>,
}

#[derive(Default)]
struct RegistryState {
    /// Registration order; the first entry is the implicit default.
    providers: Vec<Registered>,
    explicit_default: Option<TypeId>,
}

/// At most one provider instance per concrete provider type.
///
/// The default provider is the one designated with [`set_default`], or the
/// earliest registration still present.
///
/// [`set_default`]: StorageAccessRegistry::set_default
#[derive(Default)]
pub struct StorageAccessRegistry {
    state: RwLock<RegistryState>,
}

impl StorageAccessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a provider of the same concrete type is already registered.
    pub fn register(&self, provider: Arc<dyn StorageAccess>) -> bool {
        let type_id = provider.provider_type();
        let mut state = self.state.write();
        if state.providers.iter().any(|r| r.type_id == type_id) {
            debug!("storage provider {} already registered", provider.provider_name());
            return false;
        }
        debug!("registered storage provider {}", provider.provider_name());
        state.providers.push(Registered { type_id, provider });
        true
    }

    /// Returns `false` unless this exact instance is currently registered.
    pub fn unregister(&self, provider: &Arc<dyn StorageAccess>) -> bool {
        let mut state = self.state.write();
        let Some(idx) = state
            .providers
            .iter()
            .position(|r| Arc::ptr_eq(&r.provider, provider))
        else {
            return false;
        };
        let removed = state.providers.remove(idx);
        if state.explicit_default == Some(removed.type_id) {
            state.explicit_default = None;
        }
        debug!("unregistered storage provider {}", removed.provider.provider_name());
        true
    }

    /// Designate an already registered provider as the default.
    pub fn set_default(&self, provider: &Arc<dyn StorageAccess>) -> Result<()> {
        let mut state = self.state.write();
        let Some(type_id) = state
            .providers
            .iter()
            .find(|r| Arc::ptr_eq(&r.provider, provider))
            .map(|r| r.type_id)
        else {
            return Err(StorageError::InvalidArgument(format!(
                "{} is not registered",
                provider.provider_name()
            )));
        };
        state.explicit_default = Some(type_id);
        Ok(())
    }

    /// Returns `capability` itself, or the default provider when `None`.
    pub fn resolve(
        &self,
        capability: Option<&Arc<dyn StorageAccess>>,
    ) -> Result<Arc<dyn StorageAccess>> {
        if let Some(capability) = capability {
            return Ok(Arc::clone(capability));
        }
        self.default_provider().ok_or(StorageError::NotConfigured)
    }

    pub fn default_provider(&self) -> Option<Arc<dyn StorageAccess>> {
        let state = self.state.read();
        let explicit = state
            .explicit_default
            .and_then(|id| state.providers.iter().find(|r| r.type_id == id));
        explicit
            .or_else(|| state.providers.first())
            .map(|r| Arc::clone(&r.provider))
    }

    /// Look up the registered instance of provider type `P`.
    pub fn get<P: StorageAccess>(&self) -> Option<Arc<dyn StorageAccess>> {
        let id = TypeId::of::<P>();
        let state = self.state.read();
        state.providers.iter().find(|r| r.type_id == id).map(|r| Arc::clone(&r.provider))
    }

    pub fn len(&self) -> usize {
        self.state.read().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: OnceLock<StorageAccessRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static StorageAccessRegistry {
    REGISTRY.get_or_init(StorageAccessRegistry::new)
}

pub fn register(provider: Arc<dyn StorageAccess>) -> bool {
    registry().register(provider)
}

pub fn unregister(provider: &Arc<dyn StorageAccess>) -> bool {
    registry().unregister(provider)
}

pub fn set_default(provider: &Arc<dyn StorageAccess>) -> Result<()> {
    registry().set_default(provider)
}

pub fn resolve(capability: Option<&Arc<dyn StorageAccess>>) -> Result<Arc<dyn StorageAccess>> {
    registry().resolve(capability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{FileSystemStorageAccess, InvalidStorageAccess};
    use crate::error::ErrorCategory;

    #[test]
    fn one_instance_per_type() {
        let registry = StorageAccessRegistry::new();
        assert!(registry.register(Arc::new(FileSystemStorageAccess::new())));
        assert!(!registry.register(Arc::new(FileSystemStorageAccess::new())));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn first_registration_is_default() {
        let registry = StorageAccessRegistry::new();
        assert!(matches!(
            registry.resolve(None).map(|_| ()),
            Err(StorageError::NotConfigured)
        ));

        let fs: Arc<dyn StorageAccess> = Arc::new(FileSystemStorageAccess::new());
        let invalid: Arc<dyn StorageAccess> = Arc::new(InvalidStorageAccess);
        assert!(registry.register(Arc::clone(&fs)));
        assert!(registry.register(Arc::clone(&invalid)));

        assert!(Arc::ptr_eq(&registry.resolve(None).unwrap(), &fs));
        assert!(Arc::ptr_eq(&registry.resolve(Some(&invalid)).unwrap(), &invalid));

        registry.set_default(&invalid).unwrap();
        assert!(Arc::ptr_eq(&registry.resolve(None).unwrap(), &invalid));
    }

    #[test]
    fn unregister_requires_same_instance() {
        let registry = StorageAccessRegistry::new();
        let fs: Arc<dyn StorageAccess> = Arc::new(FileSystemStorageAccess::new());
        let other: Arc<dyn StorageAccess> = Arc::new(FileSystemStorageAccess::new());
        assert!(registry.register(Arc::clone(&fs)));
        assert!(!registry.unregister(&other));
        assert!(registry.unregister(&fs));
        assert!(registry.is_empty());
        let err = registry.resolve(None).err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Resolution);
    }

    #[test]
    fn concurrent_registration_admits_one() {
        let registry = Arc::new(StorageAccessRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.register(Arc::new(FileSystemStorageAccess::new()))
                })
            })
            .collect();
        let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();
        assert_eq!(wins, 1);
    }
}
