//! Storage capabilities: the minimal interface every storage provider
//! implements, plus the process-wide provider registry.

mod file_system;
mod invalid;
mod registry;
mod stream;

use std::any::{type_name, TypeId};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{Result, StorageError};

pub use file_system::FileSystemStorageAccess;
pub use invalid::InvalidStorageAccess;
pub use registry::{
    register, registry, resolve, set_default, unregister, StorageAccessRegistry,
};
pub use stream::{ReadOnlyStream, StorageStream, StreamCapabilities};

/// A provider of storage operations over paths within the provider.
///
/// Paths are strings using `/` as separator; see [`crate::path`].
pub trait StorageAccess: Send + Sync + 'static {
    fn open(&self, path: &str) -> Result<Box<dyn StorageStream>>;

    /// Open `path` for writing, creating or truncating it.
    fn create(&self, path: &str) -> Result<Box<dyn StorageStream>> {
        Err(StorageError::not_supported(format!(
            "{} cannot create {path}",
            self.provider_name()
        )))
    }

    fn exists(&self, path: &str) -> bool;

    fn size(&self, path: &str) -> Result<u64>;

    fn last_modified(&self, path: &str) -> Result<SystemTime>;

    /// Identity of the concrete provider type, used by the registry to allow
    /// only one instance of each type.
    fn provider_type(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    fn provider_name(&self) -> &'static str {
        type_name::<Self>()
    }

    /// `path` made absolute within this provider, when that can be determined.
    fn absolute_path(&self, path: &str) -> Option<String> {
        crate::path::is_absolute(path).then(|| path.to_string())
    }
}

/// Make sure the local file system provider is registered and return the
/// registered instance. When it is the first provider it becomes the default.
pub fn initialize() -> Arc<dyn StorageAccess> {
    let registry = registry();
    loop {
        if let Some(provider) = registry.get::<FileSystemStorageAccess>() {
            return provider;
        }
        registry.register(Arc::new(FileSystemStorageAccess::new()));
    }
}
