use std::sync::OnceLock;

use log::debug;
use parking_lot::RwLock;

use super::backend::{ArchiveBackend, BackendContext};
use super::{
    gzip, gzip_multi, tar_archive, zip_buffered, zip_native, ArchiveFormat, ArchiveImplementation,
};
use crate::access::StorageStream;
use crate::error::{Result, StorageError};

/// Builds a backend over a stream it takes ownership of.
pub type ArchiveFactory =
    fn(Box<dyn StorageStream>, BackendContext<'_>) -> Result<Box<dyn ArchiveBackend>>;

/// Factory lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressedArchiveIdentifier {
    pub format: ArchiveFormat,
    pub implementation: ArchiveImplementation,
}

impl CompressedArchiveIdentifier {
    pub fn new(format: ArchiveFormat, implementation: ArchiveImplementation) -> Self {
        Self { format, implementation }
    }

    /// Same format, and either the same implementation or `Any` on one side.
    pub fn matches(&self, other: &Self) -> bool {
        self.format == other.format
            && (self.implementation == other.implementation
                || self.implementation == ArchiveImplementation::Any
                || other.implementation == ArchiveImplementation::Any)
    }
}

struct Registration {
    id: CompressedArchiveIdentifier,
    factory: ArchiveFactory,
}

/// Map from `(format, implementation)` to backend factory.
///
/// Lookup tries the exact pair, then falls back to the first registered
/// implementation of the format.
#[derive(Default)]
pub struct ArchiveFactoryRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl ArchiveFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in backend. Native implementations are
    /// registered first and so win `Any` lookups.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        let builtin: [(ArchiveFormat, ArchiveImplementation, ArchiveFactory); 5] = [
            (ArchiveFormat::Zip, ArchiveImplementation::Native, zip_native::open),
            (ArchiveFormat::Zip, ArchiveImplementation::Buffered, zip_buffered::open),
            (ArchiveFormat::GZip, ArchiveImplementation::Native, gzip::open),
            (ArchiveFormat::GZip, ArchiveImplementation::Buffered, gzip_multi::open),
            (ArchiveFormat::Tar, ArchiveImplementation::Native, tar_archive::open),
        ];
        for (format, implementation, factory) in builtin {
            // Built-in pairs are concrete and distinct.
            let _ = registry.register(format, implementation, factory);
        }
        registry
    }

    /// Returns `Ok(false)` if the pair is already registered. Registering
    /// the `Any` wildcard is an argument error.
    pub fn register(
        &self,
        format: ArchiveFormat,
        implementation: ArchiveImplementation,
        factory: ArchiveFactory,
    ) -> Result<bool> {
        if implementation == ArchiveImplementation::Any {
            return Err(StorageError::InvalidArgument(format!(
                "a concrete implementation is required to register a {format:?} factory"
            )));
        }
        let id = CompressedArchiveIdentifier::new(format, implementation);
        let mut registrations = self.registrations.write();
        if registrations.iter().any(|r| r.id == id) {
            return Ok(false);
        }
        debug!("registered {:?}/{:?} archive factory", format, implementation);
        registrations.push(Registration { id, factory });
        Ok(true)
    }

    pub fn unregister(&self, format: ArchiveFormat, implementation: ArchiveImplementation) -> bool {
        let id = CompressedArchiveIdentifier::new(format, implementation);
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// The factory for `(format, implementation)`, with the implementation it
    /// actually resolved to.
    pub fn lookup(
        &self,
        format: ArchiveFormat,
        implementation: ArchiveImplementation,
    ) -> Result<(ArchiveImplementation, ArchiveFactory)> {
        let registrations = self.registrations.read();
        let exact = CompressedArchiveIdentifier::new(format, implementation);
        let wildcard = CompressedArchiveIdentifier::new(format, ArchiveImplementation::Any);
        registrations
            .iter()
            .find(|r| r.id == exact)
            .or_else(|| registrations.iter().find(|r| r.id.matches(&wildcard)))
            .map(|r| (r.id.implementation, r.factory))
            .ok_or_else(|| StorageError::UnsupportedFormat {
                format,
                requested: implementation,
                available: registrations
                    .iter()
                    .filter(|r| r.id.format == format)
                    .map(|r| r.id.implementation)
                    .collect(),
            })
    }

    pub fn implementations(&self, format: ArchiveFormat) -> Vec<ArchiveImplementation> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.id.format == format)
            .map(|r| r.id.implementation)
            .collect()
    }
}

/// The process-wide factory registry, initialised with the built-in backends.
pub fn factories() -> &'static ArchiveFactoryRegistry {
    static REGISTRY: OnceLock<ArchiveFactoryRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ArchiveFactoryRegistry::with_builtin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn any_falls_back_to_registered_implementation() {
        let registry = ArchiveFactoryRegistry::new();
        assert!(registry
            .register(ArchiveFormat::Zip, ArchiveImplementation::Buffered, zip_buffered::open)
            .unwrap());

        let (resolved, _) = registry
            .lookup(ArchiveFormat::Zip, ArchiveImplementation::Native)
            .unwrap();
        assert_eq!(resolved, ArchiveImplementation::Buffered);
        let (resolved, _) = registry
            .lookup(ArchiveFormat::Zip, ArchiveImplementation::Any)
            .unwrap();
        assert_eq!(resolved, ArchiveImplementation::Buffered);
    }

    #[test]
    fn exact_match_wins() {
        let registry = ArchiveFactoryRegistry::with_builtin();
        let (resolved, _) = registry
            .lookup(ArchiveFormat::Zip, ArchiveImplementation::Buffered)
            .unwrap();
        assert_eq!(resolved, ArchiveImplementation::Buffered);
        let (resolved, _) = registry
            .lookup(ArchiveFormat::Zip, ArchiveImplementation::Any)
            .unwrap();
        assert_eq!(resolved, ArchiveImplementation::Native);
    }

    #[test]
    fn wildcard_registration_is_rejected() {
        let registry = ArchiveFactoryRegistry::new();
        let err = registry
            .register(ArchiveFormat::Tar, ArchiveImplementation::Any, tar_archive::open)
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidArgument);
        assert!(registry
            .register(ArchiveFormat::Tar, ArchiveImplementation::Native, tar_archive::open)
            .unwrap());
        assert!(!registry
            .register(ArchiveFormat::Tar, ArchiveImplementation::Native, tar_archive::open)
            .unwrap());
    }

    #[test]
    fn missing_format_reports_context() {
        let registry = ArchiveFactoryRegistry::new();
        registry
            .register(ArchiveFormat::Zip, ArchiveImplementation::Native, zip_native::open)
            .unwrap();
        match registry.lookup(ArchiveFormat::GZip, ArchiveImplementation::Native) {
            Err(StorageError::UnsupportedFormat { format, requested, available }) => {
                assert_eq!(format, ArchiveFormat::GZip);
                assert_eq!(requested, ArchiveImplementation::Native);
                assert!(available.is_empty());
            }
            other => panic!("unexpected lookup result: {:?}", other.map(|(i, _)| i)),
        }
        assert!(registry.unregister(ArchiveFormat::Zip, ArchiveImplementation::Native));
        assert!(registry.implementations(ArchiveFormat::Zip).is_empty());
    }
}
