//! Module loading.
//!
//! A [`ModuleLoader`] turns a file into a [`ModuleImage`]: the module's export
//! table plus whatever keeps its code mapped. [`NativeLoader`] uses
//! `libloading`; tests substitute loaders that serve static tables.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use libloading::{Library, Symbol};
use plughost_sdk::{
    PluginType, TypeExport, ABI_VERSION_SYMBOL, EXPORTS_SYMBOL, PLUGIN_ABI_VERSION,
};
use serde::{Deserialize, Serialize};

use crate::error::{PluginHostError, Result};
use crate::format::ModuleFormat;
use crate::log::{LogLevel, LogSink};

/// A loaded module's export table.
///
/// `library` must outlive every type and instance created from `exports`.
pub struct ModuleImage {
    pub exports: Vec<TypeExport>,
    pub library: Option<Library>,
}

impl ModuleImage {
    /// Image without backing library, for statically linked export tables.
    pub fn from_exports(exports: &[TypeExport]) -> Self {
        Self {
            exports: exports.to_vec(),
            library: None,
        }
    }
}

/// Loads module files into the current process.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<ModuleImage>;
}

/// Loads native dynamic libraries with `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl ModuleLoader for NativeLoader {
    fn load(&self, path: &Path) -> Result<ModuleImage> {
        let format = ModuleFormat::inspect(path)?;
        if !format.matches_host() {
            return Err(PluginHostError::bad_format(
                path,
                format!("built for {}, not for this host", format),
            ));
        }

        // Safety: running a library's initializers is the point of loading it.
        // Candidates have passed the format check, and untrusted files are
        // probed in a separate process first.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            PluginHostError::bad_format(path, format!("Failed to load library: {}", e))
        })?;

        // Libraries without the version symbol are not plugin modules
        let version = unsafe { library.get::<extern "C" fn() -> u32>(ABI_VERSION_SYMBOL) }
            .ok()
            .map(|version| version());
        let Some(found) = version else {
            return Ok(ModuleImage {
                exports: Vec::new(),
                library: Some(library),
            });
        };

        if found != PLUGIN_ABI_VERSION {
            return Err(PluginHostError::AbiMismatch {
                expected: PLUGIN_ABI_VERSION,
                found,
            });
        }

        let exports = {
            // Safety: the ABI version matched, so the symbol has the SDK's signature.
            let table: Symbol<fn() -> &'static [TypeExport]> =
                unsafe { library.get(EXPORTS_SYMBOL) }.map_err(|e| {
                    PluginHostError::bad_format(path, format!("Missing export table: {}", e))
                })?;
            table().to_vec()
        };

        Ok(ModuleImage {
            exports,
            library: Some(library),
        })
    }
}

/// Why one exported type was excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFailure {
    pub type_name: String,
    pub reason: String,
}

impl From<TypeFailure> for PluginHostError {
    fn from(failure: TypeFailure) -> Self {
        PluginHostError::TypeLoad {
            type_name: failure.type_name,
            reason: failure.reason,
        }
    }
}

/// Export table after resolution.
#[derive(Debug, Default)]
pub struct ResolvedExports {
    pub types: Vec<PluginType>,
    pub failures: Vec<TypeFailure>,
}

impl ResolvedExports {
    /// Names of discoverable types.
    pub fn plugin_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.iter().filter(|ty| ty.discoverable).map(|ty| ty.name)
    }
}

/// Resolve every export on its own. Errors and panics exclude only the
/// offending type.
pub fn resolve_exports(exports: &[TypeExport], log: &dyn LogSink) -> ResolvedExports {
    let mut resolved = ResolvedExports::default();

    for export in exports {
        let type_name = panic::catch_unwind(AssertUnwindSafe(|| export.type_name()))
            .unwrap_or("<unnamed type>");

        let reason = match panic::catch_unwind(AssertUnwindSafe(|| export.resolve())) {
            Ok(Ok(ty)) => {
                log.print(&format!("Resolved type {}", ty.name), LogLevel::Verbose);
                resolved.types.push(ty);
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        let failure = TypeFailure {
            type_name: type_name.to_string(),
            reason,
        };
        log.print(
            &PluginHostError::from(failure.clone()).to_string(),
            LogLevel::Intermediate,
        );
        resolved.failures.push(failure);
    }

    resolved
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
