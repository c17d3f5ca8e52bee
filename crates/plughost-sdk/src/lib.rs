//! plughost plugin SDK
//!
//! This crate holds the contract shared by a host application and the plugin
//! modules it loads. A plugin module is a `cdylib` that implements [`Plugin`]
//! and [`ExportedPlugin`] for one or more types and lists them with
//! [`export_plugins!`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use plughost_sdk::prelude::*;
//!
//! #[derive(Default)]
//! pub struct BarPlugin;
//!
//! impl Plugin for BarPlugin {}
//!
//! impl ExportedPlugin for BarPlugin {
//!     const DESCRIPTION: &'static str = "Does bar things";
//!
//!     fn create() -> Result<Self, TypeLoadError> {
//!         Ok(BarPlugin)
//!     }
//! }
//!
//! export_plugins!(BarPlugin);
//! ```
//!
//! # FFI Exports
//!
//! [`export_plugins!`] generates the two symbols the host looks for:
//! - `plughost_abi_version()` -> u32 (C ABI, checked first)
//! - `plughost_plugin_exports()` -> `&'static [TypeExport]` (Rust ABI)
//!
//! Host and plugin must be built with the same compiler and the same SDK
//! version; the ABI version guards against the second.

use std::any::Any;
use std::sync::Arc;

pub mod descriptor;
pub mod error;
#[macro_use]
pub mod macros;

pub use descriptor::{
    Metadata, PluginFactory, PluginType, TypeExport, ABI_VERSION_SYMBOL, EXPORTS_SYMBOL,
    PLUGIN_ABI_VERSION,
};
pub use error::TypeLoadError;

/// Upcasting helpers used to downcast plugin instances to their concrete type.
///
/// Implemented for every `Send + Sync + 'static` type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Base contract every plugin type satisfies.
///
/// The plugin's public name is its fully-qualified Rust type path, which the
/// host records when the module is scanned.
pub trait Plugin: AsAny {
    /// Fully-qualified type path of the concrete plugin.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Optional disposal capability, invoked when the host unloads the instance.
    fn as_disposable(&self) -> Option<&dyn Disposable> {
        None
    }
}

/// Releases resources held by a plugin instance.
///
/// Called at most once, after the host and every caller dropped their handles.
pub trait Disposable {
    fn dispose(&self);
}

/// A plugin type a module exports to the host.
pub trait ExportedPlugin: Plugin + Sized {
    /// Human readable description recorded in the type descriptor.
    const DESCRIPTION: &'static str = "";

    /// `false` keeps the type out of the host's plugin table even though it is
    /// listed in the export table.
    const DISCOVERABLE: bool = true;

    /// Extra metadata published with the type descriptor.
    fn metadata() -> Metadata {
        Metadata::new()
    }

    /// Checked while the host resolves the export table. An error excludes this
    /// type only; the rest of the module is still usable.
    fn check_dependencies() -> Result<(), TypeLoadError> {
        Ok(())
    }

    /// Construct a new instance. Called lazily, at most once per host cache slot.
    fn create() -> Result<Self, TypeLoadError>;
}

/// Prelude module with common imports
pub mod prelude {
    pub use crate::descriptor::{Metadata, PluginType, TypeExport, PLUGIN_ABI_VERSION};
    pub use crate::error::TypeLoadError;
    pub use crate::{export_plugins, AsAny, Disposable, ExportedPlugin, Plugin};
    pub use serde_json::{json, Value};
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl Plugin for Probe {}

    #[test]
    fn test_type_name_is_concrete() {
        let plugin: Box<dyn Plugin> = Box::new(Probe);
        assert!(plugin.type_name().ends_with("tests::Probe"));
    }

    #[test]
    fn test_into_any_downcasts() {
        let plugin: Arc<dyn Plugin> = Arc::new(Probe);
        assert!(plugin.into_any().downcast::<Probe>().is_ok());
    }

    #[test]
    fn test_not_disposable_by_default() {
        assert!(Probe.as_disposable().is_none());
    }
}
