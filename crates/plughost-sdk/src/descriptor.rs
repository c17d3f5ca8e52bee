//! Export table definitions.
//!
//! A plugin module exports a table of [`TypeExport`] entries. The host resolves
//! each entry separately into a [`PluginType`], so one broken type does not hide
//! the others.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

use crate::error::TypeLoadError;
use crate::{ExportedPlugin, Plugin};

/// Plugin ABI version (must match the host's plughost-core)
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Symbol of the C-ABI function returning the module's ABI version.
pub const ABI_VERSION_SYMBOL: &[u8] = b"plughost_abi_version";

/// Symbol of the Rust-ABI function returning the module's export table.
pub const EXPORTS_SYMBOL: &[u8] = b"plughost_plugin_exports";

/// Metadata published with a plugin type.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Constructs a fresh plugin instance.
pub type PluginFactory = fn() -> Result<Box<dyn Plugin>, TypeLoadError>;

/// A resolved plugin type, ready to be turned into a host descriptor.
#[derive(Clone)]
pub struct PluginType {
    /// Fully-qualified type path
    pub name: &'static str,

    /// Type id of the concrete plugin, used to filter before constructing
    pub type_id: TypeId,

    /// Human readable description
    pub description: &'static str,

    /// Whether the host should list this type as a plugin
    pub discoverable: bool,

    /// Exported metadata
    pub metadata: Metadata,

    /// Instance constructor
    pub factory: PluginFactory,
}

impl PluginType {
    /// Build the type entry for `T`.
    pub fn of<T: ExportedPlugin>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            description: T::DESCRIPTION,
            discoverable: T::DISCOVERABLE,
            metadata: T::metadata(),
            factory: construct::<T>,
        }
    }

    /// Call the factory.
    pub fn create(&self) -> Result<Box<dyn Plugin>, TypeLoadError> {
        (self.factory)()
    }

    /// Whether instances of this type are `T`.
    pub fn is<T: Plugin>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl Debug for PluginType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginType")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("discoverable", &self.discoverable)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// One entry of a module's export table.
///
/// Resolution is deferred so the host can isolate failures per type.
#[derive(Clone, Copy)]
pub struct TypeExport {
    type_name: fn() -> &'static str,
    resolve: fn() -> Result<PluginType, TypeLoadError>,
}

impl TypeExport {
    /// Export entry for `T`.
    pub const fn of<T: ExportedPlugin>() -> Self {
        Self {
            type_name: type_name_of::<T>,
            resolve: resolve_type::<T>,
        }
    }

    /// Export entry from hand-written functions.
    pub const fn from_fns(
        type_name: fn() -> &'static str,
        resolve: fn() -> Result<PluginType, TypeLoadError>,
    ) -> Self {
        Self { type_name, resolve }
    }

    /// Name of the exported type. Available even when resolution fails.
    pub fn type_name(&self) -> &'static str {
        (self.type_name)()
    }

    /// Resolve the type. May fail, and a misbehaving module may panic here.
    pub fn resolve(&self) -> Result<PluginType, TypeLoadError> {
        (self.resolve)()
    }
}

impl Debug for TypeExport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeExport")
            .field("type_name", &self.type_name())
            .finish()
    }
}

fn type_name_of<T>() -> &'static str {
    std::any::type_name::<T>()
}

fn resolve_type<T: ExportedPlugin>() -> Result<PluginType, TypeLoadError> {
    T::check_dependencies()?;
    Ok(PluginType::of::<T>())
}

fn construct<T: ExportedPlugin>() -> Result<Box<dyn Plugin>, TypeLoadError> {
    Ok(Box::new(T::create()?))
}
