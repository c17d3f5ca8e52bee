//! Plugin service.
//!
//! Turns the modules held by a [`ModuleCache`] into a table of plugin type
//! descriptors, and constructs instances from them on demand. Each name is
//! constructed at most once until it is unloaded:
//!
//! ```text
//! Unscanned -> Scanned -> Instantiated -> Unloaded -> (scan) -> Scanned
//! ```
//!
//! Instances are handed out as [`PluginHandle`]s. Unloading removes the cached
//! instance; disposal runs once the last handle to it is dropped.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use plughost_sdk::{Metadata, Plugin, PluginFactory, PluginType};

use crate::cache::{LoadedModule, ModuleCache};
use crate::error::{is_blank, PluginHostError, Result};
use crate::identity::ModuleIdentity;
use crate::loader::panic_message;
use crate::log::{null_log, LogLevel, LogSink};

/// A plugin type known to the service.
pub struct PluginTypeDescriptor {
    name: String,
    description: String,
    metadata: Metadata,
    owner: ModuleIdentity,
    module: Weak<LoadedModule>,
    ty: PluginType,
}

impl PluginTypeDescriptor {
    fn new(ty: &PluginType, module: &Arc<LoadedModule>) -> Self {
        Self {
            name: ty.name.to_string(),
            description: ty.description.to_string(),
            metadata: ty.metadata.clone(),
            owner: module.identity().clone(),
            module: Arc::downgrade(module),
            ty: ty.clone(),
        }
    }

    /// Fully-qualified type path.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Identity of the module exporting the type.
    pub fn owner(&self) -> &ModuleIdentity {
        &self.owner
    }

    /// The owning module, unless the cache has released it.
    pub fn module(&self) -> Option<Arc<LoadedModule>> {
        self.module.upgrade()
    }

    pub fn factory(&self) -> PluginFactory {
        self.ty.factory
    }

    /// Whether instances of this type are `T`.
    pub fn is<T: Plugin>(&self) -> bool {
        self.ty.is::<T>()
    }
}

impl fmt::Debug for PluginTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginTypeDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("owner", &self.owner)
            .finish()
    }
}

/// A constructed plugin, shared by the instance table and every handle.
///
/// Dropping the last reference disposes the instance, then releases it, then
/// releases the owning module.
struct InstanceEntry {
    descriptor: Arc<PluginTypeDescriptor>,
    instance: Arc<dyn Plugin>,
    _module: Arc<LoadedModule>,
    log: Arc<dyn LogSink>,
}

impl Drop for InstanceEntry {
    fn drop(&mut self) {
        if let Some(disposable) = self.instance.as_disposable() {
            disposable.dispose();
            self.log.print(
                &format!("Disposed plugin {}", self.descriptor.name()),
                LogLevel::Intermediate,
            );
        }
    }
}

/// Shared handle to a plugin instance.
///
/// Keeps the instance and its module alive. Derefs to the plugin.
pub struct PluginHandle<T: ?Sized> {
    // Declared first: dropped before the entry that may dispose it
    instance: Arc<T>,
    entry: Arc<InstanceEntry>,
}

impl<T: ?Sized> PluginHandle<T> {
    /// Fully-qualified type path of the plugin.
    pub fn name(&self) -> &str {
        self.entry.descriptor.name()
    }

    pub fn description(&self) -> &str {
        self.entry.descriptor.description()
    }

    /// Identity of the module the plugin came from.
    pub fn owner(&self) -> &ModuleIdentity {
        self.entry.descriptor.owner()
    }

    pub fn metadata(&self) -> &Metadata {
        self.entry.descriptor.metadata()
    }

    pub fn descriptor(&self) -> &Arc<PluginTypeDescriptor> {
        &self.entry.descriptor
    }

    pub fn instance(&self) -> &Arc<T> {
        &self.instance
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.entry, &b.entry)
    }
}

impl<T: ?Sized> Clone for PluginHandle<T> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            entry: self.entry.clone(),
        }
    }
}

impl<T: ?Sized> Deref for PluginHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.instance
    }
}

impl<T: ?Sized> fmt::Debug for PluginHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name())
            .field("owner", self.owner())
            .finish()
    }
}

type DescriptorTable = Arc<HashMap<String, Arc<PluginTypeDescriptor>>>;

/// Single-flight construction slot, bound to the descriptor it builds from.
struct InstanceSlot {
    descriptor: Arc<PluginTypeDescriptor>,
    cell: OnceCell<Arc<InstanceEntry>>,
}

impl InstanceSlot {
    fn new(descriptor: Arc<PluginTypeDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            cell: OnceCell::new(),
        })
    }

    fn is_built(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// Builds and caches plugin instances from the modules of a [`ModuleCache`].
pub struct PluginService {
    cache: Arc<ModuleCache>,
    log: Arc<dyn LogSink>,
    descriptors: RwLock<DescriptorTable>,
    instances: Mutex<HashMap<String, Arc<InstanceSlot>>>,
    scan_lock: Mutex<()>,
    generation: AtomicU64,
}

impl PluginService {
    pub fn new(cache: Arc<ModuleCache>) -> Self {
        Self {
            cache,
            log: null_log(),
            descriptors: RwLock::new(Arc::new(HashMap::new())),
            instances: Mutex::new(HashMap::new()),
            scan_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    /// Number of completed scans.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Rebuild the descriptor table from every cached module.
    ///
    /// Unloads all instances first. Scans are serialized: a concurrent caller
    /// waits for the running scan and then performs its own. Readers are only
    /// blocked while the new table is swapped in. Returns the number of
    /// descriptors.
    pub fn scan(&self) -> Result<usize> {
        let _scan = self.scan_lock.lock();
        self.scan_locked()
    }

    fn scan_locked(&self) -> Result<usize> {
        self.unload_all();

        let modules = self.cache.modules()?;
        let mut table: HashMap<String, Arc<PluginTypeDescriptor>> = HashMap::new();
        for module in &modules {
            for ty in module.plugin_types() {
                match table.entry(ty.name.to_string()) {
                    Entry::Occupied(existing) => self.log.print(
                        &format!(
                            "Duplicate plugin type {} in {}; keeping the one from {}",
                            ty.name,
                            module.identity(),
                            existing.get().owner()
                        ),
                        LogLevel::Intermediate,
                    ),
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::new(PluginTypeDescriptor::new(ty, module)));
                    }
                }
            }
        }

        let count = table.len();
        let table = Arc::new(table);
        *self.descriptors.write() = table.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Slots bound to a replaced descriptor, built or still constructing
        let stale: Vec<Arc<InstanceSlot>> = {
            let mut instances = self.instances.lock();
            let names: Vec<String> = instances
                .iter()
                .filter(|(name, slot)| {
                    !table
                        .get(name.as_str())
                        .is_some_and(|current| Arc::ptr_eq(current, &slot.descriptor))
                })
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| instances.remove(name)).collect()
        };
        drop(stale);

        self.log.print(
            &format!(
                "Scan {} found {} plugin types in {} modules",
                generation,
                count,
                modules.len()
            ),
            LogLevel::Simple,
        );
        Ok(count)
    }

    /// Get or construct the plugin `name` as `T`.
    ///
    /// Fails with `TypeMismatch` if the plugin is not a `T`.
    pub fn get_plugin<T: Plugin>(&self, name: &str) -> Result<PluginHandle<T>> {
        let descriptor = self.find(name)?;
        if !descriptor.is::<T>() {
            return Err(type_mismatch::<T>(name));
        }
        let entry = self.instantiate(&descriptor)?;
        downcast_entry(entry).ok_or_else(|| type_mismatch::<T>(name))
    }

    /// Get or construct the plugin `name` through the base contract.
    pub fn get_plugin_dyn(&self, name: &str) -> Result<PluginHandle<dyn Plugin>> {
        let descriptor = self.find(name)?;
        let entry = self.instantiate(&descriptor)?;
        Ok(PluginHandle {
            instance: entry.instance.clone(),
            entry,
        })
    }

    /// Every plugin that is a `T`, optionally limited to one module.
    ///
    /// Plugins whose construction fails are logged and skipped.
    pub fn get_plugins<T: Plugin>(
        &self,
        module: Option<&ModuleIdentity>,
    ) -> Result<Vec<PluginHandle<T>>> {
        let mut handles = Vec::new();
        for descriptor in self.matching(module)? {
            if !descriptor.is::<T>() {
                continue;
            }
            match self.instantiate(&descriptor) {
                Ok(entry) => handles.extend(downcast_entry(entry)),
                Err(e) => self.log_skip(&descriptor, &e),
            }
        }
        Ok(handles)
    }

    /// Every plugin through the base contract, optionally limited to one module.
    pub fn get_plugins_dyn(
        &self,
        module: Option<&ModuleIdentity>,
    ) -> Result<Vec<PluginHandle<dyn Plugin>>> {
        let mut handles = Vec::new();
        for descriptor in self.matching(module)? {
            match self.instantiate(&descriptor) {
                Ok(entry) => handles.push(PluginHandle {
                    instance: entry.instance.clone(),
                    entry,
                }),
                Err(e) => self.log_skip(&descriptor, &e),
            }
        }
        Ok(handles)
    }

    /// Sorted plugin names, without constructing anything.
    pub fn list_names(&self, module: Option<&ModuleIdentity>) -> Result<Vec<String>> {
        Ok(self
            .matching(module)?
            .into_iter()
            .map(|descriptor| descriptor.name().to_string())
            .collect())
    }

    /// Descriptor for `name` in the current table. Never scans.
    pub fn descriptor(&self, name: &str) -> Option<Arc<PluginTypeDescriptor>> {
        self.descriptors.read().get(name).cloned()
    }

    /// Current descriptors sorted by name. Never scans.
    pub fn descriptors(&self) -> Vec<Arc<PluginTypeDescriptor>> {
        let table = self.descriptors.read().clone();
        let mut descriptors: Vec<_> = table.values().cloned().collect();
        descriptors.sort_by(|a, b| a.name().cmp(b.name()));
        descriptors
    }

    pub fn is_instantiated(&self, name: &str) -> bool {
        self.instances
            .lock()
            .get(name)
            .is_some_and(|slot| slot.is_built())
    }

    /// Remove the cached instance of `name`. Returns `false` if none was cached.
    pub fn unload(&self, name: &str) -> bool {
        let removed = {
            let mut instances = self.instances.lock();
            let loaded = instances.get(name).is_some_and(|slot| slot.is_built());
            if loaded {
                instances.remove(name)
            } else {
                None
            }
        };

        match removed {
            Some(slot) => {
                self.log.print(&format!("Unloaded plugin {}", name), LogLevel::Intermediate);
                // Disposes here unless a handle is still out
                drop(slot);
                true
            }
            None => false,
        }
    }

    /// Remove every cached instance. The descriptor table is kept.
    pub fn unload_all(&self) {
        let removed = std::mem::take(&mut *self.instances.lock());
        let count = removed.values().filter(|slot| slot.is_built()).count();
        drop(removed);
        if count > 0 {
            self.log.print(
                &format!("Unloaded {} plugin instances", count),
                LogLevel::Intermediate,
            );
        }
    }

    /// Look up `name`, scanning first if the service never scanned.
    fn find(&self, name: &str) -> Result<Arc<PluginTypeDescriptor>> {
        if is_blank(name) {
            return Err(PluginHostError::EmptyArgument("name"));
        }
        self.table()?
            .get(name)
            .cloned()
            .ok_or_else(|| PluginHostError::PlugInNotFound(name.to_string()))
    }

    fn table(&self) -> Result<DescriptorTable> {
        if self.generation() == 0 {
            let _scan = self.scan_lock.lock();
            // Another caller may have finished the first scan meanwhile
            if self.generation() == 0 {
                self.scan_locked()?;
            }
        }
        Ok(self.descriptors.read().clone())
    }

    fn matching(&self, module: Option<&ModuleIdentity>) -> Result<Vec<Arc<PluginTypeDescriptor>>> {
        let table = self.table()?;
        let mut matching: Vec<_> = table
            .values()
            .filter(|descriptor| module.map_or(true, |id| descriptor.owner() == id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(matching)
    }

    /// Cached instance for the descriptor's name, or construct it once.
    ///
    /// The slot is bound under the instance lock to the descriptor currently in
    /// the table, so a scan that replaced `descriptor` since it was looked up
    /// never leaves an instance of the old one cached.
    fn instantiate(&self, descriptor: &Arc<PluginTypeDescriptor>) -> Result<Arc<InstanceEntry>> {
        let name = descriptor.name();
        let (slot, replaced) = {
            let mut instances = self.instances.lock();
            let current = self
                .descriptors
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| PluginHostError::PlugInNotFound(name.to_string()))?;

            match instances.get(name) {
                Some(slot) if Arc::ptr_eq(&slot.descriptor, &current) => (slot.clone(), None),
                _ => {
                    let slot = InstanceSlot::new(current);
                    let replaced = instances.insert(name.to_string(), slot.clone());
                    (slot, replaced)
                }
            }
        };
        // Disposes outside the lock
        drop(replaced);

        let result = slot
            .cell
            .get_or_try_init(|| self.construct(&slot.descriptor))
            .cloned();

        if result.is_err() {
            let mut instances = self.instances.lock();
            if instances
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.is_built())
            {
                instances.remove(name);
            }
        }
        result
    }

    fn construct(&self, descriptor: &Arc<PluginTypeDescriptor>) -> Result<Arc<InstanceEntry>> {
        let name = descriptor.name();
        let module = descriptor.module().ok_or(PluginHostError::CacheDisposed)?;

        let factory = descriptor.factory();
        let instance = match panic::catch_unwind(AssertUnwindSafe(factory)) {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                return Err(PluginHostError::ConstructionFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(payload) => {
                return Err(PluginHostError::ConstructionFailed {
                    name: name.to_string(),
                    reason: format!("panicked: {}", panic_message(payload.as_ref())),
                })
            }
        };

        self.log.print(&format!("Constructed plugin {}", name), LogLevel::Intermediate);
        Ok(Arc::new(InstanceEntry {
            descriptor: descriptor.clone(),
            instance: Arc::from(instance),
            _module: module,
            log: self.log.clone(),
        }))
    }

    fn log_skip(&self, descriptor: &PluginTypeDescriptor, error: &PluginHostError) {
        self.log.print(
            &format!("Skipping plugin {}: {}", descriptor.name(), error),
            LogLevel::Intermediate,
        );
    }
}

fn downcast_entry<T: Plugin>(entry: Arc<InstanceEntry>) -> Option<PluginHandle<T>> {
    let instance = entry.instance.clone().into_any().downcast::<T>().ok()?;
    Some(PluginHandle { instance, entry })
}

fn type_mismatch<T>(name: &str) -> PluginHostError {
    PluginHostError::TypeMismatch {
        name: name.to_string(),
        expected: std::any::type_name::<T>(),
    }
}
