//! Shared fixtures for plughost-core integration tests.
#![allow(dead_code)]

use std::any::type_name;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use plughost_core::{
    HostConfig, LoaderProbe, LogLevel, LogSink, ModuleCache, ModuleImage, ModuleLoader,
    PluginHost, Result,
};
use plughost_sdk::prelude::*;
use tempfile::TempDir;

/// Serves export tables keyed by file name. Unknown files load as libraries
/// without plugin exports.
#[derive(Clone, Default)]
pub struct FakeLoader {
    modules: Arc<RwLock<HashMap<String, Vec<TypeExport>>>>,
    loads: Arc<AtomicUsize>,
    delay: Duration,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn register(&self, file_name: &str, exports: &[TypeExport]) {
        self.modules
            .write()
            .insert(file_name.to_string(), exports.to_vec());
    }

    /// Loader sharing the registered tables but counting its own loads.
    pub fn sibling(&self) -> Self {
        Self {
            modules: self.modules.clone(),
            loads: Arc::new(AtomicUsize::new(0)),
            delay: self.delay,
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<ModuleImage> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let exports = self
            .modules
            .read()
            .get(&file_name)
            .cloned()
            .unwrap_or_default();

        Ok(ModuleImage {
            exports,
            library: None,
        })
    }
}

/// Records every log line.
#[derive(Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLog {
    pub fn count(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|(_, line)| line.contains(needle))
            .count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }
}

impl LogSink for MemoryLog {
    fn print(&self, message: &str, level: LogLevel) {
        self.lines.lock().push((level, message.to_string()));
    }
}

/// Temp directory plus a trusted loader and a probe loader over the same tables.
pub struct Fixture {
    pub dir: TempDir,
    pub loader: FakeLoader,
    pub probe_loader: FakeLoader,
    pub log: Arc<MemoryLog>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_loader(FakeLoader::new())
    }

    pub fn with_loader(loader: FakeLoader) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            probe_loader: loader.sibling(),
            loader,
            log: Arc::new(MemoryLog::default()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a module file into the fixture directory and register its exports.
    pub fn module(&self, file_name: &str, exports: &[TypeExport]) -> PathBuf {
        self.module_in(self.path(), file_name, exports)
    }

    pub fn module_in(&self, dir: &Path, file_name: &str, exports: &[TypeExport]) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(file_name);
        std::fs::write(&path, format!("fake module {}", file_name)).unwrap();
        self.loader.register(file_name, exports);
        path
    }

    pub fn cache(&self) -> ModuleCache {
        ModuleCache::new(
            Arc::new(LoaderProbe::new(self.probe_loader.clone())),
            Arc::new(self.loader.clone()),
        )
        .with_log(self.log.clone())
    }

    pub fn host(&self) -> PluginHost {
        self.host_with(HostConfig::default())
    }

    pub fn host_with(&self, config: HostConfig) -> PluginHost {
        PluginHost::with_components(
            config,
            Arc::new(LoaderProbe::new(self.probe_loader.clone())),
            Arc::new(self.loader.clone()),
            self.log.clone(),
        )
        .unwrap()
    }
}

/// First 4 KiB of the running test binary: a header that passes format checks.
pub fn native_stub(dir: &Path, file_name: &str, salt: &str) -> PathBuf {
    let exe = std::fs::read(std::env::current_exe().unwrap()).unwrap();
    let mut bytes = exe[..exe.len().min(4096)].to_vec();
    bytes.extend_from_slice(salt.as_bytes());
    let path = dir.join(file_name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Platform file name for a library called `name`.
pub fn lib_name(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}

// ===== Test plugin types =====

#[derive(Default)]
struct Counts {
    constructed: usize,
    disposed: usize,
}

static EVENTS: Lazy<Mutex<HashMap<&'static str, Counts>>> = Lazy::new(Default::default);

pub fn constructed<T>() -> usize {
    EVENTS
        .lock()
        .get(type_name::<T>())
        .map_or(0, |c| c.constructed)
}

pub fn disposed<T>() -> usize {
    EVENTS.lock().get(type_name::<T>()).map_or(0, |c| c.disposed)
}

/// Counts constructions and disposals per `ID`. Each test uses its own `ID`.
#[derive(Debug)]
pub struct Tracked<const ID: usize> {
    pub serial: usize,
}

impl<const ID: usize> Plugin for Tracked<ID> {
    fn as_disposable(&self) -> Option<&dyn Disposable> {
        Some(self)
    }
}

impl<const ID: usize> Disposable for Tracked<ID> {
    fn dispose(&self) {
        EVENTS
            .lock()
            .entry(type_name::<Self>())
            .or_default()
            .disposed += 1;
    }
}

impl<const ID: usize> ExportedPlugin for Tracked<ID> {
    const DESCRIPTION: &'static str = "Tracked test plugin";

    fn metadata() -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("id".to_string(), json!(ID));
        meta
    }

    fn create() -> std::result::Result<Self, TypeLoadError> {
        // Widen the window for racing constructors
        std::thread::sleep(Duration::from_millis(20));
        let mut events = EVENTS.lock();
        let counts = events.entry(type_name::<Self>()).or_default();
        counts.constructed += 1;
        Ok(Tracked {
            serial: counts.constructed,
        })
    }
}

/// Plain plugin without disposal.
#[derive(Debug)]
pub struct Plain<const ID: usize>;

impl<const ID: usize> Plugin for Plain<ID> {}

impl<const ID: usize> ExportedPlugin for Plain<ID> {
    fn create() -> std::result::Result<Self, TypeLoadError> {
        Ok(Plain)
    }
}

/// Fails its dependency check.
pub struct MissingDependency;

impl Plugin for MissingDependency {}

impl ExportedPlugin for MissingDependency {
    fn check_dependencies() -> std::result::Result<(), TypeLoadError> {
        Err(TypeLoadError::missing_dependency("libmissing.so"))
    }

    fn create() -> std::result::Result<Self, TypeLoadError> {
        Ok(MissingDependency)
    }
}

/// Resolves, but refuses to construct.
pub struct Unbuildable;

impl Plugin for Unbuildable {}

impl ExportedPlugin for Unbuildable {
    fn create() -> std::result::Result<Self, TypeLoadError> {
        Err(TypeLoadError::construction("no backend"))
    }
}

/// Exported but not discoverable.
pub struct Hidden;

impl Plugin for Hidden {}

impl ExportedPlugin for Hidden {
    const DISCOVERABLE: bool = false;

    fn create() -> std::result::Result<Self, TypeLoadError> {
        Ok(Hidden)
    }
}

fn panicking_resolve() -> std::result::Result<PluginType, TypeLoadError> {
    panic!("export table entry is corrupt")
}

fn panicking_name() -> &'static str {
    "common::Corrupt"
}

/// Export whose resolver panics.
pub const PANICKING: TypeExport = TypeExport::from_fns(panicking_name, panicking_resolve);

pub fn name_of<T>() -> String {
    type_name::<T>().to_string()
}
