//! Module cache.
//!
//! Loads verified plugin modules exactly once per [`ModuleIdentity`] and keeps
//! them for the lifetime of the cache. Concurrent loads of one identity share
//! a single-flight slot, so at most one physical load happens and every caller
//! receives the same [`LoadedModule`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libloading::Library;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use plughost_sdk::PluginType;
use serde::{Deserialize, Serialize};

use crate::config::{SigningMode, SigningPolicy};
use crate::error::{is_blank, PluginHostError, Result};
use crate::identity::ModuleIdentity;
use crate::loader::{resolve_exports, ModuleLoader, TypeFailure};
use crate::log::{null_log, LogLevel, LogSink};
use crate::search_path::SearchPathSet;
use crate::signing::{verify_signature, SigningStatus};
use crate::verifier::{ModuleProbe, TypeVerifier};

/// Glob matching the platform's dynamic libraries.
pub fn default_file_pattern() -> String {
    format!("*{}", std::env::consts::DLL_SUFFIX)
}

/// Reduce `pattern` to its file-name component so a scan never leaves the
/// directory it was given. Blank or component-less patterns fall back to
/// [`default_file_pattern`].
fn file_name_pattern(pattern: &str) -> String {
    Path::new(pattern.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(default_file_pattern)
}

/// A plugin module held by the cache.
pub struct LoadedModule {
    identity: ModuleIdentity,
    types: Vec<PluginType>,
    failures: Vec<TypeFailure>,
    signing: Option<SigningStatus>,
    // Declared last: dropped after the types that point into its code
    _library: Option<Library>,
}

impl LoadedModule {
    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    /// Every resolved type, including non-discoverable ones.
    pub fn types(&self) -> &[PluginType] {
        &self.types
    }

    /// Discoverable types.
    pub fn plugin_types(&self) -> impl Iterator<Item = &PluginType> {
        self.types.iter().filter(|ty| ty.discoverable)
    }

    pub fn type_names(&self) -> BTreeSet<String> {
        self.plugin_types().map(|ty| ty.name.to_string()).collect()
    }

    /// Exported types that failed to resolve.
    pub fn failures(&self) -> &[TypeFailure] {
        &self.failures
    }

    /// `None` when the signing policy is `Ignore`.
    pub fn signing_status(&self) -> Option<SigningStatus> {
        self.signing
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("identity", &self.identity)
            .field("types", &self.types.iter().map(|ty| ty.name).collect::<Vec<_>>())
            .field("failures", &self.failures)
            .field("signing", &self.signing)
            .finish()
    }
}

/// A directory registered through [`ModuleCache::load_directory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedDirectory {
    pub path: PathBuf,
    pub pattern: String,
}

type LoadSlot = Arc<OnceCell<Arc<LoadedModule>>>;

/// Process-lifetime cache of plugin modules.
pub struct ModuleCache {
    search_paths: RwLock<SearchPathSet>,
    verifier: TypeVerifier,
    loader: Arc<dyn ModuleLoader>,
    signing: SigningPolicy,
    file_pattern: String,
    log: Arc<dyn LogSink>,

    modules: RwLock<HashMap<ModuleIdentity, Arc<LoadedModule>>>,
    in_flight: Mutex<HashMap<ModuleIdentity, LoadSlot>>,
    watched: Mutex<Vec<WatchedDirectory>>,
    disposed: AtomicBool,
}

impl ModuleCache {
    /// Cache that vets candidates with `probe` and loads them with `loader`.
    pub fn new(probe: Arc<dyn ModuleProbe>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            search_paths: RwLock::new(SearchPathSet::new()),
            verifier: TypeVerifier::new(probe),
            loader,
            signing: SigningPolicy::default(),
            file_pattern: default_file_pattern(),
            log: null_log(),
            modules: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            watched: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.verifier = self.verifier.clone().with_log(log.clone());
        self.log = log;
        self
    }

    pub fn with_signing(mut self, signing: SigningPolicy) -> Self {
        self.signing = signing;
        self
    }

    pub fn with_search_paths(self, search_paths: SearchPathSet) -> Self {
        *self.search_paths.write() = search_paths;
        self
    }

    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = file_name_pattern(&pattern.into());
        self
    }

    pub fn verifier(&self) -> &TypeVerifier {
        &self.verifier
    }

    pub fn file_pattern(&self) -> &str {
        &self.file_pattern
    }

    // ===== Search paths =====

    pub fn add_search_path(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.ensure_live()?;
        self.search_paths.write().add(path)
    }

    pub fn remove_search_path(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.ensure_live()?;
        self.search_paths.write().remove(path)
    }

    pub fn populate_default_search_paths(&self) -> Result<()> {
        self.ensure_live()?;
        self.search_paths.write().populate_defaults();
        Ok(())
    }

    pub fn search_paths(&self) -> SearchPathSet {
        self.search_paths.read().clone()
    }

    // ===== Resolution =====

    /// Identity of a module given by path or by bare name.
    ///
    /// An existing file is used as is. Otherwise each search path is tried in
    /// order with the name as given, then with the platform library prefix and
    /// suffix added.
    pub fn resolve(&self, name_or_path: impl AsRef<Path>) -> Result<ModuleIdentity> {
        self.ensure_live()?;
        let candidate = name_or_path.as_ref();
        if is_blank(candidate) {
            return Err(PluginHostError::EmptyArgument("name_or_path"));
        }

        if candidate.is_file() {
            return ModuleIdentity::from_path(candidate);
        }

        if !candidate.is_absolute() {
            let names = candidate_names(candidate);
            let search_paths = self.search_paths.read().clone();
            for dir in search_paths.iter() {
                for name in &names {
                    let path = Path::new(dir).join(name);
                    if path.is_file() {
                        self.log.print(
                            &format!("Resolved {} to {}", candidate.display(), path.display()),
                            LogLevel::Verbose,
                        );
                        return ModuleIdentity::from_path(&path);
                    }
                }
            }
        }

        Err(PluginHostError::ModuleNotFound(candidate.display().to_string()))
    }

    // ===== Loading =====

    /// Load a module, or return the cached one.
    ///
    /// A cache hit touches neither the filesystem nor the verifier.
    pub fn load(&self, identity: &ModuleIdentity) -> Result<Arc<LoadedModule>> {
        self.ensure_live()?;

        if let Some(module) = self.cached(identity) {
            self.log_hit(identity);
            return Ok(module);
        }

        let slot = self
            .in_flight
            .lock()
            .entry(identity.clone())
            .or_default()
            .clone();

        let mut fresh = false;
        let result = slot
            .get_or_try_init(|| {
                // A load that finished before this slot was created
                if let Some(module) = self.cached(identity) {
                    return Ok(module);
                }
                fresh = true;
                self.load_fresh(identity)
            })
            .cloned();

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(identity)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
            {
                in_flight.remove(identity);
            }
        }

        match &result {
            Ok(module) if fresh => self.log.print(
                &format!(
                    "Loaded module {} from {} ({} plugin types)",
                    identity,
                    identity.origin().display(),
                    module.plugin_types().count()
                ),
                LogLevel::Simple,
            ),
            Ok(_) => self.log_hit(identity),
            Err(e) => self.log.print(
                &format!("Failed to load {}: {}", identity.origin().display(), e),
                LogLevel::Intermediate,
            ),
        }
        result
    }

    /// Resolve and load.
    pub fn load_module(&self, name_or_path: impl AsRef<Path>) -> Result<Arc<LoadedModule>> {
        let identity = self.resolve(name_or_path)?;
        self.load(&identity)
    }

    /// Load every plugin module in `dir` matching `pattern` (default: the
    /// cache's file pattern) and remember the directory for [`refresh`].
    ///
    /// Files that are not plugin modules are skipped silently; other per-file
    /// failures are logged and skipped.
    ///
    /// [`refresh`]: ModuleCache::refresh
    pub fn load_directory(
        &self,
        dir: impl AsRef<Path>,
        pattern: Option<&str>,
    ) -> Result<Vec<Arc<LoadedModule>>> {
        self.ensure_live()?;
        let dir = dir.as_ref();
        if is_blank(dir) {
            return Err(PluginHostError::EmptyArgument("dir"));
        }
        if !dir.is_dir() {
            return Err(PluginHostError::DirectoryNotFound(dir.to_path_buf()));
        }

        let watched = WatchedDirectory {
            path: dir.canonicalize()?,
            pattern: pattern.map_or_else(|| self.file_pattern.clone(), file_name_pattern),
        };
        {
            let mut list = self.watched.lock();
            if !list.contains(&watched) {
                list.push(watched.clone());
            }
        }

        self.scan_directory(&watched)
    }

    /// Re-scan every watched directory. Returns the number of cached modules.
    pub fn refresh(&self) -> Result<usize> {
        self.ensure_live()?;
        let watched = self.watched.lock().clone();
        for dir in &watched {
            if let Err(e) = self.scan_directory(dir) {
                if matches!(e, PluginHostError::CacheDisposed) {
                    return Err(e);
                }
                self.log.print(
                    &format!("Failed to refresh {}: {}", dir.path.display(), e),
                    LogLevel::Intermediate,
                );
            }
        }
        Ok(self.modules.read().len())
    }

    pub fn watched_directories(&self) -> Vec<WatchedDirectory> {
        self.watched.lock().clone()
    }

    // ===== Inspection =====

    /// Snapshot of the cache.
    pub fn cached_modules(&self) -> HashMap<ModuleIdentity, Arc<LoadedModule>> {
        self.modules.read().clone()
    }

    /// Cached modules ordered by origin path.
    pub fn modules(&self) -> Result<Vec<Arc<LoadedModule>>> {
        self.ensure_live()?;
        let mut modules: Vec<_> = self.modules.read().values().cloned().collect();
        modules.sort_by(|a, b| a.identity().origin().cmp(b.identity().origin()));
        Ok(modules)
    }

    pub fn cached(&self, identity: &ModuleIdentity) -> Option<Arc<LoadedModule>> {
        self.modules.read().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    // ===== Teardown =====

    /// Release every module. Later calls fail with `CacheDisposed`.
    ///
    /// Modules still referenced by plugin instances stay mapped until those
    /// are dropped.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = std::mem::take(&mut *self.modules.write());
        self.in_flight.lock().clear();
        self.watched.lock().clear();
        self.log.print(
            &format!("Module cache disposed ({} modules released)", released.len()),
            LogLevel::Simple,
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(PluginHostError::CacheDisposed)
        } else {
            Ok(())
        }
    }

    fn log_hit(&self, identity: &ModuleIdentity) {
        self.log.print(
            &format!("Module {} served from cache", identity),
            LogLevel::Intermediate,
        );
    }

    fn load_fresh(&self, identity: &ModuleIdentity) -> Result<Arc<LoadedModule>> {
        let path = identity.origin();

        let report = self.verifier.inspect(path)?;
        if !report.is_plugin_module() {
            return Err(PluginHostError::NotAPluginModule(path.to_path_buf()));
        }

        let signing = self.check_signature(path)?;

        let image = self.loader.load(path)?;
        let resolved = resolve_exports(&image.exports, self.log.as_ref());
        if resolved.plugin_names().next().is_none() {
            return Err(PluginHostError::NotAPluginModule(path.to_path_buf()));
        }

        let module = Arc::new(LoadedModule {
            identity: identity.clone(),
            types: resolved.types,
            failures: resolved.failures,
            signing,
            _library: image.library,
        });

        let mut modules = self.modules.write();
        // Checked under the lock: `dispose` raises the flag before draining
        self.ensure_live()?;
        modules.insert(identity.clone(), module.clone());
        Ok(module)
    }

    fn check_signature(&self, path: &Path) -> Result<Option<SigningStatus>> {
        if self.signing.mode == SigningMode::Ignore {
            return Ok(None);
        }

        let expected = self.signing.expected_key()?;
        let status = verify_signature(path, expected.as_deref())?;
        if status.is_trusted() {
            return Ok(Some(status));
        }

        let reason = if status.is_signed() {
            "signed with an unexpected key"
        } else {
            "module is not signed"
        };
        match self.signing.mode {
            SigningMode::Require => Err(PluginHostError::SignatureRejected {
                path: path.to_path_buf(),
                reason: reason.to_string(),
            }),
            _ => {
                self.log.print(
                    &format!("Loading {} anyway: {}", path.display(), reason),
                    LogLevel::Simple,
                );
                Ok(Some(status))
            }
        }
    }

    fn scan_directory(&self, watched: &WatchedDirectory) -> Result<Vec<Arc<LoadedModule>>> {
        if !watched.path.is_dir() {
            return Err(PluginHostError::DirectoryNotFound(watched.path.clone()));
        }

        let dir = glob::Pattern::escape(&watched.path.to_string_lossy());
        let pattern = Path::new(&dir).join(&watched.pattern);
        let entries = glob::glob(&pattern.to_string_lossy()).map_err(|e| {
            PluginHostError::Config(format!("Invalid file pattern {}: {}", watched.pattern, e))
        })?;

        let mut found: Vec<Arc<LoadedModule>> = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(path) if path.is_file() => path,
                Ok(_) => continue,
                Err(e) => {
                    self.log.print(&format!("Skipping unreadable entry: {}", e), LogLevel::Verbose);
                    continue;
                }
            };

            match ModuleIdentity::from_path(&path).and_then(|identity| self.load(&identity)) {
                Ok(module) => {
                    if !found.iter().any(|known| Arc::ptr_eq(known, &module)) {
                        found.push(module);
                    }
                }
                Err(PluginHostError::CacheDisposed) => return Err(PluginHostError::CacheDisposed),
                Err(e) if e.is_not_a_plugin() => {
                    self.log.print(
                        &format!("Skipping {}: not a plugin module", path.display()),
                        LogLevel::Verbose,
                    );
                }
                Err(e) => {
                    self.log.print(
                        &format!("Skipping {}: {}", path.display(), e),
                        LogLevel::Intermediate,
                    );
                }
            }
        }

        self.log.print(
            &format!(
                "Found {} plugin modules in {}",
                found.len(),
                watched.path.display()
            ),
            LogLevel::Intermediate,
        );
        Ok(found)
    }
}

impl Drop for ModuleCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// File names tried for a bare module name.
fn candidate_names(name: &Path) -> Vec<PathBuf> {
    let mut names = vec![name.to_path_buf()];
    if name.extension().is_none() {
        let (prefix, suffix) = (std::env::consts::DLL_PREFIX, std::env::consts::DLL_SUFFIX);
        if let Some(file_name) = name.file_name() {
            let file_name = file_name.to_string_lossy();
            names.push(name.with_file_name(format!("{}{}", file_name, suffix)));
            if !prefix.is_empty() {
                names.push(name.with_file_name(format!("{}{}{}", prefix, file_name, suffix)));
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern() {
        assert_eq!(
            default_file_pattern(),
            format!("*{}", std::env::consts::DLL_SUFFIX)
        );
    }

    #[test]
    fn test_file_name_pattern() {
        assert_eq!(file_name_pattern("*.plug"), "*.plug");
        assert_eq!(file_name_pattern("../*.so"), "*.so");
        assert_eq!(file_name_pattern("/etc/*.conf"), "*.conf");
        assert_eq!(file_name_pattern("  "), default_file_pattern());
        assert_eq!(file_name_pattern(".."), default_file_pattern());
    }

    #[test]
    fn test_candidate_names() {
        let names = candidate_names(Path::new("bar"));
        assert_eq!(names[0], PathBuf::from("bar"));
        assert_eq!(
            names[1],
            PathBuf::from(format!("bar{}", std::env::consts::DLL_SUFFIX))
        );

        let names = candidate_names(Path::new("libbar.so"));
        assert_eq!(names.len(), 1);
    }
}
