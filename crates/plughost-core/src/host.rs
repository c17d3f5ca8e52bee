//! `PluginHost`: one module cache plus one plugin service behind a single API.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use plughost_sdk::Plugin;

use crate::cache::{LoadedModule, ModuleCache, WatchedDirectory};
use crate::config::{HostConfig, ProbeMode};
use crate::error::Result;
use crate::identity::ModuleIdentity;
use crate::loader::{ModuleLoader, NativeLoader};
use crate::log::{null_log, LogLevel, LogSink};
use crate::search_path::SearchPathSet;
use crate::service::{PluginHandle, PluginService, PluginTypeDescriptor};
use crate::signing::{self, SigningStatus};
use crate::verifier::{LoaderProbe, ModuleProbe, ProbeReport, ProcessProbe};

/// Plugin host built from a [`HostConfig`].
pub struct PluginHost {
    config: HostConfig,
    cache: Arc<ModuleCache>,
    service: PluginService,
    log: Arc<dyn LogSink>,
}

impl PluginHost {
    /// Host with native loading and no logging.
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::with_log(config, null_log())
    }

    pub fn with_log(config: HostConfig, log: Arc<dyn LogSink>) -> Result<Self> {
        let probe = build_probe(&config, &log);
        Self::with_components(config, probe, Arc::new(NativeLoader), log)
    }

    /// Host with an explicit probe and loader.
    pub fn with_components(
        config: HostConfig,
        probe: Arc<dyn ModuleProbe>,
        loader: Arc<dyn ModuleLoader>,
        log: Arc<dyn LogSink>,
    ) -> Result<Self> {
        config.validate()?;

        let mut search_paths = SearchPathSet::new();
        for path in &config.search_paths {
            search_paths.add(path)?;
        }
        if config.populate_default_search_paths {
            search_paths.populate_defaults();
        }

        let mut cache = ModuleCache::new(probe, loader)
            .with_log(log.clone())
            .with_signing(config.signing.clone())
            .with_search_paths(search_paths);
        if let Some(pattern) = &config.file_pattern {
            cache = cache.with_file_pattern(pattern.clone());
        }

        let cache = Arc::new(cache);
        let service = PluginService::new(cache.clone()).with_log(log.clone());

        log.print(
            &format!(
                "Plugin host ready ({} search paths, {} probe)",
                cache.search_paths().len(),
                cache.verifier().probe_strategy()
            ),
            LogLevel::Verbose,
        );

        Ok(Self {
            config,
            cache,
            service,
            log,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    pub fn service(&self) -> &PluginService {
        &self.service
    }

    pub fn log(&self) -> &Arc<dyn LogSink> {
        &self.log
    }

    // ===== Search paths =====

    pub fn add_search_path(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.cache.add_search_path(path)
    }

    pub fn populate_default_search_paths(&self) -> Result<()> {
        self.cache.populate_default_search_paths()
    }

    pub fn search_paths(&self) -> SearchPathSet {
        self.cache.search_paths()
    }

    // ===== Modules =====

    pub fn resolve(&self, name_or_path: impl AsRef<Path>) -> Result<ModuleIdentity> {
        self.cache.resolve(name_or_path)
    }

    pub fn load(&self, identity: &ModuleIdentity) -> Result<Arc<LoadedModule>> {
        self.cache.load(identity)
    }

    pub fn load_module(&self, name_or_path: impl AsRef<Path>) -> Result<Arc<LoadedModule>> {
        self.cache.load_module(name_or_path)
    }

    pub fn load_directory(
        &self,
        dir: impl AsRef<Path>,
        pattern: Option<&str>,
    ) -> Result<Vec<Arc<LoadedModule>>> {
        self.cache.load_directory(dir, pattern)
    }

    pub fn refresh(&self) -> Result<usize> {
        self.cache.refresh()
    }

    pub fn watched_directories(&self) -> Vec<WatchedDirectory> {
        self.cache.watched_directories()
    }

    pub fn cached_modules(&self) -> std::collections::HashMap<ModuleIdentity, Arc<LoadedModule>> {
        self.cache.cached_modules()
    }

    // ===== Verification =====

    pub fn is_plugin_module(&self, path: impl AsRef<Path>) -> bool {
        self.cache.verifier().is_plugin_module(path)
    }

    /// Plugin type names a file would contribute. Empty on any failure.
    pub fn enumerate_plugin_type_names(&self, path: impl AsRef<Path>) -> BTreeSet<String> {
        self.cache.verifier().probe(path)
    }

    /// Plugin type names of a module, loading it if needed. Empty on any failure.
    pub fn enumerate_module_type_names(&self, identity: &ModuleIdentity) -> BTreeSet<String> {
        match self.cache.load(identity) {
            Ok(module) => module.type_names(),
            Err(e) => {
                self.log.print(
                    &format!("Cannot enumerate {}: {}", identity, e),
                    LogLevel::Intermediate,
                );
                BTreeSet::new()
            }
        }
    }

    pub fn inspect(&self, path: impl AsRef<Path>) -> Result<ProbeReport> {
        self.cache.verifier().inspect(path)
    }

    pub fn verify_signature(
        &self,
        path: impl AsRef<Path>,
        expected_public_key: Option<&[u8]>,
    ) -> Result<SigningStatus> {
        signing::verify_signature(path, expected_public_key)
    }

    // ===== Plugins =====

    pub fn scan(&self) -> Result<usize> {
        self.service.scan()
    }

    pub fn get_plugin<T: Plugin>(&self, name: &str) -> Result<PluginHandle<T>> {
        self.service.get_plugin(name)
    }

    pub fn get_plugin_dyn(&self, name: &str) -> Result<PluginHandle<dyn Plugin>> {
        self.service.get_plugin_dyn(name)
    }

    pub fn get_plugins<T: Plugin>(
        &self,
        module: Option<&ModuleIdentity>,
    ) -> Result<Vec<PluginHandle<T>>> {
        self.service.get_plugins(module)
    }

    pub fn get_plugins_dyn(
        &self,
        module: Option<&ModuleIdentity>,
    ) -> Result<Vec<PluginHandle<dyn Plugin>>> {
        self.service.get_plugins_dyn(module)
    }

    pub fn list_names(&self, module: Option<&ModuleIdentity>) -> Result<Vec<String>> {
        self.service.list_names(module)
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<PluginTypeDescriptor>> {
        self.service.descriptor(name)
    }

    pub fn unload(&self, name: &str) -> bool {
        self.service.unload(name)
    }

    pub fn unload_all(&self) {
        self.service.unload_all()
    }

    /// Unload every plugin, then dispose the module cache.
    pub fn dispose_cache(&self) {
        self.service.unload_all();
        self.cache.dispose();
    }
}

/// Probe for the configured mode. Process mode without a runner falls back
/// to probing in-process.
fn build_probe(config: &HostConfig, log: &Arc<dyn LogSink>) -> Arc<dyn ModuleProbe> {
    let in_process = || -> Arc<dyn ModuleProbe> {
        Arc::new(LoaderProbe::native().with_log(log.clone()))
    };

    match config.probe.mode {
        ProbeMode::InProcess => in_process(),
        ProbeMode::Process => {
            match config.probe.runner.clone().or_else(ProcessProbe::locate_runner) {
                Some(runner) => {
                    log.print(
                        &format!("Probing with runner {}", runner.display()),
                        LogLevel::Verbose,
                    );
                    Arc::new(ProcessProbe::new(runner).with_timeout(config.probe.timeout()))
                }
                None => {
                    log.print(
                        "Probe runner not found, probing in-process",
                        LogLevel::Simple,
                    );
                    in_process()
                }
            }
        }
    }
}
