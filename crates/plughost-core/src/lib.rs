//! plughost core
//!
//! Discovers, verifies, caches and instantiates plugins shipped as native
//! dynamic libraries built with `plughost-sdk`.
//!
//! ## Components
//!
//! - **Search paths** ([`SearchPathSet`]): where bare module names are looked up
//! - **Module identity** ([`ModuleIdentity`]): name plus content hash, the cache key
//! - **Format inspection** ([`ModuleFormat`]): ELF / PE / Mach-O header checks
//! - **Signing** ([`verify_signature`]): detached Ed25519 signatures
//! - **Verification** ([`TypeVerifier`]): probes candidates in a child process
//!   or a throwaway in-process image before they are trusted
//! - **Module cache** ([`ModuleCache`]): loads each identity once
//! - **Plugin service** ([`PluginService`]): descriptors, lazy singleton
//!   instances, unload and disposal
//! - **Host** ([`PluginHost`]): all of the above, built from [`HostConfig`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use plughost_core::{HostConfig, PluginHost};
//!
//! # fn main() -> plughost_core::Result<()> {
//! let host = PluginHost::new(HostConfig::from_env()?)?;
//! host.add_search_path("/opt/app/plugins")?;
//! host.load_module("bar")?;
//!
//! for name in host.list_names(None)? {
//!     let plugin = host.get_plugin_dyn(&name)?;
//!     println!("{} from {}", plugin.name(), plugin.owner());
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod host;
pub mod identity;
pub mod loader;
pub mod log;
pub mod search_path;
pub mod service;
pub mod signing;
pub mod verifier;

// Re-exports
pub use cache::{default_file_pattern, LoadedModule, ModuleCache, WatchedDirectory};
pub use config::{HostConfig, ProbeConfig, ProbeMode, SigningMode, SigningPolicy};
pub use error::{PluginHostError, Result};
pub use format::{Arch, ModuleFormat, ModuleKind};
pub use host::PluginHost;
pub use identity::ModuleIdentity;
pub use loader::{resolve_exports, ModuleImage, ModuleLoader, NativeLoader, TypeFailure};
pub use log::{LogLevel, LogSink, NullLog, TracingLog};
pub use search_path::SearchPathSet;
pub use service::{PluginHandle, PluginService, PluginTypeDescriptor};
pub use signing::{
    generate_signing_key, sign_module, verify_signature, SignatureFile, SigningStatus,
};
pub use verifier::{
    LoaderProbe, ModuleProbe, ProbeOutcome, ProbeReport, ProcessProbe, TypeVerifier,
};

pub use plughost_sdk::{Disposable, Plugin};
