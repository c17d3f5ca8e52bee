//! Sample plughost plugin module.
//!
//! Exports four types:
//! - [`BarPlugin`]: a plain plugin
//! - [`CounterPlugin`]: keeps state and is disposable
//! - [`AcceleratedPlugin`]: needs `PLUGHOST_SAMPLE_ACCELERATOR` at load time,
//!   so it is excluded on hosts without it
//! - [`FormatHelper`]: exported but not discoverable

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use plughost_sdk::prelude::*;

/// Environment variable [`AcceleratedPlugin`] depends on.
pub const ACCELERATOR_ENV: &str = "PLUGHOST_SAMPLE_ACCELERATOR";

/// Greets people.
#[derive(Debug, Default)]
pub struct BarPlugin {
    greeting: String,
}

impl BarPlugin {
    pub fn greet(&self, name: &str) -> String {
        format!("{}, {}!", self.greeting, name)
    }
}

impl Plugin for BarPlugin {}

impl ExportedPlugin for BarPlugin {
    const DESCRIPTION: &'static str = "Greets people";

    fn metadata() -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("category".to_string(), json!("greeting"));
        meta.insert("languages".to_string(), json!(["en"]));
        meta
    }

    fn create() -> Result<Self, TypeLoadError> {
        Ok(BarPlugin {
            greeting: "Hello".to_string(),
        })
    }
}

/// Counts calls until disposed.
#[derive(Debug, Default)]
pub struct CounterPlugin {
    count: AtomicU64,
    disposed: AtomicBool,
}

impl CounterPlugin {
    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Plugin for CounterPlugin {
    fn as_disposable(&self) -> Option<&dyn Disposable> {
        Some(self)
    }
}

impl Disposable for CounterPlugin {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

impl ExportedPlugin for CounterPlugin {
    const DESCRIPTION: &'static str = "Counts calls";

    fn create() -> Result<Self, TypeLoadError> {
        Ok(CounterPlugin::default())
    }
}

/// Only available where the accelerator is configured.
#[derive(Debug)]
pub struct AcceleratedPlugin {
    device: String,
}

impl AcceleratedPlugin {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Plugin for AcceleratedPlugin {}

impl ExportedPlugin for AcceleratedPlugin {
    const DESCRIPTION: &'static str = "Runs on the configured accelerator";

    fn check_dependencies() -> Result<(), TypeLoadError> {
        match std::env::var(ACCELERATOR_ENV) {
            Ok(device) if !device.trim().is_empty() => Ok(()),
            _ => Err(TypeLoadError::missing_dependency(ACCELERATOR_ENV)),
        }
    }

    fn create() -> Result<Self, TypeLoadError> {
        std::env::var(ACCELERATOR_ENV)
            .map(|device| AcceleratedPlugin { device })
            .map_err(|_| TypeLoadError::construction("accelerator went away"))
    }
}

/// Shared formatting helper. Exported for other modules, not a plugin itself.
#[derive(Debug, Default)]
pub struct FormatHelper;

impl FormatHelper {
    pub fn shout(&self, text: &str) -> String {
        text.to_uppercase()
    }
}

impl Plugin for FormatHelper {}

impl ExportedPlugin for FormatHelper {
    const DISCOVERABLE: bool = false;

    fn create() -> Result<Self, TypeLoadError> {
        Ok(FormatHelper)
    }
}

export_plugins!(BarPlugin, CounterPlugin, AcceleratedPlugin, FormatHelper);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_table() {
        let exports = plughost_plugin_exports();
        assert_eq!(exports.len(), 4);
        assert_eq!(plughost_abi_version(), PLUGIN_ABI_VERSION);
        assert!(exports[0].type_name().ends_with("BarPlugin"));
    }

    #[test]
    fn test_bar_greets() {
        let bar = BarPlugin::create().unwrap();
        assert_eq!(bar.greet("Ada"), "Hello, Ada!");
    }

    #[test]
    fn test_counter_disposal() {
        let counter = CounterPlugin::create().unwrap();
        assert_eq!(counter.increment(), 1);
        counter.as_disposable().unwrap().dispose();
        assert!(counter.is_disposed());
    }
}
