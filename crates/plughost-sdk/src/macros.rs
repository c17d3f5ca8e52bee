//! Declarative macros for plugin module development.

/// Export plugin types from a module.
///
/// This macro generates the necessary FFI exports for a plugin module. List
/// every type, discoverable or not; each must implement
/// [`ExportedPlugin`](crate::ExportedPlugin).
///
/// # Example
///
/// ```rust,ignore
/// use plughost_sdk::prelude::*;
///
/// export_plugins!(BarPlugin, BazPlugin);
/// ```
#[macro_export]
macro_rules! export_plugins {
    ($($ty:ty),+ $(,)?) => {
        #[no_mangle]
        pub extern "C" fn plughost_abi_version() -> u32 {
            $crate::PLUGIN_ABI_VERSION
        }

        #[no_mangle]
        pub fn plughost_plugin_exports() -> &'static [$crate::TypeExport] {
            static EXPORTS: &[$crate::TypeExport] = &[$($crate::TypeExport::of::<$ty>()),+];
            EXPORTS
        }
    };
}
