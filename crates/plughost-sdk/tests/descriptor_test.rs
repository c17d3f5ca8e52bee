//! Integration tests for export table entries.

use plughost_sdk::prelude::*;

#[derive(Debug)]
struct Widget {
    size: u32,
}

impl Plugin for Widget {}

impl ExportedPlugin for Widget {
    const DESCRIPTION: &'static str = "A widget";

    fn metadata() -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("size".to_string(), json!(3));
        meta
    }

    fn create() -> Result<Self, TypeLoadError> {
        Ok(Widget { size: 3 })
    }
}

struct Helper;

impl Plugin for Helper {}

impl ExportedPlugin for Helper {
    const DISCOVERABLE: bool = false;

    fn create() -> Result<Self, TypeLoadError> {
        Ok(Helper)
    }
}

struct NeedsGpu;

impl Plugin for NeedsGpu {}

impl ExportedPlugin for NeedsGpu {
    fn check_dependencies() -> Result<(), TypeLoadError> {
        Err(TypeLoadError::missing_dependency("libgpu.so"))
    }

    fn create() -> Result<Self, TypeLoadError> {
        Ok(NeedsGpu)
    }
}

#[test]
fn test_export_resolves_type() {
    let export = TypeExport::of::<Widget>();
    assert!(export.type_name().ends_with("Widget"));

    let ty = export.resolve().unwrap();
    assert_eq!(ty.name, export.type_name());
    assert_eq!(ty.description, "A widget");
    assert!(ty.discoverable);
    assert_eq!(ty.metadata.get("size"), Some(&json!(3)));
    assert!(ty.is::<Widget>());
    assert!(!ty.is::<Helper>());
}

#[test]
fn test_factory_builds_instance() {
    let ty = PluginType::of::<Widget>();
    let instance = ty.create().unwrap();
    let widget = (*instance).as_any().downcast_ref::<Widget>().unwrap();
    assert_eq!(widget.size, 3);
}

#[test]
fn test_non_discoverable_type() {
    let ty = TypeExport::of::<Helper>().resolve().unwrap();
    assert!(!ty.discoverable);
}

#[test]
fn test_dependency_failure_keeps_name() {
    let export = TypeExport::of::<NeedsGpu>();
    assert!(export.type_name().ends_with("NeedsGpu"));
    assert_eq!(
        export.resolve().unwrap_err(),
        TypeLoadError::MissingDependency("libgpu.so".to_string())
    );
}
