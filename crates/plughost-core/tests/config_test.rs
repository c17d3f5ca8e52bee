//! Host configuration from files and `PLUGHOST_*` environment variables.
//!
//! Environment overrides live in one test so nothing else in this binary
//! observes them half-applied.

use std::path::PathBuf;

use plughost_core::config::env_vars;
use plughost_core::{HostConfig, PluginHost, PluginHostError, ProbeMode, SigningMode};

#[test]
fn test_environment_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let joined = std::env::join_paths([&first, &second]).unwrap();

    std::env::set_var(env_vars::PLUGIN_PATH, &joined);
    std::env::set_var(env_vars::PROBE_MODE, "in-process");
    std::env::set_var(env_vars::PROBE_TIMEOUT_MS, " 1500 ");
    std::env::set_var(env_vars::PROBE_RUNNER, "/opt/plughost/bin/plughost-probe");

    let config = HostConfig::from_env().unwrap();
    assert_eq!(config.search_paths, vec![first.clone(), second.clone()]);
    assert_eq!(config.probe.mode, ProbeMode::InProcess);
    assert_eq!(config.probe.timeout_ms, 1500);
    assert_eq!(
        config.probe.runner,
        Some(PathBuf::from("/opt/plughost/bin/plughost-probe"))
    );

    // Overrides extend a file config rather than replacing it
    let mut from_file = HostConfig::from_toml_str("search_paths = [\"/opt/base\"]").unwrap();
    from_file.apply_env().unwrap();
    assert_eq!(from_file.search_paths[0], PathBuf::from("/opt/base"));
    assert_eq!(from_file.search_paths.len(), 3);

    std::env::set_var(env_vars::PROBE_TIMEOUT_MS, "soon");
    assert!(matches!(
        HostConfig::from_env(),
        Err(PluginHostError::Config(_))
    ));

    std::env::set_var(env_vars::PROBE_TIMEOUT_MS, "0");
    assert!(matches!(
        HostConfig::from_env(),
        Err(PluginHostError::Config(_))
    ));

    std::env::set_var(env_vars::PROBE_TIMEOUT_MS, "1500");
    std::env::set_var(env_vars::PROBE_MODE, "sandbox");
    assert!(HostConfig::from_env().is_err());

    for var in [
        env_vars::PLUGIN_PATH,
        env_vars::PROBE_MODE,
        env_vars::PROBE_TIMEOUT_MS,
        env_vars::PROBE_RUNNER,
    ] {
        std::env::remove_var(var);
    }
    assert_eq!(HostConfig::from_env().unwrap(), HostConfig::default());
}

#[test]
fn test_load_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    std::fs::create_dir_all(&plugins).unwrap();

    let path = dir.path().join("plughost.toml");
    std::fs::write(
        &path,
        format!(
            r#"
search_paths = [{:?}]
populate_default_search_paths = true

[probe]
mode = "in-process"

[signing]
mode = "warn"
"#,
            plugins.to_string_lossy()
        ),
    )
    .unwrap();

    let config = HostConfig::load(&path).unwrap();
    assert_eq!(config.signing.mode, SigningMode::Warn);

    let host = PluginHost::new(config).unwrap();
    let search_paths = host.search_paths();
    assert!(search_paths.contains(&plugins));
    // Configured paths come before the defaults
    assert!(search_paths.get(0).unwrap().starts_with(&*plugins.to_string_lossy()));
    assert!(search_paths.len() > 1);
    assert_eq!(host.cache().verifier().probe_strategy(), "in-process");
}

#[test]
fn test_missing_config_file() {
    let err = HostConfig::load("/definitely/not/here/plughost.toml").unwrap_err();
    assert!(matches!(err, PluginHostError::Io(_)), "{err}");
}
