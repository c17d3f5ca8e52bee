//! Plugin type verification.
//!
//! Answers "does this file export plugin types?" before the module cache
//! commits to loading it. The question is asked through a [`ModuleProbe`]:
//!
//! - [`ProcessProbe`] runs the `plughost-probe` binary on the candidate and reads
//!   a JSON [`ProbeOutcome`] from its stdout. A crash or hang stays in the child.
//! - [`LoaderProbe`] loads the candidate into a throwaway image in this process
//!   and drops it again before returning.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{is_blank, PluginHostError, Result};
use crate::format::ModuleFormat;
use crate::loader::{resolve_exports, ModuleLoader, NativeLoader, TypeFailure};
use crate::log::{null_log, LogLevel, LogSink};

/// Default probe runner timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the probe runner binary, without platform suffix.
pub const PROBE_RUNNER_NAME: &str = "plughost-probe";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Plain-data result of probing one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub module: PathBuf,
    pub format: Option<ModuleFormat>,
    /// Discoverable plugin types, sorted
    pub type_names: BTreeSet<String>,
    /// Exported types that failed to resolve
    #[serde(default)]
    pub failures: Vec<TypeFailure>,
}

impl ProbeReport {
    pub fn is_plugin_module(&self) -> bool {
        !self.type_names.is_empty()
    }
}

/// Wire format of the probe runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeOutcome {
    Ok { report: ProbeReport },
    Error { kind: String, message: String },
}

impl ProbeOutcome {
    pub fn from_result(result: Result<ProbeReport>) -> Self {
        match result {
            Ok(report) => ProbeOutcome::Ok { report },
            Err(e) => ProbeOutcome::Error {
                kind: e.kind().to_string(),
                message: match &e {
                    PluginHostError::BadModuleFormat { reason, .. } => reason.clone(),
                    other => other.to_string(),
                },
            },
        }
    }

    /// Turn the outcome back into a result for `candidate`.
    pub fn into_result(self, candidate: &Path) -> Result<ProbeReport> {
        match self {
            ProbeOutcome::Ok { report } => Ok(report),
            ProbeOutcome::Error { kind, message } => Err(match kind.as_str() {
                "BadModuleFormat" => PluginHostError::bad_format(candidate, message),
                "ModuleNotFound" => PluginHostError::ModuleNotFound(candidate.display().to_string()),
                "NotAPluginModule" => PluginHostError::NotAPluginModule(candidate.to_path_buf()),
                _ => PluginHostError::ProbeFailed(format!("{}: {}", kind, message)),
            }),
        }
    }
}

/// Inspects a candidate without committing it to the host.
pub trait ModuleProbe: Send + Sync {
    fn inspect(&self, candidate: &Path) -> Result<ProbeReport>;

    /// Short name for log lines.
    fn name(&self) -> &'static str;
}

/// Loads the candidate through `L`, resolves its exports and drops it again.
pub struct LoaderProbe<L> {
    loader: L,
    log: Arc<dyn LogSink>,
}

impl<L: ModuleLoader> LoaderProbe<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            log: null_log(),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }
}

impl LoaderProbe<NativeLoader> {
    pub fn native() -> Self {
        Self::new(NativeLoader)
    }
}

impl<L: ModuleLoader> ModuleProbe for LoaderProbe<L> {
    fn inspect(&self, candidate: &Path) -> Result<ProbeReport> {
        let image = self.loader.load(candidate)?;
        let resolved = resolve_exports(&image.exports, self.log.as_ref());

        let report = ProbeReport {
            module: candidate.to_path_buf(),
            format: ModuleFormat::inspect(candidate).ok(),
            type_names: resolved.plugin_names().map(str::to_string).collect(),
            failures: resolved.failures.clone(),
        };

        // Types before the library that holds their code
        drop(resolved);
        drop(image);
        Ok(report)
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}

/// Runs the probe runner binary on the candidate in a child process.
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    runner: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl ProcessProbe {
    pub fn new(runner: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.into(),
            args: Vec::new(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments passed before the candidate path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn runner(&self) -> &Path {
        &self.runner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Find the runner next to the current executable, then on `PATH`.
    pub fn locate_runner() -> Option<PathBuf> {
        let file_name = format!("{}{}", PROBE_RUNNER_NAME, std::env::consts::EXE_SUFFIX);

        let sibling = std::env::current_exe().ok().and_then(|exe| {
            let dir = exe.parent()?;
            // Test binaries live one level below the runner, in deps/
            [Some(dir), dir.parent()]
                .into_iter()
                .flatten()
                .map(|dir| dir.join(&file_name))
                .find(|candidate| candidate.is_file())
        });

        sibling.or_else(|| which::which(PROBE_RUNNER_NAME).ok())
    }
}

impl ModuleProbe for ProcessProbe {
    fn inspect(&self, candidate: &Path) -> Result<ProbeReport> {
        let mut child = Command::new(&self.runner)
            .args(&self.args)
            .arg(candidate)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                PluginHostError::ProbeFailed(format!(
                    "Failed to start probe runner {}: {}",
                    self.runner.display(),
                    e
                ))
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginHostError::ProbeFailed("Probe runner has no stdout".into()))?;
        let reader = std::thread::spawn(move || {
            let mut output = String::new();
            stdout.read_to_string(&mut output).map(|_| output)
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                // Already exited or unkillable; either way we stop waiting
                let _ = child.kill();
                let _ = child.wait();
                return Err(PluginHostError::ProbeTimeout(self.timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let output = reader
            .join()
            .map_err(|_| PluginHostError::ProbeFailed("Probe output reader panicked".into()))??;

        match serde_json::from_str::<ProbeOutcome>(output.trim()) {
            Ok(outcome) => outcome.into_result(candidate),
            Err(_) if !status.success() => Err(PluginHostError::ProbeFailed(format!(
                "Probe runner exited with {} for {}",
                status,
                candidate.display()
            ))),
            Err(e) => Err(PluginHostError::ProbeFailed(format!(
                "Unreadable probe output: {}",
                e
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Decides whether candidates are plugin modules.
#[derive(Clone)]
pub struct TypeVerifier {
    probe: Arc<dyn ModuleProbe>,
    log: Arc<dyn LogSink>,
}

impl TypeVerifier {
    pub fn new(probe: Arc<dyn ModuleProbe>) -> Self {
        Self {
            probe,
            log: null_log(),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn probe_strategy(&self) -> &'static str {
        self.probe.name()
    }

    /// Detailed probe. Fails for blank or missing paths and for files that
    /// cannot be probed.
    pub fn inspect(&self, candidate: impl AsRef<Path>) -> Result<ProbeReport> {
        let candidate = candidate.as_ref();
        if is_blank(candidate) {
            return Err(PluginHostError::EmptyArgument("candidate"));
        }
        if !candidate.is_file() {
            return Err(PluginHostError::ModuleNotFound(candidate.display().to_string()));
        }

        self.log.print(
            &format!("Probing {} ({})", candidate.display(), self.probe.name()),
            LogLevel::Verbose,
        );
        let report = self.probe.inspect(candidate)?;

        for failure in &report.failures {
            self.log.print(
                &format!(
                    "{}: excluded {}: {}",
                    candidate.display(),
                    failure.type_name,
                    failure.reason
                ),
                LogLevel::Intermediate,
            );
        }
        Ok(report)
    }

    /// Conforming type names. Empty when there are none or the file cannot be probed.
    pub fn probe(&self, candidate: impl AsRef<Path>) -> BTreeSet<String> {
        let candidate = candidate.as_ref();
        match self.inspect(candidate) {
            Ok(report) => report.type_names,
            Err(e) => {
                self.log.print(
                    &format!("Probe of {} failed: {}", candidate.display(), e),
                    LogLevel::Intermediate,
                );
                BTreeSet::new()
            }
        }
    }

    pub fn is_plugin_module(&self, candidate: impl AsRef<Path>) -> bool {
        !self.probe(candidate).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_wire_format() {
        let outcome = ProbeOutcome::Error {
            kind: "BadModuleFormat".into(),
            message: "unrecognized file header".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "BadModuleFormat");

        let back: ProbeOutcome = serde_json::from_value(json).unwrap();
        assert!(matches!(
            back.into_result(Path::new("/tmp/x.so")),
            Err(PluginHostError::BadModuleFormat { .. })
        ));
    }

    #[test]
    fn test_unknown_error_kind_is_probe_failure() {
        let outcome = ProbeOutcome::Error {
            kind: "AbiMismatch".into(),
            message: "expected 1, found 2".into(),
        };
        assert!(matches!(
            outcome.into_result(Path::new("x.so")),
            Err(PluginHostError::ProbeFailed(_))
        ));
    }

    #[test]
    fn test_from_result_keeps_kind() {
        let outcome = ProbeOutcome::from_result(Err(PluginHostError::bad_format("x.so", "junk")));
        assert_eq!(
            outcome,
            ProbeOutcome::Error {
                kind: "BadModuleFormat".into(),
                message: "junk".into()
            }
        );
    }

    #[test]
    fn test_verifier_rejects_blank_and_missing() {
        let verifier = TypeVerifier::new(Arc::new(LoaderProbe::native()));
        assert!(matches!(
            verifier.inspect(" "),
            Err(PluginHostError::EmptyArgument(_))
        ));
        assert!(matches!(
            verifier.inspect("/no/such/plugin.so"),
            Err(PluginHostError::ModuleNotFound(_))
        ));
        assert!(verifier.probe("/no/such/plugin.so").is_empty());
    }
}
