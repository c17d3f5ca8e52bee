//! Ordered set of directories probed when a module is named rather than located.
//!
//! Entries are stored normalized: absolute, lexically cleaned and terminated
//! with the platform separator. This module never touches the filesystem.

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

use crate::error::{is_blank, PluginHostError, Result};

/// Ordered, deduplicated list of search directories. First match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPathSet {
    entries: Vec<String>,
}

impl SearchPathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a directory. Returns `false` if it was already present.
    pub fn add(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        let normalized = normalize(path.as_ref())?;
        if self.position(&normalized).is_some() {
            return Ok(false);
        }
        self.entries.push(normalized);
        Ok(true)
    }

    /// Remove a directory. Returns `false` if it was not present.
    pub fn remove(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        let normalized = normalize(path.as_ref())?;
        match self.position(&normalized) {
            Some(index) => {
                self.entries.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_at(&mut self, index: usize) -> Option<String> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        normalize(path.as_ref())
            .map(|normalized| self.position(&normalized).is_some())
            .unwrap_or(false)
    }

    /// Remove every entry. Defaults are not restored.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Append the host executable directory, the working directory, the OS
    /// library directories and every `PATH` entry, skipping known entries.
    pub fn populate_defaults(&mut self) {
        for dir in default_directories() {
            // Blank PATH entries are skipped
            let _ = self.add(dir);
        }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, normalized: &str) -> Option<usize> {
        let key = compare_key(normalized);
        self.entries.iter().position(|entry| compare_key(entry) == key)
    }
}

impl<'a> IntoIterator for &'a SearchPathSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Normalize a directory path: absolute, `.` and `..` resolved lexically,
/// trailing separator appended.
pub fn normalize(path: &Path) -> Result<String> {
    if is_blank(path) {
        return Err(PluginHostError::EmptyArgument("path"));
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pops past the root
                if matches!(
                    cleaned.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    cleaned.pop();
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }

    let mut normalized = cleaned.to_string_lossy().into_owned();
    if !normalized.ends_with(MAIN_SEPARATOR) {
        normalized.push(MAIN_SEPARATOR);
    }
    Ok(normalized)
}

#[cfg(windows)]
fn compare_key(path: &str) -> String {
    path.to_lowercase()
}

#[cfg(not(windows))]
fn compare_key(path: &str) -> String {
    path.to_string()
}

fn default_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }

    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }

    dirs.extend(system_directories());

    if let Some(path_var) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path_var));
    }

    dirs
}

#[cfg(unix)]
fn system_directories() -> Vec<PathBuf> {
    ["/usr/local/lib", "/usr/lib", "/lib"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

#[cfg(windows)]
fn system_directories() -> Vec<PathBuf> {
    match std::env::var_os("SystemRoot") {
        Some(root) => {
            let root = PathBuf::from(root);
            vec![root.join("System32"), root]
        }
        None => Vec::new(),
    }
}

#[cfg(not(any(unix, windows)))]
fn system_directories() -> Vec<PathBuf> {
    Vec::new()
}
