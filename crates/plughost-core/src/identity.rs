//! Module identity, the cache key for loaded modules.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{is_blank, PluginHostError, Result};

/// Identifies one module by name and content.
///
/// Two identities are equal when their qualified names and content hashes are
/// equal. The origin is where the module was first found and does not take
/// part in comparisons, so the same bytes reached through different search
/// paths map to a single cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleIdentity {
    qualified_name: String,
    origin: PathBuf,
    hash: String,
}

impl ModuleIdentity {
    pub fn new(
        qualified_name: impl Into<String>,
        origin: impl Into<PathBuf>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            origin: origin.into(),
            hash: hash.into(),
        }
    }

    /// Build the identity of the file at `path`, hashing its contents.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if is_blank(path) {
            return Err(PluginHostError::EmptyArgument("path"));
        }

        let origin = path.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PluginHostError::ModuleNotFound(path.display().to_string())
            }
            _ => PluginHostError::Io(e),
        })?;

        let hash = hash_file(&origin)?;
        Ok(Self::new(qualified_name(&origin), origin, hash))
    }

    /// File stem without the platform library prefix.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Canonical path the module was resolved from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Lowercase hex SHA-256 of the module file.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// First twelve hex digits of the hash, for log lines.
    pub fn short_hash(&self) -> &str {
        self.hash.get(..12).unwrap_or(&self.hash)
    }
}

impl PartialEq for ModuleIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.qualified_name == other.qualified_name && self.hash == other.hash
    }
}

impl Eq for ModuleIdentity {}

impl Hash for ModuleIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.qualified_name.hash(state);
        self.hash.hash(state);
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.qualified_name, self.short_hash())
    }
}

/// Module name derived from a file path: the stem, minus a `lib` prefix on
/// platforms that add one.
pub fn qualified_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let prefix = std::env::consts::DLL_PREFIX;
    match stem.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() && !rest.is_empty() => rest.to_string(),
        _ => stem,
    }
}

/// SHA-256 digest of a file.
pub fn digest_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Lowercase hex SHA-256 of a file.
pub fn hash_file(path: &Path) -> Result<String> {
    Ok(hex::encode(digest_file(path)?))
}
