//! Detached module signatures.
//!
//! A signed module ships with `<file name>.sig` next to it: a small JSON
//! document holding an Ed25519 public key and a signature over the SHA-256
//! digest of the module. Verification is advisory; callers decide policy.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{is_blank, PluginHostError, Result};
use crate::format::ModuleFormat;
use crate::identity::digest_file;

/// Algorithm name written to signature files.
pub const ED25519: &str = "ed25519";

/// Extension appended to the module file name.
pub const SIGNATURE_EXTENSION: &str = "sig";

bitflags! {
    /// Outcome of a signature check. Empty means not signed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SigningStatus: u8 {
        const SIGNED = 0b0000_0001;
        const KEY_MISMATCH = 0b0000_0010;
    }
}

impl SigningStatus {
    pub const NOT_SIGNED: Self = Self::empty();

    pub fn is_signed(&self) -> bool {
        self.contains(Self::SIGNED)
    }

    /// Signed, and by the expected key if one was given.
    pub fn is_trusted(&self) -> bool {
        self.is_signed() && !self.contains(Self::KEY_MISMATCH)
    }
}

/// Contents of a `.sig` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFile {
    pub algorithm: String,
    /// Hex encoded public key
    pub public_key: String,
    /// Hex encoded signature
    pub signature: String,
}

/// Where the signature of `module_path` lives.
pub fn signature_path(module_path: &Path) -> PathBuf {
    let mut name = module_path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(SIGNATURE_EXTENSION);
    module_path.with_file_name(name)
}

/// Check the detached signature of a module.
///
/// Returns `NOT_SIGNED` for blank or missing paths, files that are not native
/// modules, and missing, malformed or invalid signatures. Fails only on I/O
/// errors other than "not found".
pub fn verify_signature(
    module_path: impl AsRef<Path>,
    expected_public_key: Option<&[u8]>,
) -> Result<SigningStatus> {
    let module_path = module_path.as_ref();
    if is_blank(module_path) {
        return Ok(SigningStatus::NOT_SIGNED);
    }

    match ModuleFormat::inspect(module_path) {
        Ok(_) => {}
        Err(PluginHostError::Io(e)) => return Err(PluginHostError::Io(e)),
        Err(_) => return Ok(SigningStatus::NOT_SIGNED),
    }

    let Some(sig) = read_signature_file(&signature_path(module_path))? else {
        return Ok(SigningStatus::NOT_SIGNED);
    };
    if !sig.algorithm.eq_ignore_ascii_case(ED25519) {
        return Ok(SigningStatus::NOT_SIGNED);
    }

    let (Ok(public_key), Ok(signature)) = (hex::decode(&sig.public_key), hex::decode(&sig.signature))
    else {
        return Ok(SigningStatus::NOT_SIGNED);
    };

    let digest = match digest_file(module_path) {
        Ok(digest) => digest,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SigningStatus::NOT_SIGNED)
        }
        Err(e) => return Err(e.into()),
    };

    let verifier = UnparsedPublicKey::new(&signature::ED25519, &public_key);
    if verifier.verify(&digest, &signature).is_err() {
        return Ok(SigningStatus::NOT_SIGNED);
    }

    let mut status = SigningStatus::SIGNED;
    if let Some(expected) = expected_public_key {
        if expected != public_key.as_slice() {
            status |= SigningStatus::KEY_MISMATCH;
        }
    }
    Ok(status)
}

/// Sign a module with a PKCS#8 Ed25519 key and write its `.sig` file.
pub fn sign_module(module_path: impl AsRef<Path>, pkcs8_key: &[u8]) -> Result<SignatureFile> {
    let module_path = module_path.as_ref();
    if is_blank(module_path) {
        return Err(PluginHostError::EmptyArgument("module_path"));
    }

    let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8_key)
        .map_err(|e| PluginHostError::Config(format!("Invalid signing key: {}", e)))?;

    let digest = digest_file(module_path)?;
    let sig = SignatureFile {
        algorithm: ED25519.to_string(),
        public_key: hex::encode(key_pair.public_key().as_ref()),
        signature: hex::encode(key_pair.sign(&digest).as_ref()),
    };

    std::fs::write(signature_path(module_path), serde_json::to_vec_pretty(&sig)?)?;
    Ok(sig)
}

/// Generate a fresh PKCS#8 encoded Ed25519 key.
pub fn generate_signing_key() -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| PluginHostError::Config("Failed to generate signing key".to_string()))?;
    Ok(pkcs8.as_ref().to_vec())
}

/// Public key of a PKCS#8 Ed25519 key.
pub fn public_key_of(pkcs8_key: &[u8]) -> Result<Vec<u8>> {
    let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8_key)
        .map_err(|e| PluginHostError::Config(format!("Invalid signing key: {}", e)))?;
    Ok(key_pair.public_key().as_ref().to_vec())
}

fn read_signature_file(path: &Path) -> Result<Option<SignatureFile>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&raw).ok())
}
