//! Code units and the naming convention that maps them to resource paths.

use std::sync::Arc;

use sha2::Digest as _;
use sha2::Sha256;

/// File extension of a compiled code unit.
pub const UNIT_EXTENSION: &str = "wasm";

/// A named piece of compiled code plus its bytes. Immutable once captured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeUnit {
    pub name: String,
    pub bytes: Arc<[u8]>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// `demo.answer` -> `/demo/answer.wasm`
    pub fn resource_path(&self) -> String {
        resource_path(&self.name)
    }

    /// Content digest, used to share compiled modules between identical units.
    pub fn digest(&self) -> Digest {
        digest(&self.bytes)
    }
}

pub fn resource_path(name: &str) -> String {
    format!("/{}.{}", name.replace('.', "/"), UNIT_EXTENSION)
}

/// Inverse of [`resource_path`]. Accepts paths with or without the leading slash and with
/// either separator; returns `None` for anything that is not a compiled unit.
///
/// `demo/answer.wasm` -> `demo.answer`
pub fn unit_name_from_path(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    let stem = path.strip_suffix(UNIT_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.replace(['/', '\\'], "."))
}

/// SHA-256 of a unit's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

pub fn digest(bytes: &[u8]) -> Digest {
    Digest(Sha256::digest(bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_path_roundtrip() {
        let unit = CodeUnit::new("demo.answer", b"bytes".to_vec());
        assert_eq!(unit.resource_path(), "/demo/answer.wasm");
        assert_eq!(unit_name_from_path(&unit.resource_path()).as_deref(), Some("demo.answer"));
    }

    #[test]
    fn test_unit_name_rejects_other_files() {
        assert_eq!(unit_name_from_path("notes.txt"), None);
        assert_eq!(unit_name_from_path(".wasm"), None);
        assert_eq!(unit_name_from_path("a\\b\\c.wasm").as_deref(), Some("a.b.c"));
    }

    #[test]
    fn test_digest_distinguishes_content() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(
            digest(b"abc").to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
