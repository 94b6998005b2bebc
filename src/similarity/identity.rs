//! Content-addressable identifiers for corpus items.
//!
//! An item's identifier is the lowercase hex MD5 of its trimmed,
//! lowercased name. Both the hash and the normalization are part of the
//! on-disk contract shared with other indexers of the same archive: changing
//! either makes every stored entry look new to the synchronizer.

use serde::Serialize;
use md5::{Digest, Md5};

/// A corpus item paired with its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CorpusItem {
    pub name: String,
    pub identifier: String,
}

impl CorpusItem {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let identifier = identifier(&name);
        Self { name, identifier }
    }
}

/// Normalize a name the way identifiers are derived from it.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Compute the identifier for a corpus item name.
pub fn identifier(name: &str) -> String {
    let digest = Md5::digest(normalize_name(name).as_bytes());
    format!("{:x}", digest)
}
