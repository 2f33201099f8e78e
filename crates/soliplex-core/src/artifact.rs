//! Artifact kinds and content addressing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Class of intermediate output produced by a step.
///
/// The string labels are stable: they appear in storage paths and database
/// rows and must never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Raw,
    ParsedText,
    ParsedStructured,
    Chunks,
    Embeddings,
    StoreReceipt,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        Self::Raw,
        Self::ParsedText,
        Self::ParsedStructured,
        Self::Chunks,
        Self::Embeddings,
        Self::StoreReceipt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::ParsedText => "parsed-text",
            Self::ParsedStructured => "parsed-structured",
            Self::Chunks => "chunks",
            Self::Embeddings => "embeddings",
            Self::StoreReceipt => "store-receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "parsed-text" => Some(Self::ParsedText),
            "parsed-structured" => Some(Self::ParsedStructured),
            "chunks" => Some(Self::Chunks),
            "embeddings" => Some(Self::Embeddings),
            "store-receipt" => Some(Self::StoreReceipt),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 content hash of a byte slice, as lowercase hex.
///
/// This is the document identity used everywhere: two ingests of the same
/// bytes always resolve to the same hash regardless of URI or source.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_stable() {
        assert_eq!(ArtifactKind::Raw.as_str(), "raw");
        assert_eq!(ArtifactKind::ParsedText.as_str(), "parsed-text");
        assert_eq!(ArtifactKind::StoreReceipt.as_str(), "store-receipt");
        for kind in ArtifactKind::ALL {
            assert_eq!(ArtifactKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_content_hash_deterministic() {
        let a = content_hash(b"hello world");
        let b = content_hash(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(b"hello worlds"));
    }

    #[test]
    fn test_content_hash_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
