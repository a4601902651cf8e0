use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Article handed to the engine by the ingestion side. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
}

impl Article {
    pub fn new(id: i64, content: impl Into<String>) -> Self {
        Self {
            id,
            title: None,
            content: content.into(),
        }
    }

    /// Cache/job key for this article under the given perspective config version.
    pub fn fingerprint(&self, config_version: &str) -> Fingerprint {
        Fingerprint::compute(self.id, &self.content, config_version)
    }
}

/// Stable hash of article id, content and perspective config version.
///
/// Two requests share a fingerprint only when they name the same article with
/// the same text under the same config. A version bump never matches old entries,
/// and two articles carrying one body are scored and versioned separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(article_id: i64, content: &str, config_version: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
        hasher.update(article_id.to_le_bytes());
        hasher.update([0u8]);
        hasher.update(config_version.as_bytes());
        Self(hex(&hasher.finalize()))
    }

    /// Wrap an already computed fingerprint, e.g. one received from a client.
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
