use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Observed deployment state as handed to Concourse.
///
/// Two versions are equal when their manifest fingerprints are equal; the
/// target is carried for the operator's benefit only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub manifest_sha256: String,
    pub target: String,
}

impl Version {
    pub fn from_manifest(target: &str, manifest: &str) -> Self {
        Self {
            manifest_sha256: fingerprint(manifest.as_bytes()),
            target: target.to_string(),
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.manifest_sha256 == other.manifest_sha256
    }
}

impl Eq for Version {}

/// Lowercase hex SHA-256 of the given bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
