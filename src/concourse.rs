//! Concourse resource request/response envelopes.

use serde::{Deserialize, Serialize};

use crate::config::{OutParams, SourceConfig};
use crate::version::Version;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub source: SourceConfig,
    #[serde(default)]
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InRequest {
    pub source: SourceConfig,
    #[serde(default)]
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutRequest {
    pub source: SourceConfig,
    #[serde(default)]
    pub params: OutParams,
}

/// One `{name, value}` entry shown in the Concourse UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Response of `in` and `out`.
#[derive(Debug, Clone, Serialize)]
pub struct VersionResponse {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}
