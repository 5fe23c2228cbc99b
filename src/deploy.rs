use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::concourse::{MetadataField, VersionResponse};
use crate::config::OutParams;
use crate::director::Director;
use crate::error::Result;

/// Applies `out` params through the director and reports the resulting version.
pub struct DeployPipeline {
    director: Arc<dyn Director>,
    deployment: String,
    sources_dir: PathBuf,
}

impl DeployPipeline {
    pub fn new(
        director: Arc<dyn Director>,
        deployment: impl Into<String>,
        sources_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            director,
            deployment: deployment.into(),
            sources_dir: sources_dir.into(),
        }
    }

    pub async fn run(&self, params: &OutParams) -> Result<VersionResponse> {
        let params = params.rooted_at(&self.sources_dir);
        params.validate()?;

        let version = self.director.deploy(&params).await?;
        info!(
            deployment = %self.deployment,
            fingerprint = %version.manifest_sha256,
            "out finished"
        );

        let mut metadata = vec![MetadataField::new("deployment", &self.deployment)];
        if !params.delete.enabled
            && let Some(manifest) = &params.manifest
        {
            match fs::read_to_string(manifest) {
                Ok(text) => metadata.extend(manifest_metadata(&text)),
                Err(err) => {
                    warn!(manifest = %manifest.display(), error = %err, "manifest unreadable for metadata")
                }
            }
        }
        if params.dry_run {
            metadata.push(MetadataField::new("dry_run", "true"));
        }
        if params.delete.enabled {
            metadata.push(MetadataField::new("deleted", "true"));
        }

        Ok(VersionResponse { version, metadata })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ManifestSummary {
    #[serde(default)]
    releases: Vec<ReleaseRef>,
    #[serde(default)]
    stemcells: Vec<StemcellRef>,
}

#[derive(Debug, Deserialize)]
struct ReleaseRef {
    name: String,
    #[serde(default)]
    version: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StemcellRef {
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<Value>,
}

/// `release` and `stemcell` entries for the releases and stemcells a manifest references.
///
/// A manifest that does not parse yields no entries.
pub fn manifest_metadata(manifest: &str) -> Vec<MetadataField> {
    if manifest.trim().is_empty() {
        return Vec::new();
    }
    let summary: ManifestSummary = match serde_yaml_bw::from_str(manifest) {
        Ok(summary) => summary,
        Err(err) => {
            warn!(error = %err, "manifest not parseable for metadata");
            return Vec::new();
        }
    };

    let releases = summary.releases.into_iter().map(|release| {
        MetadataField::new(
            "release",
            format!("{}/{}", release.name, display_version(release.version.as_ref())),
        )
    });
    let stemcells = summary.stemcells.into_iter().map(|stemcell| {
        let alias = stemcell.alias.unwrap_or_default();
        let os = stemcell.os.or(stemcell.name).unwrap_or_default();
        MetadataField::new(
            "stemcell",
            format!("{alias}/{os}/{}", display_version(stemcell.version.as_ref())),
        )
    });
    releases.chain(stemcells).collect()
}

fn display_version(version: Option<&Value>) -> String {
    match version {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    }
}
