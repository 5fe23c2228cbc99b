use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::concourse::{MetadataField, VersionResponse};
use crate::deploy::manifest_metadata;
use crate::director::Director;
use crate::error::Result;
use crate::version::Version;

pub const MANIFEST_FILE: &str = "manifest.yml";
pub const TARGET_FILE: &str = "target";

/// Writes the deployed manifest and director target into the `in` destination.
pub struct FetchPipeline {
    director: Arc<dyn Director>,
    deployment: String,
    target: String,
}

impl FetchPipeline {
    pub fn new(
        director: Arc<dyn Director>,
        deployment: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            director,
            deployment: deployment.into(),
            target: target.into(),
        }
    }

    pub async fn run(&self, requested: Option<&Version>, dest: &Path) -> Result<VersionResponse> {
        let manifest = self.director.current_manifest().await?;
        let observed = Version::from_manifest(&self.target, &manifest);
        if let Some(requested) = requested
            && *requested != observed
        {
            warn!(
                requested = %requested.manifest_sha256,
                observed = %observed.manifest_sha256,
                "deployment changed since the requested version"
            );
        }

        fs::create_dir_all(dest)?;
        fs::write(dest.join(MANIFEST_FILE), &manifest)?;
        fs::write(dest.join(TARGET_FILE), &self.target)?;
        info!(dest = %dest.display(), "manifest written");

        let mut metadata = vec![MetadataField::new("deployment", &self.deployment)];
        metadata.extend(manifest_metadata(&manifest));
        Ok(VersionResponse {
            version: observed,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::config::OutParams;
    use crate::error::DeployResourceError;

    struct StaticDirector(Option<&'static str>);

    #[async_trait]
    impl Director for StaticDirector {
        async fn deploy(&self, _params: &OutParams) -> Result<Version> {
            unreachable!("in never deploys")
        }

        async fn current_manifest(&self) -> Result<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| DeployResourceError::NotFound("no deployment".into()))
        }

        async fn deployments(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn has_locks(&self) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn writes_manifest_and_target() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out");
        let manifest = "name: my-deploy\nreleases:\n- name: redis\n  version: '1'\n";
        let pipeline = FetchPipeline::new(
            Arc::new(StaticDirector(Some(manifest))),
            "my-deploy",
            "10.0.0.6",
        );
        let requested = Version::from_manifest("10.0.0.6", "name: older\n");

        let response = pipeline.run(Some(&requested), &dest).await.unwrap();
        assert_eq!(response.version, Version::from_manifest("10.0.0.6", manifest));
        assert_eq!(fs::read_to_string(dest.join(MANIFEST_FILE)).unwrap(), manifest);
        assert_eq!(fs::read_to_string(dest.join(TARGET_FILE)).unwrap(), "10.0.0.6");
        assert_eq!(
            response.metadata,
            vec![
                MetadataField::new("deployment", "my-deploy"),
                MetadataField::new("release", "redis/1"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_deployment_is_an_error() {
        let dir = tempdir().unwrap();
        let pipeline = FetchPipeline::new(Arc::new(StaticDirector(None)), "my-deploy", "t");
        let err = pipeline.run(None, dir.path()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!dir.path().join(MANIFEST_FILE).exists());
    }
}
