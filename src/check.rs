use std::sync::Arc;

use tracing::{debug, info};

use crate::director::Director;
use crate::error::Result;
use crate::version::Version;

/// Progress of a single check invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Idle,
    FetchingManifest,
    Fingerprinting,
    Done,
    Failed,
}

/// Turns the director's current manifest into the version list Concourse expects.
pub struct CheckEngine {
    director: Arc<dyn Director>,
    target: String,
    skip: bool,
    state: CheckState,
}

impl CheckEngine {
    pub fn new(director: Arc<dyn Director>, target: impl Into<String>) -> Self {
        Self {
            director,
            target: target.into(),
            skip: false,
            state: CheckState::Idle,
        }
    }

    /// Report no versions without contacting the director.
    pub fn skipping(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    /// Empty when the deployment does not exist; otherwise exactly one version,
    /// which is `last` itself when the manifest is unchanged.
    pub async fn check(&mut self, last: Option<&Version>) -> Result<Vec<Version>> {
        if self.skip {
            info!("check skipped by source configuration");
            self.state = CheckState::Done;
            return Ok(Vec::new());
        }

        self.state = CheckState::FetchingManifest;
        let manifest = match self.director.current_manifest().await {
            Ok(manifest) => manifest,
            Err(err) if err.is_not_found() => {
                info!("deployment does not exist yet");
                self.state = CheckState::Done;
                return Ok(Vec::new());
            }
            Err(err) => {
                self.state = CheckState::Failed;
                return Err(err);
            }
        };

        self.state = CheckState::Fingerprinting;
        let current = Version::from_manifest(&self.target, &manifest);
        debug!(fingerprint = %current.manifest_sha256, "manifest fingerprinted");

        let versions = match last {
            Some(last) if *last == current => vec![last.clone()],
            _ => vec![current],
        };
        self.state = CheckState::Done;
        Ok(versions)
    }
}
