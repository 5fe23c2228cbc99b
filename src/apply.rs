use std::sync::Arc;

use tracing::{Instrument, info, info_span};

use crate::check::CheckEngine;
use crate::concourse::{CheckRequest, InRequest, OutRequest};
use crate::config::{Action, RuntimeConfig, SourceConfig};
use crate::coordinator::CliCoordinator;
use crate::deploy::DeployPipeline;
use crate::director::{BoshDirector, Director};
use crate::error::Result;
use crate::fetch::FetchPipeline;
use crate::redact::stderr_sink;
use crate::runner::{CommandRunner, ProcessCommandRunner};
use crate::tunnel::{SshTunnelProvider, TunnelProvider};

/// Runs one resource step against the real bosh CLI and SSH tunnels.
///
/// Returns the JSON response; nothing is produced unless the whole step succeeded.
pub async fn run(config: &RuntimeConfig, request: &str) -> Result<String> {
    let runner: Arc<dyn CommandRunner> =
        Arc::new(ProcessCommandRunner::new(stderr_sink(), config.retry));
    let tunnels: Arc<dyn TunnelProvider> = Arc::new(SshTunnelProvider::default());
    run_with(config, request, runner, tunnels).await
}

pub async fn run_with(
    config: &RuntimeConfig,
    request: &str,
    runner: Arc<dyn CommandRunner>,
    tunnels: Arc<dyn TunnelProvider>,
) -> Result<String> {
    let director = |source: SourceConfig| -> Arc<dyn Director> {
        let coordinator = CliCoordinator::new(source, tunnels.clone())
            .with_cli_path(config.cli_path.clone())
            .with_temp_root(config.temp_root.clone());
        Arc::new(BoshDirector::new(coordinator, runner.clone()))
    };

    match &config.action {
        Action::Check => {
            let request: CheckRequest = serde_json::from_str(request)?;
            let span = stage_span("check", &request.source);
            let CheckRequest { source, version } = request;
            let target = source.target.clone();
            let skip = source.skip_check;
            let mut engine = CheckEngine::new(director(source), target).skipping(skip);
            let versions = engine.check(version.as_ref()).instrument(span).await?;
            info!(versions = versions.len(), "check complete");
            Ok(serde_json::to_string(&versions)?)
        }
        Action::In { destination } => {
            let request: InRequest = serde_json::from_str(request)?;
            let span = stage_span("in", &request.source);
            let InRequest { source, version } = request;
            let pipeline = FetchPipeline::new(
                director(source.clone()),
                &source.deployment,
                &source.target,
            );
            let response = pipeline
                .run(version.as_ref(), destination)
                .instrument(span)
                .await?;
            Ok(serde_json::to_string(&response)?)
        }
        Action::Out { sources } => {
            let request: OutRequest = serde_json::from_str(request)?;
            let span = stage_span("out", &request.source);
            let OutRequest { source, params } = request;
            let deployment = source.deployment.clone();
            let pipeline = DeployPipeline::new(director(source), deployment, sources);
            let response = pipeline.run(&params).instrument(span).await?;
            Ok(serde_json::to_string(&response)?)
        }
    }
}

fn stage_span(stage: &str, source: &SourceConfig) -> tracing::Span {
    info_span!(
        "resource",
        stage = stage,
        deployment = %source.deployment,
        director = %source.director_host,
    )
}
