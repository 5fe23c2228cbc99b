use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::OutParams;
use crate::coordinator::{CliCoordinator, Session};
use crate::error::{DeployResourceError, Result};
use crate::runner::{CommandResult, CommandRunner, CommandSpec};
use crate::version::Version;

/// Typed operations against the deployment named in the source.
#[async_trait]
pub trait Director: Send + Sync {
    /// Uploads releases/stemcells, then deploys (or deletes) and returns the resulting version.
    async fn deploy(&self, params: &OutParams) -> Result<Version>;

    /// Manifest currently held by the director; `NotFound` when the deployment does not exist.
    async fn current_manifest(&self) -> Result<String>;

    async fn deployments(&self) -> Result<Vec<String>>;

    /// Whether the director holds a lock on this deployment. Advisory only.
    async fn has_locks(&self) -> Result<bool>;
}

/// Director driven through the bosh CLI.
pub struct BoshDirector {
    coordinator: CliCoordinator,
    runner: Arc<dyn CommandRunner>,
}

impl BoshDirector {
    pub fn new(coordinator: CliCoordinator, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            coordinator,
            runner,
        }
    }

    async fn run(&self, session: &Session, spec: CommandSpec) -> Result<CommandResult> {
        self.runner.run(session, &spec).await?.into_result()
    }

    async fn fetch_manifest(&self, session: &Session) -> Result<String> {
        let result = self
            .run(session, CommandSpec::capture("manifest").arg("--json"))
            .await?;
        parse_manifest(&result.stdout)
    }

    async fn locked(&self, session: &Session) -> Result<bool> {
        let result = self
            .run(session, CommandSpec::capture("locks").arg("--json"))
            .await?;
        let deployment = &self.coordinator.source().deployment;
        Ok(parse_lock_resources(&result.stdout)?
            .iter()
            .any(|resource| resource == deployment))
    }
}

#[async_trait]
impl Director for BoshDirector {
    async fn deploy(&self, params: &OutParams) -> Result<Version> {
        params.validate()?;
        let source = self.coordinator.source();
        let secrets = if params.no_redact {
            Vec::new()
        } else {
            var_secrets(params)?
        };

        let session = self.coordinator.open_session().await?;

        // Advisory: contention is retried by the runner either way.
        match self.locked(&session).await {
            Ok(true) => warn!(
                deployment = %source.deployment,
                "director holds a lock on this deployment; the operation will contend for it"
            ),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "lock lookup failed, deploying anyway"),
        }

        for release in &params.releases {
            info!(release = %release.display(), "uploading release");
            self.run(&session, CommandSpec::stream("upload-release").arg(path_arg(release)))
                .await?;
        }
        for stemcell in &params.stemcells {
            info!(stemcell = %stemcell.display(), "uploading stemcell");
            self.run(&session, CommandSpec::stream("upload-stemcell").arg(path_arg(stemcell)))
                .await?;
        }

        if params.delete.enabled {
            let mut spec = CommandSpec::stream("delete-deployment");
            if params.delete.force {
                spec = spec.arg("--force");
            }
            self.run(&session, spec).await?;
            info!(deployment = %source.deployment, "deployment deleted");
            return Ok(Version::from_manifest(&source.target, ""));
        }

        let manifest = params.manifest.as_deref().ok_or_else(|| {
            DeployResourceError::Config("params.manifest is required to deploy".into())
        })?;
        let spec = deploy_spec(&session, manifest, params, secrets)?;
        self.run(&session, spec).await?;
        info!(deployment = %source.deployment, dry_run = params.dry_run, "deploy finished");

        if params.cleanup && !params.dry_run {
            self.run(&session, CommandSpec::stream("clean-up")).await?;
        }

        let deployed = match self.fetch_manifest(&session).await {
            Ok(text) => text,
            Err(err) if err.is_not_found() && params.dry_run => String::new(),
            Err(err) => return Err(err),
        };
        Ok(Version::from_manifest(&source.target, &deployed))
    }

    async fn current_manifest(&self) -> Result<String> {
        let session = self.coordinator.open_session().await?;
        self.fetch_manifest(&session).await
    }

    async fn deployments(&self) -> Result<Vec<String>> {
        let session = self.coordinator.open_session().await?;
        let result = self
            .run(&session, CommandSpec::capture("deployments").arg("--json"))
            .await?;
        parse_deployments(&result.stdout)
    }

    async fn has_locks(&self) -> Result<bool> {
        let session = self.coordinator.open_session().await?;
        self.locked(&session).await
    }
}

fn deploy_spec(
    session: &Session,
    manifest: &Path,
    params: &OutParams,
    secrets: Vec<String>,
) -> Result<CommandSpec> {
    let mut spec = CommandSpec::stream("deploy")
        .arg(path_arg(manifest))
        .secrets(secrets);

    if params.dry_run {
        spec = spec.arg("--dry-run");
    }
    if params.recreate {
        spec = spec.arg("--recreate");
    }
    for target in &params.skip_drain {
        spec = spec.arg(format!("--skip-drain={target}"));
    }
    if let Some(max_in_flight) = params.max_in_flight {
        spec = spec.arg(format!("--max-in-flight={max_in_flight}"));
    }
    if params.no_redact {
        spec = spec.arg("--no-redact");
    }
    // Inline vars go through a private file so their values never appear in argv.
    if !params.vars.is_empty() {
        let vars = serde_yaml_bw::to_string(&params.vars)?;
        let path = session.write_private_file("vars.yml", vars.as_bytes())?;
        spec = spec.args(["-l".to_string(), path_arg(&path)]);
    }
    for file in &params.vars_files {
        spec = spec.args(["-l".to_string(), path_arg(file)]);
    }
    for (name, path) in &params.var_files {
        spec = spec.args(["--var-file".to_string(), format!("{name}={}", path.display())]);
    }
    for file in &params.ops_files {
        spec = spec.args(["-o".to_string(), path_arg(file)]);
    }
    Ok(spec)
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Scalar values supplied as deploy variables, to be masked in output.
fn var_secrets(params: &OutParams) -> Result<Vec<String>> {
    let mut secrets = Vec::new();
    for value in params.vars.values() {
        collect_scalars(value, &mut secrets);
    }
    for file in &params.vars_files {
        let text = fs::read_to_string(file).map_err(|err| {
            DeployResourceError::Config(format!(
                "cannot read vars file {}: {err}",
                file.display()
            ))
        })?;
        if text.trim().is_empty() {
            continue;
        }
        let doc: Value = serde_yaml_bw::from_str(&text).map_err(|err| {
            DeployResourceError::Config(format!(
                "cannot parse vars file {}: {err}",
                file.display()
            ))
        })?;
        collect_scalars(&doc, &mut secrets);
    }
    for path in params.var_files.values() {
        let text = fs::read_to_string(path).map_err(|err| {
            DeployResourceError::Config(format!("cannot read var file {}: {err}", path.display()))
        })?;
        secrets.push(text);
    }
    Ok(secrets)
}

fn collect_scalars(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.push(text.clone()),
        Value::Number(number) => out.push(number.to_string()),
        // Booleans are left alone: masking every "true" would garble all output.
        Value::Array(items) => items.iter().for_each(|item| collect_scalars(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_scalars(item, out)),
        _ => {}
    }
}

/// `--json` envelope printed by the bosh CLI.
#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default, rename = "Tables")]
    tables: Option<Vec<CliTable>>,
    #[serde(default, rename = "Blocks")]
    blocks: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CliTable {
    #[serde(default, rename = "Rows")]
    rows: Option<Vec<Map<String, Value>>>,
}

fn parse_output(step: &str, stdout: &str) -> Result<CliOutput> {
    serde_json::from_str(stdout).map_err(|err| DeployResourceError::UnexpectedOutput {
        step: step.to_string(),
        message: format!("not a JSON document: {err}"),
    })
}

fn rows(output: CliOutput) -> impl Iterator<Item = Map<String, Value>> {
    output
        .tables
        .unwrap_or_default()
        .into_iter()
        .flat_map(|table| table.rows.unwrap_or_default())
}

fn required_column(step: &str, row: &Map<String, Value>, column: &str) -> Result<String> {
    row.get(column)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DeployResourceError::UnexpectedOutput {
            step: step.to_string(),
            message: format!("row without a '{column}' column"),
        })
}

fn parse_manifest(stdout: &str) -> Result<String> {
    Ok(parse_output("manifest", stdout)?
        .blocks
        .unwrap_or_default()
        .concat())
}

fn parse_deployments(stdout: &str) -> Result<Vec<String>> {
    rows(parse_output("deployments", stdout)?)
        .map(|row| required_column("deployments", &row, "name"))
        .collect()
}

fn parse_lock_resources(stdout: &str) -> Result<Vec<String>> {
    rows(parse_output("locks", stdout)?)
        .map(|row| required_column("locks", &row, "resource"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::config::SourceConfig;
    use crate::runner::{FailureClass, Outcome};
    use crate::tunnel::{Tunnel, TunnelProvider};
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    struct DirectTunnels;

    #[async_trait]
    impl TunnelProvider for DirectTunnels {
        async fn open(&self, _source: &SourceConfig) -> Result<Tunnel> {
            Ok(Tunnel::direct())
        }
    }

    #[derive(Debug, Clone)]
    struct Call {
        argv: Vec<String>,
        secrets: Vec<String>,
        vars_file: Option<String>,
        root: PathBuf,
    }

    /// Records every command; fails the verb named in `fail_on`.
    struct RecordingRunner {
        calls: Mutex<Vec<Call>>,
        manifest: Option<String>,
        locks: String,
        fail_on: Option<&'static str>,
    }

    impl RecordingRunner {
        fn new(manifest: Option<&str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                manifest: manifest.map(str::to_string),
                locks: r#"{"Tables":[{"Rows":[]}]}"#.to_string(),
                fail_on: None,
            }
        }

        fn roots(&self) -> Vec<PathBuf> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|call| call.root.clone())
                .collect()
        }

        fn verbs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|call| call.argv[0].clone())
                .collect()
        }

        fn call(&self, verb: &str) -> Call {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|call| call.argv[0] == verb)
                .cloned()
                .expect("verb was run")
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, session: &Session, spec: &CommandSpec) -> Result<CommandResult> {
            let vars_file = spec
                .args
                .iter()
                .position(|arg| arg == "-l")
                .map(|idx| PathBuf::from(&spec.args[idx + 1]))
                .filter(|path| path.starts_with(session.root()))
                .map(|path| fs::read_to_string(path).expect("vars file readable"));
            self.calls.lock().unwrap().push(Call {
                argv: spec.argv(),
                secrets: spec.secrets.clone(),
                vars_file,
                root: session.root().to_path_buf(),
            });

            let mut result = CommandResult {
                verb: spec.verb.clone(),
                status: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                outcome: Outcome::Success,
                attempts: 1,
            };
            if self.fail_on == Some(spec.verb.as_str()) {
                result.status = Some(1);
                result.stderr = "Error: upload failed".into();
                result.outcome = Outcome::Fatal(FailureClass::Tool);
            } else if spec.verb == "locks" {
                result.stdout = self.locks.clone();
            } else if spec.verb == "manifest" {
                match &self.manifest {
                    Some(text) => {
                        result.stdout =
                            json!({"Tables": null, "Blocks": [text], "Lines": []}).to_string();
                    }
                    None => {
                        result.status = Some(1);
                        result.stderr = "Deployment 'my-deploy' doesn't exist".into();
                        result.outcome = Outcome::Fatal(FailureClass::NotFound);
                    }
                }
            }
            Ok(result)
        }
    }

    fn director(runner: Arc<RecordingRunner>) -> (BoshDirector, TempDir) {
        let dir = tempdir().unwrap();
        let cli = dir.path().join("bosh");
        fs::write(&cli, "#!/bin/sh\n").unwrap();
        let source: SourceConfig = serde_json::from_value(json!({
            "target": "10.0.0.6",
            "deployment": "my-deploy",
            "client": "admin",
            "client_secret": "s3cr3t",
        }))
        .unwrap();
        let coordinator = CliCoordinator::new(source, Arc::new(DirectTunnels))
            .with_cli_path(Some(cli))
            .with_temp_root(Some(dir.path().to_path_buf()));
        (BoshDirector::new(coordinator, runner), dir)
    }

    fn params(value: serde_json::Value) -> OutParams {
        serde_json::from_value(value).expect("params parse")
    }

    #[tokio::test]
    async fn deploy_uploads_then_deploys_with_flags() {
        let runner = Arc::new(RecordingRunner::new(Some("name: my-deploy\n")));
        let (director, _dir) = director(runner.clone());
        let params = params(json!({
            "manifest": "/src/manifest.yml",
            "releases": ["/src/r1.tgz", "/src/r2.tgz"],
            "stemcells": ["/src/stemcell.tgz"],
            "dry_run": false,
            "recreate": true,
            "skip_drain": ["router"],
            "max_in_flight": 3,
            "cleanup": true,
            "vars": {"db_password": "p4ssw0rd", "instances": 2},
            "var_files": {"cert": "/dev/null"},
            "ops_files": ["/src/ops.yml"],
        }));

        let version = director.deploy(&params).await.expect("deploy succeeds");
        assert_eq!(version, Version::from_manifest("10.0.0.6", "name: my-deploy\n"));
        assert_eq!(
            runner.verbs(),
            vec![
                "locks",
                "upload-release",
                "upload-release",
                "upload-stemcell",
                "deploy",
                "clean-up",
                "manifest"
            ]
        );

        let deploy = runner.call("deploy");
        assert_eq!(deploy.argv[1], "/src/manifest.yml");
        for flag in [
            "--recreate",
            "--skip-drain=router",
            "--max-in-flight=3",
            "--var-file",
            "cert=/dev/null",
            "-o",
            "/src/ops.yml",
        ] {
            assert!(deploy.argv.iter().any(|arg| arg == flag), "missing {flag}");
        }
        assert!(!deploy.argv.iter().any(|arg| arg.contains("p4ssw0rd")));
        assert!(deploy.secrets.contains(&"p4ssw0rd".to_string()));
        let vars = deploy.vars_file.expect("inline vars written to a file");
        assert!(vars.contains("db_password"));
        assert!(vars.contains("p4ssw0rd"));
    }

    #[tokio::test]
    async fn no_redact_skips_var_secrets() {
        let runner = Arc::new(RecordingRunner::new(Some("name: my-deploy\n")));
        let (director, _dir) = director(runner.clone());
        let params = params(json!({
            "manifest": "/src/manifest.yml",
            "no_redact": true,
            "vars": {"db_password": "p4ssw0rd"},
        }));
        director.deploy(&params).await.expect("deploy succeeds");
        let deploy = runner.call("deploy");
        assert!(deploy.secrets.is_empty());
        assert!(deploy.argv.iter().any(|arg| arg == "--no-redact"));
    }

    #[tokio::test]
    async fn dry_run_of_new_deployment_yields_empty_version() {
        let runner = Arc::new(RecordingRunner::new(None));
        let (director, _dir) = director(runner.clone());
        let params = params(json!({
            "manifest": "/src/manifest.yml",
            "dry_run": true,
            "cleanup": true,
        }));
        let version = director.deploy(&params).await.expect("dry run succeeds");
        assert_eq!(version, Version::from_manifest("10.0.0.6", ""));
        assert_eq!(runner.verbs(), vec!["locks", "deploy", "manifest"]);
        assert!(runner.call("deploy").argv.contains(&"--dry-run".to_string()));
    }

    #[tokio::test]
    async fn delete_replaces_deploy() {
        let runner = Arc::new(RecordingRunner::new(None));
        let (director, _dir) = director(runner.clone());
        let params = params(json!({"delete": {"enabled": true, "force": true}}));
        let version = director.deploy(&params).await.expect("delete succeeds");
        assert_eq!(version, Version::from_manifest("10.0.0.6", ""));
        assert_eq!(runner.verbs(), vec!["locks", "delete-deployment"]);
        assert_eq!(
            runner.call("delete-deployment").argv,
            vec!["delete-deployment", "--force"]
        );
    }

    #[tokio::test]
    async fn failed_upload_stops_before_deploy() {
        let mut runner = RecordingRunner::new(Some("name: x\n"));
        runner.fail_on = Some("upload-release");
        let runner = Arc::new(runner);
        let (director, dir) = director(runner.clone());
        let params = params(json!({
            "manifest": "/src/manifest.yml",
            "releases": ["/src/r1.tgz"],
        }));
        let err = director.deploy(&params).await.unwrap_err();
        assert!(matches!(err, DeployResourceError::ToolExecution { .. }));
        assert_eq!(runner.verbs(), vec!["locks", "upload-release"]);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("bosh-session-"))
            .collect();
        assert!(leftovers.is_empty(), "session directory left behind");
    }

    #[tokio::test]
    async fn unreadable_vars_file_is_a_configuration_error() {
        let runner = Arc::new(RecordingRunner::new(Some("name: x\n")));
        let (director, dir) = director(runner.clone());
        let params = params(json!({
            "manifest": "/src/manifest.yml",
            "vars_files": [dir.path().join("missing.yml")],
        }));
        let err = director.deploy(&params).await.unwrap_err();
        assert!(matches!(err, DeployResourceError::Config(_)), "got {err}");
        assert!(runner.verbs().is_empty());
    }

    #[tokio::test]
    async fn lock_check_shares_the_deploy_session() {
        let mut runner = RecordingRunner::new(Some("name: my-deploy\n"));
        runner.locks = r#"{"Tables":[{"Rows":[{"type":"deployment","resource":"my-deploy","task_id":"7"}]}]}"#.to_string();
        let runner = Arc::new(runner);
        let (director, _dir) = director(runner.clone());
        let params = params(json!({"manifest": "/src/manifest.yml"}));

        director.deploy(&params).await.expect("a held lock does not block");
        assert_eq!(runner.verbs(), vec!["locks", "deploy", "manifest"]);
        let roots = runner.roots();
        assert!(roots.iter().all(|root| *root == roots[0]), "{roots:?}");
    }

    #[tokio::test]
    async fn unreadable_lock_listing_does_not_block_deploy() {
        let mut runner = RecordingRunner::new(Some("name: my-deploy\n"));
        runner.locks = "Using environment '10.0.0.6'".to_string();
        let runner = Arc::new(runner);
        let (director, _dir) = director(runner.clone());
        let params = params(json!({"manifest": "/src/manifest.yml"}));

        let version = director.deploy(&params).await.expect("deploy succeeds");
        assert_eq!(version, Version::from_manifest("10.0.0.6", "name: my-deploy\n"));
        assert!(runner.verbs().contains(&"deploy".to_string()));
    }

    #[tokio::test]
    async fn has_locks_matches_only_this_deployment() {
        let mut runner = RecordingRunner::new(None);
        runner.locks = r#"{"Tables":[{"Rows":[{"resource":"other"},{"resource":"my-deploy"}]}]}"#.to_string();
        let (locked, _dir) = director(Arc::new(runner));
        assert!(locked.has_locks().await.unwrap());

        let mut runner = RecordingRunner::new(None);
        runner.locks = r#"{"Tables":[{"Rows":[{"resource":"other"}]}]}"#.to_string();
        let (free, _other_dir) = director(Arc::new(runner));
        assert!(!free.has_locks().await.unwrap());
    }

    #[tokio::test]
    async fn current_manifest_propagates_not_found() {
        let runner = Arc::new(RecordingRunner::new(None));
        let (director, _dir) = director(runner);
        let err = director.current_manifest().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn collects_nested_scalar_vars() {
        let mut out = Vec::new();
        collect_scalars(
            &json!({"a": "one", "b": {"c": ["two", 3, true]}, "d": null, "e": 2.5}),
            &mut out,
        );
        out.sort();
        assert_eq!(out, vec!["2.5", "3", "one", "two"]);
    }

    #[test]
    fn numeric_vars_are_masked() {
        let params = params(json!({
            "manifest": "/src/manifest.yml",
            "vars": {"admin_pin": 918273, "api_token": "tok-abc", "enabled": true},
        }));
        let secrets = var_secrets(&params).unwrap();
        let redactor = crate::redact::Redactor::new(&secrets).unwrap();
        let out = redactor.redact("pin=918273 token=tok-abc enabled=true");
        assert!(!out.contains("918273"), "{out}");
        assert!(!out.contains("tok-abc"), "{out}");
        assert!(out.contains("enabled=true"));
    }

    #[test]
    fn numeric_vars_in_vars_files_are_masked() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vars.yml");
        fs::write(&file, "port: 31337\nnested:\n  pin: 4242\n").unwrap();
        let params = params(json!({
            "manifest": "/src/manifest.yml",
            "vars_files": [file],
        }));
        let mut secrets = var_secrets(&params).unwrap();
        secrets.sort();
        assert_eq!(secrets, vec!["31337", "4242"]);
    }

    #[test]
    fn parses_manifest_blocks() {
        let stdout = r#"{"Tables":null,"Blocks":["name: a\n","releases: []\n"],"Lines":["Succeeded"]}"#;
        assert_eq!(parse_manifest(stdout).unwrap(), "name: a\nreleases: []\n");
        assert_eq!(
            parse_manifest(r#"{"Tables":null,"Blocks":null,"Lines":[]}"#).unwrap(),
            ""
        );
    }

    #[test]
    fn rejects_non_json_output() {
        let err = parse_manifest("Using environment '10.0.0.6'").unwrap_err();
        assert!(matches!(err, DeployResourceError::UnexpectedOutput { .. }));
    }

    #[test]
    fn parses_deployment_names_tolerating_extra_columns() {
        let stdout = r#"{"Tables":[{"Content":"deployments","Header":{"name":"Name"},"Rows":[{"name":"cf","release_s":"x","team_s":""},{"name":"redis","stemcell_s":"y"}]}],"Blocks":null,"Lines":[]}"#;
        assert_eq!(parse_deployments(stdout).unwrap(), vec!["cf", "redis"]);
    }

    #[test]
    fn deployment_row_without_name_is_rejected() {
        let stdout = r#"{"Tables":[{"Rows":[{"team_s":""}]}]}"#;
        let err = parse_deployments(stdout).unwrap_err();
        assert!(format!("{err}").contains("'name'"));
    }

    #[test]
    fn parses_lock_resources() {
        let stdout = r#"{"Tables":[{"Content":"locks","Rows":[{"type":"deployment","resource":"my-deploy","task_id":"12","expires_at":"soon"}]}]}"#;
        assert_eq!(parse_lock_resources(stdout).unwrap(), vec!["my-deploy"]);
        assert!(parse_lock_resources(r#"{"Tables":[{"Rows":[]}]}"#).unwrap().is_empty());
    }
}
