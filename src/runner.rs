use std::io::{self, Write};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::coordinator::Session;
use crate::error::{DeployResourceError, Result};
use crate::redact::{RedactingWriter, Redactor, SharedSink, Tee};

const CONNECTIVITY_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake timeout",
    "no route to host",
    "network is unreachable",
    "unexpected eof",
];

const CONTENTION_MARKERS: &[&str] = &[
    "failed to acquire lock",
    "is locked",
    "another operation is in progress",
    "task is running",
    "already running",
];

const NOT_FOUND_MARKERS: &[&str] = &["doesn't exist", "does not exist"];

/// Whether stdout is parsed by the caller or only shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Capture,
    Stream,
}

/// One logical bosh operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub verb: String,
    pub args: Vec<String>,
    pub output: OutputMode,
    pub secrets: Vec<String>,
}

impl CommandSpec {
    pub fn capture(verb: impl Into<String>) -> Self {
        Self::new(verb, OutputMode::Capture)
    }

    pub fn stream(verb: impl Into<String>) -> Self {
        Self::new(verb, OutputMode::Stream)
    }

    fn new(verb: impl Into<String>, output: OutputMode) -> Self {
        Self {
            verb: verb.into(),
            args: Vec::new(),
            output,
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Extra values to mask in this command's output on top of the session credentials.
    pub fn secrets<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secrets.extend(secrets.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.verb.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Connectivity,
    Contention,
    NotFound,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Recoverable(FailureClass),
    Fatal(FailureClass),
}

/// Redacted output and classified outcome of a command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub verb: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub outcome: Outcome,
    pub attempts: u32,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Converts a failed outcome into the matching error; successful results pass through.
    pub fn into_result(self) -> Result<Self> {
        match self.outcome {
            Outcome::Success => Ok(self),
            Outcome::Recoverable(class) | Outcome::Fatal(class) => Err(self.error(class)),
        }
    }

    fn error(&self, class: FailureClass) -> DeployResourceError {
        let mut output = self.failure_output();
        if self.attempts > 1 {
            output.push_str(&format!(" (gave up after {} attempts)", self.attempts));
        }
        match class {
            FailureClass::Connectivity => DeployResourceError::Connectivity {
                target: format!("director (bosh {})", self.verb),
                message: output,
            },
            FailureClass::Contention => DeployResourceError::Contention {
                step: self.verb.clone(),
                message: output,
            },
            FailureClass::NotFound => DeployResourceError::NotFound(output),
            FailureClass::Tool => DeployResourceError::ToolExecution {
                step: self.verb.clone(),
                status: self.status,
                output,
            },
        }
    }

    fn failure_output(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Maps an exit status and the (already redacted) output to an outcome.
///
/// Lock contention counts wherever it appears, since the director reports it
/// inside task logs. Connectivity and not-found are read from the CLI's final
/// error block only, and a failed director task is never a connectivity
/// failure: its log may mention refused connections between VMs.
pub fn classify(success: bool, stdout: &str, stderr: &str) -> Outcome {
    if success {
        return Outcome::Success;
    }
    let everything = format!("{stdout}\n{stderr}").to_ascii_lowercase();
    let block = format!("{}\n{}", final_block(stderr), final_block(stdout)).to_ascii_lowercase();
    let in_block = |markers: &[&str]| markers.iter().any(|marker| block.contains(marker));
    let task_failed = everything.contains("expected task") && everything.contains("state is 'error'");

    if CONTENTION_MARKERS
        .iter()
        .any(|marker| everything.contains(marker))
    {
        Outcome::Recoverable(FailureClass::Contention)
    } else if !task_failed && in_block(CONNECTIVITY_MARKERS) {
        Outcome::Recoverable(FailureClass::Connectivity)
    } else if in_block(NOT_FOUND_MARKERS) {
        Outcome::Fatal(FailureClass::NotFound)
    } else {
        Outcome::Fatal(FailureClass::Tool)
    }
}

/// Last blank-line separated paragraph, ignoring the trailing `Exit code N` line.
fn final_block(text: &str) -> &str {
    let mut body = text.trim_end();
    if let Some((head, last)) = body.rsplit_once('\n') {
        if last.trim_start().starts_with("Exit code") {
            body = head.trim_end();
        }
    } else if body.trim_start().starts_with("Exit code") {
        body = "";
    }
    match body.rfind("\n\n") {
        Some(idx) => &body[idx + 2..],
        None => body,
    }
}

/// Bounded exponential backoff for recoverable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Runner responsible for executing bosh commands within a session.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// `Err` means the command could not be run at all; tool failures are reported in the result.
    async fn run(&self, session: &Session, spec: &CommandSpec) -> Result<CommandResult>;
}

pub struct ProcessCommandRunner {
    sink: SharedSink,
    retry: RetryPolicy,
}

impl ProcessCommandRunner {
    pub fn new(sink: SharedSink, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    async fn run_once(
        &self,
        session: &Session,
        spec: &CommandSpec,
        redactor: &Redactor,
        attempt: u32,
    ) -> Result<CommandResult> {
        let argv = spec.argv();
        debug!(
            argv = %redactor.redact(&argv.join(" ")),
            attempt,
            "running bosh"
        );

        let mut command = Command::new(session.cli());
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Only the session decides which BOSH_* settings the child sees.
        for (key, _) in std::env::vars_os() {
            if key.to_string_lossy().starts_with("BOSH_") {
                command.env_remove(&key);
            }
        }
        command.envs(session.env());

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                DeployResourceError::CliMissing {
                    searched: session.cli().display().to_string(),
                }
            } else {
                DeployResourceError::Io(err)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeployResourceError::Other("child stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeployResourceError::Other("child stderr was not captured".into()))?;

        let stdout_sink = match spec.output {
            OutputMode::Capture => None,
            OutputMode::Stream => Some(self.sink.clone()),
        };
        let stdout_writer = RedactingWriter::new(redactor.clone(), Tee::new(stdout_sink));
        let stderr_writer = RedactingWriter::new(redactor.clone(), Tee::new(Some(self.sink.clone())));

        let (stdout, stderr, status) = tokio::join!(
            pump(stdout, stdout_writer),
            pump(stderr, stderr_writer),
            child.wait()
        );
        let status = status?;
        let stdout = String::from_utf8_lossy(&stdout?).into_owned();
        let stderr = String::from_utf8_lossy(&stderr?).into_owned();

        let outcome = classify(status.success(), &stdout, &stderr);
        debug!(step = %spec.verb, status = ?status.code(), ?outcome, "bosh finished");

        Ok(CommandResult {
            verb: spec.verb.clone(),
            status: status.code(),
            stdout,
            stderr,
            outcome,
            attempts: attempt,
        })
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, session: &Session, spec: &CommandSpec) -> Result<CommandResult> {
        let redactor = session.redactor().with(&spec.secrets)?;
        let mut attempt = 1;
        loop {
            let mut result = self.run_once(session, spec, &redactor, attempt).await?;
            match result.outcome {
                Outcome::Recoverable(class) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        step = %spec.verb,
                        attempt,
                        ?class,
                        delay_ms = delay.as_millis() as u64,
                        "transient bosh failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Outcome::Recoverable(class) => {
                    warn!(step = %spec.verb, attempts = attempt, ?class, "retry budget exhausted");
                    result.outcome = Outcome::Fatal(class);
                    return Ok(result);
                }
                _ => return Ok(result),
            }
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    mut writer: RedactingWriter<Tee>,
) -> io::Result<Vec<u8>> {
    let mut buf = [0u8; 8192];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read])?;
    }
    Ok(writer.finish()?.into_buffer())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: Outcome, stdout: &str, stderr: &str) -> CommandResult {
        CommandResult {
            verb: "deploy".into(),
            status: Some(1),
            stdout: stdout.into(),
            stderr: stderr.into(),
            outcome,
            attempts: 1,
        }
    }

    #[test]
    fn argv_starts_with_verb() {
        let spec = CommandSpec::stream("deploy")
            .arg("/tmp/manifest.yml")
            .args(["--dry-run", "--recreate"])
            .secrets(["hidden"]);
        assert_eq!(
            spec.argv(),
            vec!["deploy", "/tmp/manifest.yml", "--dry-run", "--recreate"]
        );
        assert_eq!(spec.output, OutputMode::Stream);
        assert_eq!(spec.secrets, vec!["hidden".to_string()]);
    }

    #[test]
    fn classifies_transient_and_fatal_failures() {
        assert_eq!(classify(true, "connection refused", ""), Outcome::Success);
        assert_eq!(
            classify(false, "", "dial tcp 10.0.0.6:25555: connect: Connection Refused"),
            Outcome::Recoverable(FailureClass::Connectivity)
        );
        assert_eq!(
            classify(false, "", "Failed to acquire lock for lock:deployment:cf"),
            Outcome::Recoverable(FailureClass::Contention)
        );
        assert_eq!(
            classify(false, "", "Deployment 'cf' doesn't exist"),
            Outcome::Fatal(FailureClass::NotFound)
        );
        assert_eq!(
            classify(false, "", "Error: Unmarshalling manifest"),
            Outcome::Fatal(FailureClass::Tool)
        );
        assert_eq!(
            classify(false, "", "Director responded with 401 Unauthorized"),
            Outcome::Fatal(FailureClass::Tool)
        );
    }

    #[test]
    fn failed_task_is_fatal_despite_refused_connections_in_its_log() {
        let stdout = "\
Using deployment 'redis'

Task 42

Task 42 | 10:01:02 | Updating instance redis/0 (canary)
Task 42 | 10:03:10 | Error: Action Failed get_task: Task 8c1 result: 1 of 1 post-start scripts failed. \
Failed Jobs: redis. Connection refused (127.0.0.1:6379)

Task 42 Started  Thu Oct 15 10:01:00 UTC 2026
Task 42 Finished Thu Oct 15 10:03:10 UTC 2026
Task 42 Duration 00:02:10
Task 42 error
";
        let stderr = "\
Updating deployment:
  Expected task '42' to succeed but state is 'error'

Exit code 1
";
        assert_eq!(classify(false, stdout, stderr), Outcome::Fatal(FailureClass::Tool));
        assert_eq!(
            classify(false, &format!("{stdout}\n{stderr}"), ""),
            Outcome::Fatal(FailureClass::Tool)
        );
    }

    #[test]
    fn unreachable_director_is_transient() {
        let stderr = "\
Fetching info:
  Performing request GET 'https://10.0.0.6:25555/info':
    Performing GET request:
      Retry: Get \"https://10.0.0.6:25555/info\": dial tcp 10.0.0.6:25555: connect: connection refused

Exit code 1
";
        assert_eq!(
            classify(false, "Using environment '10.0.0.6' as client 'admin'\n", stderr),
            Outcome::Recoverable(FailureClass::Connectivity)
        );
    }

    #[test]
    fn connectivity_outside_the_final_error_is_ignored() {
        let stdout = "\
Task 7 | 10:00:01 | Warning: connection reset by peer while streaming logs, retrying

Task 7 done
";
        let stderr = "Error: Unmarshalling manifest\n\nExit code 1\n";
        assert_eq!(classify(false, stdout, stderr), Outcome::Fatal(FailureClass::Tool));
    }

    #[test]
    fn lock_reported_inside_a_task_log_is_contention() {
        let stdout = "Task 9 | 10:00:00 | Error: Failed to acquire lock for lock:deployment:cf uid: 1\n";
        let stderr = "Updating deployment:\n  Expected task '9' to succeed but state is 'error'\n\nExit code 1\n";
        assert_eq!(
            classify(false, stdout, stderr),
            Outcome::Recoverable(FailureClass::Contention)
        );
    }

    #[test]
    fn final_block_skips_task_log_and_exit_code() {
        assert_eq!(final_block("log\n\nFetching info:\n  refused\n\nExit code 1\n"), "Fetching info:\n  refused");
        assert_eq!(final_block("Exit code 1"), "");
        assert_eq!(final_block("single line"), "single line");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
        assert_eq!(policy.backoff(4), Duration::from_secs(60));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn failures_map_to_error_taxonomy() {
        let err = result(Outcome::Fatal(FailureClass::Tool), "", "bad manifest\n")
            .into_result()
            .unwrap_err();
        match err {
            DeployResourceError::ToolExecution {
                step,
                status,
                output,
            } => {
                assert_eq!(step, "deploy");
                assert_eq!(status, Some(1));
                assert_eq!(output, "bad manifest");
            }
            other => panic!("unexpected error {other}"),
        }

        let err = result(Outcome::Fatal(FailureClass::NotFound), "gone", "")
            .into_result()
            .unwrap_err();
        assert!(err.is_not_found());

        let err = result(Outcome::Fatal(FailureClass::Contention), "", "locked")
            .into_result()
            .unwrap_err();
        assert!(matches!(err, DeployResourceError::Contention { .. }));

        let ok = result(Outcome::Success, "fine", "")
            .into_result()
            .expect("success passes through");
        assert!(ok.is_success());
    }

    #[test]
    fn exhausted_retries_report_the_attempt_count() {
        let mut retried = result(Outcome::Fatal(FailureClass::Contention), "", "lock held");
        retried.attempts = 3;
        match retried.into_result().unwrap_err() {
            DeployResourceError::Contention { step, message } => {
                assert_eq!(step, "deploy");
                assert_eq!(message, "lock held (gave up after 3 attempts)");
            }
            other => panic!("unexpected error {other}"),
        }

        let once = result(Outcome::Fatal(FailureClass::Connectivity), "", "refused")
            .into_result()
            .unwrap_err();
        assert!(!once.to_string().contains("attempts"), "{once}");
    }
}
