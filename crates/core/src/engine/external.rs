//! External-process engine adapter: the Java validator.
//!
//! One invocation looks like:
//!
//! ```text
//! <java> -jar <validator.jar> -version <3.0|4.0> -tx <url|n/a> [-ig <dir>] -output <out.json> <input>
//! ```
//!
//! The resource is written to a temporary directory together with the output path; both are
//! removed when the invocation finishes. Degraded cases, in priority order:
//! 1. the runtime cannot be launched: one issue explaining how to get Java
//! 2. non-zero exit or no output file: one issue per non-empty line of captured output
//! 3. unparseable output file: one issue carrying the parse error
//!
//! While the process runs it is registered with the [`SubprocessRegistry`] so cancellation can
//! kill it.

use super::{EngineKind, EngineOutcome, EngineReport, ValidationEngine, ValidationRequest};
use crate::constants::JAVA_NOT_FOUND_MESSAGE;
use crate::subprocess::SubprocessRegistry;
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use fhir::{OperationOutcome, OutcomeIssue};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

pub struct ExternalEngine {
    java_runtime: PathBuf,
    validator_jar: PathBuf,
    registry: Arc<SubprocessRegistry>,
}

impl ExternalEngine {
    pub fn new(
        java_runtime: PathBuf,
        validator_jar: PathBuf,
        registry: Arc<SubprocessRegistry>,
    ) -> Self {
        Self {
            java_runtime,
            validator_jar,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SubprocessRegistry> {
        &self.registry
    }

    /// Run the validator once. `Ok(None)` means the process was killed on request.
    async fn invoke(
        &self,
        request: &ValidationRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<EngineReport>> {
        let workspace = tempfile::Builder::new()
            .prefix("hammer-")
            .tempdir()
            .map_err(CoreError::TempFile)?;
        let input = workspace
            .path()
            .join(format!("resource.{}", request.format.file_extension()));
        let output = workspace.path().join("outcome.json");
        tokio::fs::write(&input, request.text.as_bytes())
            .await
            .map_err(CoreError::TempFile)?;

        let arguments = validator_arguments(&self.validator_jar, request, &input, &output);
        tracing::info!(
            "beginning Java validation: {} {}",
            self.java_runtime.display(),
            arguments
                .iter()
                .map(|argument| argument.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = match Command::new(&self.java_runtime)
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(
                    "Java runtime {} not found: {}",
                    self.java_runtime.display(),
                    err
                );
                return Ok(Some(EngineReport::failure(JAVA_NOT_FOUND_MESSAGE)));
            }
            Err(err) => return Err(CoreError::Launch(err)),
        };

        let ticket = self.registry.register(child.id());
        tracing::debug!("Java validator running as pid {:?}", ticket.pid());
        let mut stdout = tokio::spawn(read_stream(child.stdout.take()));
        let mut stderr = tokio::spawn(read_stream(child.stderr.take()));

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = ticket.kill_requested() => None,
            _ = cancel.cancelled() => None,
        };

        let status = match exit {
            Some(status) => status.map_err(CoreError::Launch)?,
            None => {
                terminate(&mut child).await;
                stdout.abort();
                stderr.abort();
                return Ok(None);
            }
        };
        drop(ticket);

        // A grandchild may still hold the pipes open after the validator exits
        let (out, err) = tokio::select! {
            streams = async { ((&mut stdout).await, (&mut stderr).await) } => streams,
            _ = cancel.cancelled() => {
                stdout.abort();
                stderr.abort();
                return Ok(None);
            }
        };
        let mut captured = out.unwrap_or_default();
        captured.push_str(&err.unwrap_or_default());

        if !status.success() || !output.exists() {
            tracing::warn!("Java validator produced no outcome ({})", status);
            return Ok(Some(EngineReport::crashed(raw_output_outcome(
                &captured, status,
            ))));
        }

        let text = tokio::fs::read_to_string(&output)
            .await
            .map_err(CoreError::OutputRead)?;
        match OperationOutcome::parse(&text) {
            Ok(outcome) => {
                let counts = outcome.counts();
                tracing::info!(
                    "Java validator reported {} fatal, {} error(s), {} warning(s), {} information",
                    counts.fatal,
                    counts.error,
                    counts.warning,
                    counts.information
                );
                Ok(Some(EngineReport::new(outcome)))
            }
            Err(err) => {
                tracing::error!("failed to parse Java validator output: {}", err);
                Ok(Some(EngineReport::failure(err.to_string())))
            }
        }
    }
}

#[async_trait]
impl ValidationEngine for ExternalEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::External
    }

    async fn validate(
        &self,
        request: Arc<ValidationRequest>,
        cancel: CancellationToken,
    ) -> EngineOutcome {
        let started = Instant::now();
        let result = self.invoke(&request, &cancel).await;

        if cancel.is_cancelled() {
            tracing::debug!("discarding Java result of a canceled run");
            return EngineOutcome::Canceled;
        }
        tracing::info!(
            "Java validation performed in {}ms",
            started.elapsed().as_millis()
        );

        match result {
            Ok(Some(report)) => EngineOutcome::Completed(report),
            Ok(None) => EngineOutcome::Canceled,
            Err(err) => {
                tracing::error!("Java validation failed: {}", err);
                EngineOutcome::Completed(EngineReport::from_error(&err))
            }
        }
    }
}

/// Command-line arguments for one validator invocation (everything after the runtime).
pub fn validator_arguments(
    validator_jar: &Path,
    request: &ValidationRequest,
    input: &Path,
    output: &Path,
) -> Vec<OsString> {
    let mut arguments: Vec<OsString> = vec![
        "-jar".into(),
        validator_jar.into(),
        "-version".into(),
        request.fhir_version.validator_argument().into(),
        "-tx".into(),
        request.terminology.validator_argument().into(),
    ];
    if let Some(scope) = &request.scope_directory {
        arguments.push("-ig".into());
        arguments.push(scope.into());
    }
    arguments.push("-output".into());
    arguments.push(output.into());
    arguments.push(input.into());
    arguments
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut bytes = Vec::new();
    if let Err(err) = stream.read_to_end(&mut bytes).await {
        tracing::debug!("failed to read validator output stream: {}", err);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Kill and reap a child; failures (already exited) are ignored.
async fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        tracing::debug!("validator process already gone: {}", err);
    }
    if let Err(err) = child.wait().await {
        tracing::debug!("failed to reap validator process: {}", err);
    }
}

/// Captured output as issues; a silent failure still yields one issue.
fn raw_output_outcome(captured: &str, status: ExitStatus) -> OperationOutcome {
    let outcome = OperationOutcome::from_output_lines(captured);
    if outcome.issue.is_empty() {
        return OperationOutcome::single(OutcomeIssue::new(
            "error",
            "processing",
            format!("Java validator exited ({status}) without producing any output"),
        ));
    }
    outcome
}
