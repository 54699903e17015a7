//! # Validation orchestrator
//!
//! Coordinates one dual-engine validation run at a time.
//!
//! ```text
//! start_validation()
//!   ├── cancel previous run, kill its validator processes
//!   ├── reset both engines to Busy, emit RunStarted
//!   └── spawn coordinator ──┬── managed engine  ─┐
//!                           └── external engine ─┴─ JoinSet: whichever finishes first
//!                                                    ├── normalise + resolve positions
//!                                                    └── commit (only if still the active run)
//! ```
//!
//! Per-engine state machine: `Idle → Busy → Completed | Canceled | Faulted`. Results of a
//! superseded run are never committed: every commit re-checks the active run id under the
//! session lock, and each engine's state is replaced as a unit.
//!
//! State is published as immutable [`ValidationSnapshot`] values through a `watch` channel;
//! the narrow [`ValidationEvent`] stream marks the transition points.

use crate::config::CoreConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::engine::{
    EngineKind, EngineOutcome, ExternalEngine, ManagedEngine, ValidationEngine, ValidationRequest,
};
use crate::issue::{error_count, warning_count, Issue, Severity};
use crate::normalize::normalize_outcome;
use crate::profile::ProfileSources;
use crate::subprocess::SubprocessRegistry;
use crate::terminology::{retarget_endpoint, TerminologySetting};
use crate::{CoreError, CoreResult};
use fhir::{ElementNode, FhirVersion, ResourceFormat};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Identifier of one validation run, increasing per orchestrator.
pub type RunId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnginePhase {
    #[default]
    Idle,
    Busy,
    Completed,
    Canceled,
    Faulted,
}

/// One engine's published state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub phase: EnginePhase,
    pub busy: bool,
    pub issues: Vec<Issue>,
    /// Fatal plus error issues.
    pub error_count: usize,
    pub warning_count: usize,
    /// The external engine fell back to raw process output.
    pub crashed: bool,
}

impl EngineSnapshot {
    fn busy() -> Self {
        Self {
            phase: EnginePhase::Busy,
            busy: true,
            ..Self::default()
        }
    }

    fn with_issues(phase: EnginePhase, issues: Vec<Issue>, crashed: bool) -> Self {
        Self {
            phase,
            busy: false,
            error_count: error_count(&issues),
            warning_count: warning_count(&issues),
            issues,
            crashed,
        }
    }

    fn mark_canceled(&mut self) {
        self.phase = EnginePhase::Canceled;
        self.busy = false;
    }
}

/// Published orchestrator state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationSnapshot {
    /// The run in flight, if any.
    pub run: Option<RunId>,
    pub managed: EngineSnapshot,
    pub external: EngineSnapshot,
}

impl ValidationSnapshot {
    pub fn engine(&self, kind: EngineKind) -> &EngineSnapshot {
        match kind {
            EngineKind::Managed => &self.managed,
            EngineKind::External => &self.external,
        }
    }

    fn engine_mut(&mut self, kind: EngineKind) -> &mut EngineSnapshot {
        match kind {
            EngineKind::Managed => &mut self.managed,
            EngineKind::External => &mut self.external,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.run.is_some() || self.managed.busy || self.external.busy
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationEvent {
    RunStarted { run: RunId },
    EngineFinished {
        run: RunId,
        engine: EngineKind,
        phase: EnginePhase,
    },
    RunFinished { run: RunId },
    RunCanceled { run: RunId },
}

/// User-adjustable validation settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationSettings {
    pub fhir_version: FhirVersion,
    pub scope_directory: Option<PathBuf>,
    /// Terminology endpoint URL or a disable sentinel, as configured.
    pub terminology_service: String,
}

struct LoadedDocument {
    text: Arc<str>,
    format: ResourceFormat,
}

struct ActiveRun {
    id: RunId,
    cancel: CancellationToken,
}

struct Session {
    document: Option<LoadedDocument>,
    settings: ValidationSettings,
    active: Option<ActiveRun>,
    next_run: RunId,
}

struct Shared {
    managed: Arc<dyn ValidationEngine>,
    external: Arc<dyn ValidationEngine>,
    registry: Arc<SubprocessRegistry>,
    profiles: ProfileSources,
    session: Mutex<Session>,
    state: watch::Sender<ValidationSnapshot>,
    events: broadcast::Sender<ValidationEvent>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ValidationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// The dual-engine validation orchestrator. Construct once and pass it to the UI/CLI layer.
///
/// Dropping the orchestrator cancels any active run.
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Create an orchestrator with the bundled managed engine and the Java validator.
    pub fn new(config: &CoreConfig) -> Self {
        let registry = SubprocessRegistry::new();
        let managed: Arc<dyn ValidationEngine> = Arc::new(ManagedEngine::bundled());
        let external: Arc<dyn ValidationEngine> = Arc::new(ExternalEngine::new(
            config.java_runtime().to_path_buf(),
            config.validator_jar().to_path_buf(),
            Arc::clone(&registry),
        ));
        Self::with_engines(config, managed, external, registry)
    }

    /// Create an orchestrator over explicit engines.
    ///
    /// `registry` must be the registry the external engine registers its processes with, so
    /// cancellation can reach them.
    pub fn with_engines(
        config: &CoreConfig,
        managed: Arc<dyn ValidationEngine>,
        external: Arc<dyn ValidationEngine>,
        registry: Arc<SubprocessRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(ValidationSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let settings = ValidationSettings {
            fhir_version: config.fhir_version(),
            scope_directory: None,
            terminology_service: config.terminology_service().to_string(),
        };

        Self {
            shared: Arc::new(Shared {
                managed,
                external,
                registry,
                profiles: ProfileSources::new(config),
                session: Mutex::new(Session {
                    document: None,
                    settings,
                    active: None,
                    next_run: 1,
                }),
                state,
                events,
            }),
        }
    }

    /// Load resource text for the next run and return its detected format.
    pub fn load_resource_text(&self, text: impl Into<String>) -> ResourceFormat {
        let text: String = text.into();
        let format = ResourceFormat::detect(&text);
        self.shared.session().document = Some(LoadedDocument {
            text: Arc::from(text),
            format,
        });
        tracing::debug!("loaded {} resource", format);
        format
    }

    /// Set or clear the scope directory layered over the core definitions.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the path is not an existing directory.
    pub fn set_scope_directory(&self, scope_directory: Option<PathBuf>) -> CoreResult<()> {
        if let Some(dir) = &scope_directory {
            if !dir.is_dir() {
                return Err(CoreError::InvalidInput(format!(
                    "scope directory is not a directory: {}",
                    dir.display()
                )));
            }
        }

        let mut session = self.shared.session();
        self.shared
            .profiles
            .rebuild(session.settings.fhir_version, scope_directory.as_deref());
        session.settings.scope_directory = scope_directory;
        Ok(())
    }

    /// Change the target FHIR version.
    ///
    /// A terminology endpoint ending in a release suffix is retargeted to the new release,
    /// and the combined profile source is rebuilt.
    pub fn set_fhir_version(&self, version: FhirVersion) {
        let mut session = self.shared.session();
        if session.settings.fhir_version == version {
            return;
        }
        session.settings.fhir_version = version;
        session.settings.terminology_service =
            retarget_endpoint(&session.settings.terminology_service, version);
        self.shared
            .profiles
            .rebuild(version, session.settings.scope_directory.as_deref());
        tracing::info!(
            "target FHIR version set to {} (terminology: {})",
            version,
            session.settings.terminology_service
        );
    }

    pub fn set_terminology_service(&self, endpoint: impl Into<String>) {
        let endpoint: String = endpoint.into();
        self.shared.session().settings.terminology_service = endpoint.trim().to_string();
    }

    pub fn settings(&self) -> ValidationSettings {
        self.shared.session().settings.clone()
    }

    pub fn snapshot(&self) -> ValidationSnapshot {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ValidationSnapshot> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ValidationEvent> {
        self.shared.events.subscribe()
    }

    /// Start validating the loaded resource with both engines.
    ///
    /// Any previous run is canceled first and its validator processes are killed. Returns as
    /// soon as the engines are scheduled; observe completion through [`Self::subscribe_state`],
    /// [`Self::subscribe_events`] or [`Self::wait_until_idle`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoRuntime`] outside a tokio runtime, or
    /// [`CoreError::NoDocumentLoaded`] if no resource text has been loaded.
    pub fn start_validation(&self) -> CoreResult<RunId> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CoreError::NoRuntime)?;
        let shared = &self.shared;
        let mut session = shared.session();

        let (text, format) = match &session.document {
            Some(document) => (Arc::clone(&document.text), document.format),
            None => return Err(CoreError::NoDocumentLoaded),
        };

        let superseded = session.active.take();
        if let Some(previous) = &superseded {
            previous.cancel.cancel();
        }
        let killed = shared.registry.kill_all();
        if killed > 0 {
            tracing::info!("killed {} validator process(es) of the previous run", killed);
        }

        let run = session.next_run;
        session.next_run += 1;
        let cancel = CancellationToken::new();
        session.active = Some(ActiveRun {
            id: run,
            cancel: cancel.clone(),
        });

        let request = Arc::new(ValidationRequest {
            text,
            format,
            fhir_version: session.settings.fhir_version,
            profiles: shared.profiles.snapshot(),
            scope_directory: session.settings.scope_directory.clone(),
            terminology: TerminologySetting::parse(&session.settings.terminology_service),
        });

        shared.state.send_modify(|state| {
            state.run = Some(run);
            state.managed = EngineSnapshot::busy();
            state.external = EngineSnapshot::busy();
        });
        drop(session);

        if let Some(previous) = superseded {
            tracing::info!("validation run {} superseded by run {}", previous.id, run);
            shared.emit(ValidationEvent::RunCanceled { run: previous.id });
        }
        shared.emit(ValidationEvent::RunStarted { run });

        runtime.spawn(coordinate(Arc::clone(shared), run, request, cancel));
        Ok(run)
    }

    /// Cancel the active run, kill its validator processes and clear both busy flags.
    ///
    /// Returns whether a run was active.
    pub fn cancel_validation(&self) -> bool {
        let shared = &self.shared;
        let mut session = shared.session();
        let active = session.active.take();
        if let Some(active) = &active {
            active.cancel.cancel();
        }
        let killed = shared.registry.kill_all();

        shared.state.send_if_modified(|state| {
            let was_busy = state.is_busy();
            state.run = None;
            for kind in EngineKind::ALL {
                let engine = state.engine_mut(kind);
                if engine.busy {
                    engine.mark_canceled();
                }
            }
            was_busy
        });
        drop(session);

        match active {
            Some(active) => {
                tracing::info!(
                    "validation run {} canceled ({} process(es) killed)",
                    active.id,
                    killed
                );
                shared.emit(ValidationEvent::RunCanceled { run: active.id });
                true
            }
            None => false,
        }
    }

    /// Wait until no run is in flight and return the state at that point.
    pub async fn wait_until_idle(&self) -> ValidationSnapshot {
        let mut receiver = self.shared.state.subscribe();
        let idle = receiver
            .wait_for(|state| !state.is_busy())
            .await
            .map(|state| state.clone());
        match idle {
            Ok(state) => state,
            Err(_) => self.snapshot(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel_validation();
    }
}

/// Run both engines for `run` and commit each result as it arrives.
async fn coordinate(
    shared: Arc<Shared>,
    run: RunId,
    request: Arc<ValidationRequest>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    tracing::info!(
        "validation run {} started ({} resource, FHIR {})",
        run,
        request.format,
        request.fhir_version
    );

    let mut engines = JoinSet::new();
    for (kind, engine) in [
        (EngineKind::Managed, Arc::clone(&shared.managed)),
        (EngineKind::External, Arc::clone(&shared.external)),
    ] {
        let request = Arc::clone(&request);
        let cancel = cancel.clone();
        engines.spawn(async move {
            // Inner task so a panicking engine is still attributed to its slot
            let outcome = tokio::spawn(async move { engine.validate(request, cancel).await })
                .await
                .unwrap_or_else(|err| EngineOutcome::Faulted(err.to_string()));
            (kind, outcome)
        });
    }

    let document = {
        let request = Arc::clone(&request);
        tokio::task::spawn_blocking(move || parse_for_positions(&request))
            .await
            .ok()
            .flatten()
    };

    while let Some(joined) = engines.join_next().await {
        match joined {
            Ok((kind, outcome)) => commit(&shared, run, kind, outcome, document.as_ref()),
            Err(err) => tracing::error!("engine coordinator task failed: {}", err),
        }
    }

    finish(&shared, run, started);
}

fn parse_for_positions(request: &ValidationRequest) -> Option<ElementNode> {
    match fhir::parse_resource(&request.text, request.format) {
        Ok(document) => Some(document),
        Err(err) => {
            tracing::debug!("positions unavailable, resource did not parse: {}", err);
            None
        }
    }
}

/// Record one engine's outcome if `run` is still the active run.
fn commit(
    shared: &Shared,
    run: RunId,
    kind: EngineKind,
    outcome: EngineOutcome,
    document: Option<&ElementNode>,
) {
    let snapshot = match outcome {
        EngineOutcome::Completed(report) => {
            let issues = normalize_outcome(&report.outcome, document);
            Some(EngineSnapshot::with_issues(
                EnginePhase::Completed,
                issues,
                report.crashed,
            ))
        }
        EngineOutcome::Faulted(reason) => {
            tracing::error!("{} validator faulted in run {}: {}", kind, run, reason);
            let issue = Issue::new(
                Severity::Error,
                format!("Internal error in {kind} validator: {reason}"),
                "",
                None,
            );
            Some(EngineSnapshot::with_issues(
                EnginePhase::Faulted,
                vec![issue],
                false,
            ))
        }
        EngineOutcome::Canceled => None,
    };

    let session = shared.session();
    if session.active.as_ref().map(|active| active.id) != Some(run) {
        tracing::debug!("discarding {} result of superseded run {}", kind, run);
        return;
    }

    let phase = match snapshot {
        Some(snapshot) => {
            let phase = snapshot.phase;
            tracing::info!(
                "{} validator finished run {}: {} error(s), {} warning(s)",
                kind,
                run,
                snapshot.error_count,
                snapshot.warning_count
            );
            shared
                .state
                .send_modify(|state| *state.engine_mut(kind) = snapshot);
            phase
        }
        None => {
            // Killed from outside while the run stayed active
            shared
                .state
                .send_modify(|state| state.engine_mut(kind).mark_canceled());
            EnginePhase::Canceled
        }
    };
    drop(session);

    shared.emit(ValidationEvent::EngineFinished {
        run,
        engine: kind,
        phase,
    });
}

fn finish(shared: &Shared, run: RunId, started: Instant) {
    let mut session = shared.session();
    if session.active.as_ref().map(|active| active.id) != Some(run) {
        return;
    }
    session.active = None;
    shared.state.send_modify(|state| state.run = None);
    drop(session);

    tracing::info!(
        "validation run {} finished in {}ms",
        run,
        started.elapsed().as_millis()
    );
    shared.emit(ValidationEvent::RunFinished { run });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineReport;
    use async_trait::async_trait;
    use fhir::{OperationOutcome, OutcomeIssue, SourcePosition};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const PATIENT: &str = "{\n  \"resourceType\": \"Patient\",\n  \"active\": true\n}";

    #[derive(Clone, Copy)]
    enum Behaviour {
        /// Sleep, then report; returns Canceled if the token fires first.
        Report,
        /// Sleep, then report regardless of cancellation.
        IgnoreCancel,
        Panic,
    }

    /// A fake engine with per-call latency that reports one issue naming the call.
    struct ScriptedEngine {
        label: &'static str,
        behaviour: Behaviour,
        delays: Vec<Duration>,
        calls: AtomicUsize,
        last_request: Mutex<Option<Arc<ValidationRequest>>>,
    }

    impl ScriptedEngine {
        fn new(label: &'static str, behaviour: Behaviour, delays: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                label,
                behaviour,
                delays: delays.iter().map(|ms| Duration::from_millis(*ms)).collect(),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> Arc<ValidationRequest> {
            self.last_request
                .lock()
                .expect("lock last request")
                .clone()
                .expect("engine was invoked")
        }
    }

    #[async_trait]
    impl ValidationEngine for ScriptedEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::Managed
        }

        async fn validate(
            &self,
            request: Arc<ValidationRequest>,
            cancel: CancellationToken,
        ) -> EngineOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().expect("lock last request") = Some(request);
            let delay = self
                .delays
                .get(call)
                .or(self.delays.last())
                .copied()
                .unwrap_or_default();

            match self.behaviour {
                Behaviour::Panic => panic!("{} engine exploded", self.label),
                Behaviour::Report => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return EngineOutcome::Canceled,
                    }
                }
                Behaviour::IgnoreCancel => tokio::time::sleep(delay).await,
            }

            EngineOutcome::Completed(EngineReport::new(OperationOutcome::new(vec![
                OutcomeIssue::new("error", "structure", format!("{} call {}", self.label, call + 1))
                    .with_location("Patient.active"),
                OutcomeIssue::new("warning", "informational", "advice"),
            ])))
        }
    }

    fn config(temp: &TempDir) -> CoreConfig {
        CoreConfig::new(
            temp.path().to_path_buf(),
            PathBuf::from("java"),
            temp.path().join("validator.jar"),
            FhirVersion::Stu3,
            "https://tx.fhir.org/r3".into(),
        )
        .expect("valid config")
    }

    fn orchestrator(
        temp: &TempDir,
        managed: Arc<ScriptedEngine>,
        external: Arc<ScriptedEngine>,
    ) -> Orchestrator {
        Orchestrator::with_engines(&config(temp), managed, external, SubprocessRegistry::new())
    }

    fn messages(engine: &EngineSnapshot) -> Vec<&str> {
        engine.issues.iter().map(Issue::message).collect()
    }

    async fn idle(orchestrator: &Orchestrator) -> ValidationSnapshot {
        tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_until_idle())
            .await
            .expect("run finishes")
    }

    #[tokio::test]
    async fn start_requires_a_loaded_document() {
        let temp = TempDir::new().expect("create temp dir");
        let orchestrator = orchestrator(
            &temp,
            ScriptedEngine::new("managed", Behaviour::Report, &[0]),
            ScriptedEngine::new("external", Behaviour::Report, &[0]),
        );
        assert!(matches!(
            orchestrator.start_validation(),
            Err(CoreError::NoDocumentLoaded)
        ));
        assert_eq!(orchestrator.snapshot(), ValidationSnapshot::default());
    }

    #[test]
    fn start_requires_a_runtime() {
        let temp = TempDir::new().expect("create temp dir");
        let orchestrator = orchestrator(
            &temp,
            ScriptedEngine::new("managed", Behaviour::Report, &[0]),
            ScriptedEngine::new("external", Behaviour::Report, &[0]),
        );
        orchestrator.load_resource_text(PATIENT);
        assert!(matches!(
            orchestrator.start_validation(),
            Err(CoreError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn run_commits_normalised_results_for_both_engines() {
        let temp = TempDir::new().expect("create temp dir");
        let orchestrator = orchestrator(
            &temp,
            ScriptedEngine::new("managed", Behaviour::Report, &[10]),
            ScriptedEngine::new("external", Behaviour::Report, &[80]),
        );
        assert_eq!(
            orchestrator.load_resource_text(PATIENT),
            ResourceFormat::Json
        );
        let mut events = orchestrator.subscribe_events();

        let run = orchestrator.start_validation().expect("start run");
        let started = orchestrator.snapshot();
        assert!(started.managed.busy && started.external.busy);
        assert_eq!(started.managed.phase, EnginePhase::Busy);

        let state = idle(&orchestrator).await;
        for kind in EngineKind::ALL {
            let engine = state.engine(kind);
            assert_eq!(engine.phase, EnginePhase::Completed);
            assert!(!engine.busy);
            assert_eq!(engine.error_count, 1);
            assert_eq!(engine.warning_count, 1);
            assert_eq!(
                engine.issues[0].position(),
                Some(SourcePosition::new(3, 3))
            );
            assert_eq!(engine.issues[1].position(), None);
        }
        assert_eq!(messages(&state.managed)[0], "managed call 1");
        assert_eq!(messages(&state.external)[0], "external call 1");

        assert_eq!(
            events.recv().await.expect("started event"),
            ValidationEvent::RunStarted { run }
        );
        let mut finished = Vec::new();
        for _ in 0..2 {
            match events.recv().await.expect("engine event") {
                ValidationEvent::EngineFinished { engine, phase, .. } => {
                    assert_eq!(phase, EnginePhase::Completed);
                    finished.push(engine);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(finished, vec![EngineKind::Managed, EngineKind::External]);
        assert_eq!(
            events.recv().await.expect("finished event"),
            ValidationEvent::RunFinished { run }
        );
    }

    #[tokio::test]
    async fn superseded_results_are_never_committed() {
        let temp = TempDir::new().expect("create temp dir");
        // First call is slow and ignores cancellation; second call is fast
        let managed = ScriptedEngine::new("managed", Behaviour::IgnoreCancel, &[300, 20]);
        let external = ScriptedEngine::new("external", Behaviour::IgnoreCancel, &[300, 20]);
        let orchestrator = orchestrator(&temp, Arc::clone(&managed), Arc::clone(&external));
        orchestrator.load_resource_text(PATIENT);
        let mut events = orchestrator.subscribe_events();

        let first = orchestrator.start_validation().expect("start first run");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = orchestrator.start_validation().expect("start second run");
        assert!(second > first);

        let state = idle(&orchestrator).await;
        assert_eq!(messages(&state.managed)[0], "managed call 2");
        assert_eq!(messages(&state.external)[0], "external call 2");

        // Let the first run's engines finish and try to commit
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(managed.calls(), 2);
        assert_eq!(orchestrator.snapshot(), state);

        let mut committed_runs = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ValidationEvent::EngineFinished { run, .. } = event {
                committed_runs.push(run);
            }
        }
        assert_eq!(committed_runs, vec![second, second]);
    }

    #[tokio::test]
    async fn completion_order_does_not_change_results() {
        let run_with = |managed_ms: u64, external_ms: u64| async move {
            let temp = TempDir::new().expect("create temp dir");
            let orchestrator = orchestrator(
                &temp,
                ScriptedEngine::new("managed", Behaviour::Report, &[managed_ms]),
                ScriptedEngine::new("external", Behaviour::Report, &[external_ms]),
            );
            orchestrator.load_resource_text(PATIENT);
            orchestrator.start_validation().expect("start run");
            let state = idle(&orchestrator).await;
            (state.managed, state.external)
        };

        let managed_first = run_with(5, 80).await;
        let external_first = run_with(80, 5).await;
        assert_eq!(managed_first, external_first);
    }

    #[tokio::test]
    async fn engine_panics_become_a_synthetic_issue() {
        let temp = TempDir::new().expect("create temp dir");
        let orchestrator = orchestrator(
            &temp,
            ScriptedEngine::new("managed", Behaviour::Report, &[5]),
            ScriptedEngine::new("external", Behaviour::Panic, &[0]),
        );
        orchestrator.load_resource_text(PATIENT);
        orchestrator.start_validation().expect("start run");

        let state = idle(&orchestrator).await;
        assert_eq!(state.external.phase, EnginePhase::Faulted);
        assert!(!state.external.busy);
        assert_eq!(state.external.issues.len(), 1);
        assert_eq!(state.external.error_count, 1);
        assert!(state.external.issues[0]
            .message()
            .starts_with("Internal error in Java validator"));

        assert_eq!(state.managed.phase, EnginePhase::Completed);
        assert_eq!(messages(&state.managed)[0], "managed call 1");
    }

    #[tokio::test]
    async fn cancel_clears_busy_without_recording_results() {
        let temp = TempDir::new().expect("create temp dir");
        let managed = ScriptedEngine::new("managed", Behaviour::IgnoreCancel, &[100]);
        let external = ScriptedEngine::new("external", Behaviour::Report, &[60_000]);
        let orchestrator = orchestrator(&temp, Arc::clone(&managed), external);
        orchestrator.load_resource_text(PATIENT);
        let mut events = orchestrator.subscribe_events();

        let run = orchestrator.start_validation().expect("start run");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orchestrator.cancel_validation());
        assert!(!orchestrator.cancel_validation());

        let state = orchestrator.snapshot();
        assert!(!state.is_busy());
        for kind in EngineKind::ALL {
            assert_eq!(state.engine(kind).phase, EnginePhase::Canceled);
            assert!(state.engine(kind).issues.is_empty());
        }

        // The managed engine still completes; its result must be discarded
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(managed.calls(), 1);
        assert_eq!(orchestrator.snapshot(), state);

        assert_eq!(
            events.recv().await.expect("started"),
            ValidationEvent::RunStarted { run }
        );
        assert_eq!(
            events.recv().await.expect("canceled"),
            ValidationEvent::RunCanceled { run }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_format_still_runs_both_engines() {
        let temp = TempDir::new().expect("create temp dir");
        let managed = ScriptedEngine::new("managed", Behaviour::Report, &[0]);
        let external = ScriptedEngine::new("external", Behaviour::Report, &[0]);
        let orchestrator = orchestrator(&temp, Arc::clone(&managed), Arc::clone(&external));
        assert_eq!(
            orchestrator.load_resource_text("not a resource"),
            ResourceFormat::Unknown
        );
        orchestrator.start_validation().expect("start run");

        let state = idle(&orchestrator).await;
        assert_eq!(managed.calls(), 1);
        assert_eq!(external.calls(), 1);
        assert_eq!(managed.last_request().format, ResourceFormat::Unknown);
        assert!(state.managed.issues.iter().all(|issue| issue.position().is_none()));
    }

    #[tokio::test]
    async fn runs_snapshot_settings_at_start() {
        let temp = TempDir::new().expect("create temp dir");
        let scope = TempDir::new().expect("create scope dir");
        let managed = ScriptedEngine::new("managed", Behaviour::Report, &[0]);
        let external = ScriptedEngine::new("external", Behaviour::Report, &[0]);
        let orchestrator = orchestrator(&temp, Arc::clone(&managed), Arc::clone(&external));
        orchestrator.load_resource_text(PATIENT);

        orchestrator.set_fhir_version(FhirVersion::R4);
        orchestrator
            .set_scope_directory(Some(scope.path().to_path_buf()))
            .expect("set scope");
        assert!(orchestrator
            .set_scope_directory(Some(temp.path().join("missing")))
            .is_err());

        let settings = orchestrator.settings();
        assert_eq!(settings.terminology_service, "https://tx.fhir.org/r4");
        assert_eq!(settings.scope_directory.as_deref(), Some(scope.path()));

        orchestrator.start_validation().expect("start run");
        idle(&orchestrator).await;

        let request = external.last_request();
        assert_eq!(request.fhir_version, FhirVersion::R4);
        assert_eq!(request.profiles.fhir_version(), FhirVersion::R4);
        assert_eq!(request.profiles.scope_directory(), Some(scope.path()));
        assert_eq!(
            request.terminology,
            TerminologySetting::Remote("https://tx.fhir.org/r4".into())
        );

        orchestrator.set_terminology_service("off");
        orchestrator.start_validation().expect("start second run");
        idle(&orchestrator).await;
        assert_eq!(
            managed.last_request().terminology,
            TerminologySetting::LocalOnly
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancel_kills_live_validator_processes() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().expect("create temp dir");
        let java = temp.path().join("java");
        std::fs::write(&java, "#!/bin/sh\nexec sleep 30\n").expect("write fake java");
        let mut permissions = std::fs::metadata(&java)
            .expect("read fake java metadata")
            .permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&java, permissions).expect("make fake java executable");

        let registry = SubprocessRegistry::new();
        let external = Arc::new(ExternalEngine::new(
            java,
            temp.path().join("validator.jar"),
            Arc::clone(&registry),
        ));
        let orchestrator = Orchestrator::with_engines(
            &config(&temp),
            ScriptedEngine::new("managed", Behaviour::Report, &[0]),
            external,
            Arc::clone(&registry),
        );
        orchestrator.load_resource_text(PATIENT);
        orchestrator.start_validation().expect("start run");

        let mut pid = None;
        for _ in 0..200 {
            pid = registry.live_pids().first().copied();
            if pid.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let pid = pid.expect("validator process registered");

        assert!(orchestrator.cancel_validation());

        let proc_entry = PathBuf::from(format!("/proc/{pid}"));
        let mut alive = true;
        for _ in 0..200 {
            alive = proc_entry.exists();
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!alive, "validator process {pid} survived cancellation");
        assert!(!orchestrator.snapshot().external.busy);
    }
}
