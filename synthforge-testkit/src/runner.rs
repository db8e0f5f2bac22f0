use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use synthforge::*;
use tokio::sync::Semaphore;

/// What a scripted launch does once it is let through.
#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    /// Exit 0 with this output.
    Output(String),
    /// Exit non-zero with this output.
    Exit { code: i32, output: String },
    /// Return this error without running.
    Error(EngineError),
    /// Sleep, then behave like the inner outcome.
    Delayed(Duration, Box<ScriptedOutcome>),
    /// Panic inside the runner.
    Panic(String),
}

impl ScriptedOutcome {
    pub fn output(output: impl Into<String>) -> Self {
        ScriptedOutcome::Output(output.into())
    }

    pub fn exit(code: i32, output: impl Into<String>) -> Self {
        ScriptedOutcome::Exit {
            code,
            output: output.into(),
        }
    }

    pub fn delayed(self, delay: Duration) -> Self {
        ScriptedOutcome::Delayed(delay, Box::new(self))
    }
}

/// In-process [`TaskRunner`] that records every launch and answers from a
/// script instead of starting a process.
///
/// Outcomes queued with [`ScriptedRunner::push`] are used first, then the
/// per-kind default, then a plain success. While held, launches are recorded
/// immediately but wait for [`ScriptedRunner::release`] before answering.
#[derive(Clone)]
pub struct ScriptedRunner {
    launches: Arc<Mutex<Vec<TaskInvocation>>>,
    queued: Arc<Mutex<HashMap<TaskKind, VecDeque<ScriptedOutcome>>>>,
    defaults: Arc<Mutex<HashMap<TaskKind, ScriptedOutcome>>>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    write_artifacts: bool,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            launches: Arc::new(Mutex::new(Vec::new())),
            queued: Arc::new(Mutex::new(HashMap::new())),
            defaults: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(Mutex::new(None)),
            write_artifacts: false,
        }
    }

    /// Successful launches create the file named by `--output`.
    pub fn with_artifact_files(mut self) -> Self {
        self.write_artifacts = true;
        self
    }

    /// Answer the next launch of `kind` with `outcome`.
    pub fn push(&self, kind: TaskKind, outcome: ScriptedOutcome) {
        self.queued.lock().entry(kind).or_default().push_back(outcome);
    }

    /// Answer every launch of `kind` with `outcome` once the queue is empty.
    pub fn set_default(&self, kind: TaskKind, outcome: ScriptedOutcome) {
        self.defaults.lock().insert(kind, outcome);
    }

    /// Make launches wait until released.
    pub fn hold(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held launches through.
    pub fn release(&self, count: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Stop holding; every waiting and future launch goes through.
    pub fn release_all(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn launches(&self) -> Vec<TaskInvocation> {
        self.launches.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn launches_of(&self, kind: TaskKind) -> Vec<TaskInvocation> {
        self.launches
            .lock()
            .iter()
            .filter(|invocation| invocation.kind == kind)
            .cloned()
            .collect()
    }

    pub fn launch_count_of(&self, kind: TaskKind) -> usize {
        self.launches
            .lock()
            .iter()
            .filter(|invocation| invocation.kind == kind)
            .count()
    }

    /// Wait until at least `count` launches of `kind` were recorded.
    pub async fn wait_for_launches(&self, kind: TaskKind, count: usize, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while self.launch_count_of(kind) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn assert_launch_count_eq(&self, kind: TaskKind, expected: usize) {
        let actual = self.launch_count_of(kind);
        assert_eq!(
            actual, expected,
            "Expected {} {} launches, got {}",
            expected, kind, actual
        );
    }

    fn next_outcome(&self, kind: TaskKind) -> ScriptedOutcome {
        if let Some(outcome) = self
            .queued
            .lock()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        self.defaults
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| ScriptedOutcome::output(format!("{kind} finished")))
    }

    async fn wait_at_gate(&self) {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire_owned().await {
                permit.forget();
            }
        }
    }

    async fn write_artifact(&self, invocation: &TaskInvocation) -> EngineResult<()> {
        let Some(path) = invocation.arg_value("--output") else {
            return Ok(());
        };
        tokio::fs::write(path, b"scripted artifact")
            .await
            .map_err(|err| EngineError::io(format!("writing {path}"), err))
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("launches", &self.launches.lock().len())
            .field("held", &self.gate.lock().is_some())
            .finish()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, invocation: TaskInvocation) -> EngineResult<TaskOutput> {
        self.launches.lock().push(invocation.clone());
        self.wait_at_gate().await;

        let kind = invocation.kind;
        let mut outcome = self.next_outcome(kind);
        while let ScriptedOutcome::Delayed(delay, inner) = outcome {
            tokio::time::sleep(delay).await;
            outcome = *inner;
        }

        match outcome {
            ScriptedOutcome::Output(output) => {
                if self.write_artifacts {
                    self.write_artifact(&invocation).await?;
                }
                Ok(TaskOutput::success(output))
            }
            ScriptedOutcome::Exit { code, output } => Err(EngineError::ProcessExit {
                kind,
                exit_code: code,
                output,
            }),
            ScriptedOutcome::Error(err) => Err(err),
            ScriptedOutcome::Panic(message) => panic!("{message}"),
            ScriptedOutcome::Delayed(..) => unreachable!("delays are unwrapped above"),
        }
    }
}
