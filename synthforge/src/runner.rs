//! External task execution.
//!
//! Every heavy computation (training, generation, evaluation, dataset
//! statistics) is an external script. [`TaskRunner`] is the seam the rest of
//! the engine talks to; [`ProcessTaskRunner`] is the `tokio::process`
//! implementation used in production.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn, Instrument};

use crate::config::{EngineConfig, ScriptConfig};
use crate::error::{EngineError, EngineResult};
use crate::model::{tail, ModelId};
use crate::telemetry;

/// The four external computations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Train,
    Generate,
    Evaluate,
    Stats,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Train => "train",
            TaskKind::Generate => "generate",
            TaskKind::Evaluate => "evaluate",
            TaskKind::Stats => "stats",
        }
    }

    /// Evaluate and stats results are parsed from the output, so they keep
    /// all of it.
    pub fn default_capture(&self) -> OutputCapture {
        match self {
            TaskKind::Evaluate | TaskKind::Stats => OutputCapture::Full,
            TaskKind::Train | TaskKind::Generate => OutputCapture::Tail,
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much process output a runner keeps in memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputCapture {
    Full,
    /// Only the last `output_tail_bytes` bytes.
    Tail,
}

/// One launch of an external computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInvocation {
    pub kind: TaskKind,
    pub model_id: Option<ModelId>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub capture: OutputCapture,
}

impl TaskInvocation {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            model_id: None,
            args: Vec::new(),
            working_dir: None,
            capture: kind.default_capture(),
        }
    }

    pub fn for_model(mut self, model_id: ModelId) -> Self {
        self.model_id = Some(model_id);
        self
    }

    /// Append `name value`.
    pub fn flag(mut self, name: &str, value: impl Display) -> Self {
        self.args.push(name.to_string());
        self.args.push(value.to_string());
        self
    }

    pub fn path_flag(self, name: &str, path: &Path) -> Self {
        let value = path.to_string_lossy().into_owned();
        self.flag(name, value)
    }

    pub fn flag_opt(self, name: &str, value: Option<impl Display>) -> Self {
        match value {
            Some(value) => self.flag(name, value),
            None => self,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_capture(mut self, capture: OutputCapture) -> Self {
        self.capture = capture;
        self
    }

    /// Value following `name` in the argument list.
    pub fn arg_value(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == name)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

/// Result of a process that exited successfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskOutput {
    pub exit_code: i32,
    /// Merged stdout and stderr, subject to the invocation's capture mode.
    pub output: String,
}

impl TaskOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    /// The JSON object embedded in the output.
    pub fn json_payload(&self) -> &str {
        extract_json_object(&self.output)
    }
}

/// Launches and supervises external computations.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    /// Run the invocation to completion. A non-zero exit is an error.
    async fn run(&self, invocation: TaskInvocation) -> EngineResult<TaskOutput>;
}

#[async_trait]
impl<T: TaskRunner + ?Sized> TaskRunner for Arc<T> {
    async fn run(&self, invocation: TaskInvocation) -> EngineResult<TaskOutput> {
        (**self).run(invocation).await
    }
}

/// Slice of `output` from the first `{` to the last `}`, inclusive.
///
/// Scripts print progress around their result, so the payload is cut out
/// rather than parsed from the whole stream. Without a well-ordered brace
/// pair the trimmed output is returned as is.
pub fn extract_json_object(output: &str) -> &str {
    match (output.find('{'), output.rfind('}')) {
        (Some(start), Some(end)) if start < end => &output[start..=end],
        _ => output.trim(),
    }
}

/// Runs engine scripts as child processes of the configured interpreter.
#[derive(Clone, Debug)]
pub struct ProcessTaskRunner {
    interpreter: String,
    engine_dir: PathBuf,
    scripts: ScriptConfig,
    tail_bytes: usize,
    timeout: Option<Duration>,
}

impl ProcessTaskRunner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            engine_dir: config.engine_dir.clone(),
            scripts: config.scripts.clone(),
            tail_bytes: config.output_tail_bytes,
            timeout: config.process_timeout(),
        }
    }

    /// Script for `kind`, absolute so a relative engine dir survives the
    /// working directory change.
    fn script_path(&self, kind: TaskKind) -> PathBuf {
        let script = self.engine_dir.join(self.scripts.script_for(kind));
        std::path::absolute(&script).unwrap_or(script)
    }

    /// Full command line, interpreter first.
    pub fn command_line(&self, invocation: &TaskInvocation) -> Vec<String> {
        let script = self.script_path(invocation.kind);
        let mut line = vec![
            self.interpreter.clone(),
            script.to_string_lossy().into_owned(),
        ];
        line.extend(invocation.args.iter().cloned());
        line
    }

    fn spawn(&self, invocation: &TaskInvocation) -> EngineResult<Child> {
        let script = self.script_path(invocation.kind);
        let working_dir = invocation
            .working_dir
            .as_deref()
            .unwrap_or(self.engine_dir.as_path());

        Command::new(&self.interpreter)
            .arg(&script)
            .args(&invocation.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::ProcessLaunch {
                kind: invocation.kind,
                program: format!("{} {}", self.interpreter, script.display()),
                source: Arc::new(source),
            })
    }

    async fn drive(
        child: &mut Child,
        invocation: &TaskInvocation,
        buffer: &mut OutputBuffer,
    ) -> EngineResult<i32> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        while let Some(raw) = rx.recv().await {
            let line = decode_line(&raw);
            log_line(invocation.kind, &line);
            buffer.push_line(&line);
        }

        let status = child
            .wait()
            .await
            .map_err(|err| EngineError::io(format!("waiting for {} task", invocation.kind), err))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl TaskRunner for ProcessTaskRunner {
    async fn run(&self, invocation: TaskInvocation) -> EngineResult<TaskOutput> {
        let span = telemetry::task_span(invocation.kind, invocation.model_id);
        let started = Instant::now();

        let result = self.execute(&invocation).instrument(span).await;

        let status = match &result {
            Ok(_) => "success",
            Err(EngineError::ProcessExit { .. }) => "failure",
            Err(EngineError::ProcessTimeout { .. }) => "timeout",
            Err(_) => "error",
        };
        telemetry::observe_task_duration(invocation.kind, status, started.elapsed());
        result
    }
}

impl ProcessTaskRunner {
    async fn execute(&self, invocation: &TaskInvocation) -> EngineResult<TaskOutput> {
        let kind = invocation.kind;
        debug!(command = ?self.command_line(invocation), "launching task");
        let mut child = self.spawn(invocation)?;
        let mut buffer = OutputBuffer::new(invocation.capture, self.tail_bytes);

        let outcome = match self.timeout {
            Some(limit) => {
                tokio::time::timeout(limit, Self::drive(&mut child, invocation, &mut buffer))
                    .await
                    .map_err(|_| limit)
            }
            None => Ok(Self::drive(&mut child, invocation, &mut buffer).await),
        };

        match outcome {
            Ok(Ok(0)) => Ok(TaskOutput {
                exit_code: 0,
                output: buffer.into_output(),
            }),
            Ok(Ok(exit_code)) => {
                debug!(exit_code, "task exited unsuccessfully");
                Err(EngineError::ProcessExit {
                    kind,
                    exit_code,
                    output: buffer.into_output(),
                })
            }
            Ok(Err(err)) => Err(err),
            Err(after) => {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed out task");
                }
                Err(EngineError::ProcessTimeout { kind, after })
            }
        }
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(segment)) => {
                if tx.send(segment).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "task output stream failed");
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn log_line(kind: TaskKind, line: &str) {
    match kind {
        TaskKind::Generate => trace!(task_kind = kind.as_str(), "{line}"),
        TaskKind::Train | TaskKind::Evaluate | TaskKind::Stats => {
            debug!(task_kind = kind.as_str(), "{line}")
        }
    }
}

/// Accumulates process output under a capture mode.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    capture: OutputCapture,
    limit: usize,
    text: String,
}

impl OutputBuffer {
    pub(crate) fn new(capture: OutputCapture, limit: usize) -> Self {
        Self {
            capture,
            limit,
            text: String::new(),
        }
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        if self.capture == OutputCapture::Tail && self.text.len() > self.limit.saturating_mul(2) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let keep = tail(&self.text, self.limit).len();
        let cut = self.text.len() - keep;
        self.text.drain(..cut);
    }

    pub(crate) fn into_output(mut self) -> String {
        if self.capture == OutputCapture::Tail {
            self.compact();
        }
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_strips_noise() {
        let output = "Loading data...\n{\"rows\": 10, \"nested\": {\"a\": 1}}\ndone";
        assert_eq!(
            extract_json_object(output),
            "{\"rows\": 10, \"nested\": {\"a\": 1}}"
        );
    }

    #[test]
    fn test_extract_json_object_without_braces_returns_trimmed() {
        assert_eq!(extract_json_object("  no json here \n"), "no json here");
        assert_eq!(extract_json_object("} backwards {"), "} backwards {");
        assert_eq!(extract_json_object(""), "");
    }

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut buffer = OutputBuffer::new(OutputCapture::Tail, 8);
        for i in 0..100 {
            buffer.push_line(&format!("line {i}"));
        }
        let output = buffer.into_output();
        assert!(output.len() <= 8);
        assert!(output.ends_with("99\n"));
    }

    #[test]
    fn test_full_buffer_keeps_everything() {
        let mut buffer = OutputBuffer::new(OutputCapture::Full, 8);
        for i in 0..100 {
            buffer.push_line(&format!("line {i}"));
        }
        let output = buffer.into_output();
        assert!(output.starts_with("line 0\n"));
        assert_eq!(output.lines().count(), 100);
    }

    #[test]
    fn test_decode_line_is_lossy_and_strips_cr() {
        assert_eq!(decode_line(b"progress 50%\r"), "progress 50%");
        assert_eq!(decode_line(&[0x66, 0xff, 0x6f]), "f\u{fffd}o");
    }

    #[test]
    fn test_invocation_builder() {
        let id = ModelId::new();
        let invocation = TaskInvocation::new(TaskKind::Generate)
            .for_model(id)
            .flag("--count", 100)
            .flag_opt("--anomalies", None::<String>)
            .path_flag("--output", Path::new("/tmp/out.csv"));
        assert_eq!(invocation.capture, OutputCapture::Tail);
        assert_eq!(invocation.model_id, Some(id));
        assert_eq!(
            invocation.args,
            vec!["--count", "100", "--output", "/tmp/out.csv"]
        );
        assert_eq!(invocation.arg_value("--count"), Some("100"));
        assert_eq!(invocation.arg_value("--anomalies"), None);
    }

    #[test]
    fn test_command_line_uses_configured_script() {
        let config = EngineConfig::default()
            .with_interpreter("python3")
            .with_engine_dir("/opt/engine");
        let runner = ProcessTaskRunner::new(&config);
        let invocation = TaskInvocation::new(TaskKind::Stats).flag("--data", "a.csv");
        assert_eq!(
            runner.command_line(&invocation),
            vec!["python3", "/opt/engine/stats.py", "--data", "a.csv"]
        );
    }

    #[test]
    fn test_task_kind_display_and_capture() {
        assert_eq!(TaskKind::Train.to_string(), "train");
        assert_eq!(TaskKind::Evaluate.default_capture(), OutputCapture::Full);
        assert_eq!(TaskKind::Generate.default_capture(), OutputCapture::Tail);
    }
}
