//! Real child processes: `sh` scripts stand in for the engine scripts.
#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use synthforge::*;
use synthforge_testkit::{dataset_ref, wait_for_terminal};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), format!("#!/bin/sh\n{body}\n")).unwrap();
}

fn sh_config(engine_dir: &Path, storage_root: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_interpreter("sh")
        .with_engine_dir(engine_dir)
        .with_storage_root(storage_root)
        .with_scripts(ScriptConfig {
            train: "train.sh".into(),
            generate: "generate.sh".into(),
            evaluate: "evaluate.sh".into(),
            stats: "stats.sh".into(),
        })
}

#[tokio::test]
async fn test_nonzero_exit_reports_code_and_merged_output() {
    let engine_dir = TempDir::new().unwrap();
    write_script(
        engine_dir.path(),
        "stats.sh",
        "echo 'reading file'\necho 'no such column' 1>&2\nexit 3",
    );
    let runner = ProcessTaskRunner::new(&sh_config(engine_dir.path(), engine_dir.path()));

    let err = runner
        .run(TaskInvocation::new(TaskKind::Stats).flag("--data", "x.csv"))
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), Some(3));
    let output = err.output().unwrap();
    assert!(output.contains("reading file"));
    assert!(output.contains("no such column"));
    assert!(err.to_string().starts_with("stats task exited with code 3"));
}

#[tokio::test]
async fn test_successful_run_passes_arguments_and_returns_payload() {
    let engine_dir = TempDir::new().unwrap();
    write_script(
        engine_dir.path(),
        "evaluate.sh",
        "echo \"args: $*\"\necho '{\"overall_score\": 0.5}'",
    );
    let runner = ProcessTaskRunner::new(&sh_config(engine_dir.path(), engine_dir.path()));

    let output = runner
        .run(
            TaskInvocation::new(TaskKind::Evaluate)
                .flag("--model", "m.pkl")
                .flag("--samples", 10),
        )
        .await
        .unwrap();

    assert_eq!(output.exit_code, 0);
    assert!(output.output.contains("args: --model m.pkl --samples 10"));
    assert_eq!(output.json_payload(), "{\"overall_score\": 0.5}");
}

#[tokio::test]
async fn test_tasks_run_in_engine_dir_by_default() {
    let engine_dir = TempDir::new().unwrap();
    write_script(engine_dir.path(), "stats.sh", "pwd");
    let runner = ProcessTaskRunner::new(&sh_config(engine_dir.path(), engine_dir.path()));

    let output = runner.run(TaskInvocation::new(TaskKind::Stats)).await.unwrap();

    let expected = engine_dir.path().canonicalize().unwrap();
    let reported = Path::new(output.output.trim()).canonicalize().unwrap();
    assert_eq!(reported, expected);
}

#[tokio::test]
async fn test_process_timeout_kills_task() {
    let engine_dir = TempDir::new().unwrap();
    write_script(engine_dir.path(), "generate.sh", "exec sleep 30");
    let config = sh_config(engine_dir.path(), engine_dir.path())
        .with_process_timeout(Some(Duration::from_secs(1)));
    let runner = ProcessTaskRunner::new(&config);

    let started = std::time::Instant::now();
    let err = runner
        .run(TaskInvocation::new(TaskKind::Generate))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::ProcessTimeout {
            kind: TaskKind::Generate,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_zero_timeout_waits_for_task() {
    let engine_dir = TempDir::new().unwrap();
    write_script(engine_dir.path(), "stats.sh", "sleep 0.2\necho '{\"rows\": 3}'");
    let mut config = sh_config(engine_dir.path(), engine_dir.path());
    config.process_timeout_secs = Some(0);
    let runner = ProcessTaskRunner::new(&config);

    let output = runner.run(TaskInvocation::new(TaskKind::Stats)).await.unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(output.json_payload(), "{\"rows\": 3}");
}

#[tokio::test]
async fn test_missing_interpreter_is_launch_error() {
    let engine_dir = TempDir::new().unwrap();
    let config = sh_config(engine_dir.path(), engine_dir.path())
        .with_interpreter("/nonexistent/synthforge-interpreter");
    let runner = ProcessTaskRunner::new(&config);

    let err = runner
        .run(TaskInvocation::new(TaskKind::Train))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::ProcessLaunch {
            kind: TaskKind::Train,
            ..
        }
    ));
    assert_eq!(err.exit_code(), None);
}

#[tokio::test]
async fn test_engine_trains_with_real_process() {
    let engine_dir = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    write_script(
        engine_dir.path(),
        "train.sh",
        r#"while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then touch "$2"; fi
  shift
done"#,
    );
    let engine = StandardEngineBuilder::new(sh_config(engine_dir.path(), storage.path()))
        .build()
        .unwrap();

    let model_id = engine
        .submit_training(dataset_ref("real"), "CTGAN", json!({"epochs": 1}))
        .await
        .unwrap();
    let view = wait_for_terminal(&engine, model_id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(view.status, ModelStatus::Completed);
    let artifact = view.artifact_path.unwrap();
    assert!(artifact.is_file());
    assert_eq!(artifact, storage.path().join("models").join(format!("model_{model_id}.pkl")));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_engine_records_real_training_failure() {
    let engine_dir = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    write_script(
        engine_dir.path(),
        "train.sh",
        "echo 'epoch 1/1'\necho 'RuntimeError: CUDA out of memory' 1>&2\nexit 1",
    );
    let engine = StandardEngineBuilder::new(sh_config(engine_dir.path(), storage.path()))
        .build()
        .unwrap();

    let model_id = engine
        .submit_training(dataset_ref("oom"), "CTGAN", json!({}))
        .await
        .unwrap();
    let view = wait_for_terminal(&engine, model_id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(view.status, ModelStatus::Failed);
    assert!(view.artifact_path.is_none());
    let failure = view.failure.unwrap();
    assert_eq!(failure.exit_code, Some(1));
    assert!(failure
        .output_tail
        .unwrap()
        .contains("RuntimeError: CUDA out of memory"));

    engine.shutdown().await;
}
