//! Run Driver Integration Tests
//!
//! End-to-end runs of the shipped translate pipeline against a scripted
//! completion backend: termination, failure, budgets, cancellation and
//! journal reconstruction.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roundtable::adapters::{AdapterOutput, CompletionBackend, OperationError};
use roundtable::core::{CancelHandle, MergeSpec, Orchestrator, Pipeline, RunOptions, StageError, Toolbox};
use roundtable::domain::{ExhaustReason, Producer, RunState};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// "Translates" by echoing the table found in front of the instructions
struct EchoTranslator {
    calls: AtomicUsize,
    cost_usd: Option<f64>,
    cancel: Option<CancelHandle>,
}

impl EchoTranslator {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            cost_usd: None,
            cancel: None,
        }
    }
}

#[async_trait]
impl CompletionBackend for EchoTranslator {
    fn name(&self) -> &str {
        "echo-translator"
    }

    async fn complete(&self, prompt: &str, _timeout: Duration) -> Result<AdapterOutput, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref cancel) = self.cancel {
            cancel.cancel();
        }

        let table = prompt.split("\n\nAbove is").next().unwrap_or(prompt);
        Ok(AdapterOutput {
            content: format!("Here it is:\n```text\n{}\n```", table.trim()),
            tokens_used: Some(10),
            cost_usd: self.cost_usd,
        })
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn toolbox(backend: Arc<dyn CompletionBackend>) -> Toolbox {
    Toolbox {
        backend,
        shell_program: "kubectl".to_string(),
        shell_interpreter: "sh".to_string(),
        shell_timeout: None,
        completion_timeout: None,
    }
}

fn translate_pipeline() -> Pipeline {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("pipelines").join("translate.yaml");
    Pipeline::from_file(&path).unwrap()
}

fn write_source(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn options(n_round: u32) -> RunOptions {
    RunOptions {
        n_round,
        investment: None,
    }
}

#[tokio::test]
async fn test_translate_run_completes() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), "part-a.json", "{\n  \"Pod\": \"Pod\",\n  \"Node\": \"Node\"\n}\n");

    let backend = Arc::new(EchoTranslator::new());
    let orchestrator = Orchestrator::new(toolbox(backend.clone()));

    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), source.display().to_string(), &options(3), &CancelHandle::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.rounds, 3);
    assert_eq!(outcome.artifacts.len(), 4);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    // Dense indices, in append order
    let seqs: Vec<u64> = outcome.artifacts.iter().map(|a| a.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);

    assert_eq!(outcome.artifacts[0].producer, Producer::ExternalRequest);
    assert!(outcome.artifacts[1].producer.is_stage("reader"));
    assert!(outcome.artifacts[2].producer.is_stage("translator"));
    assert!(outcome.artifacts[3].producer.is_stage("writer"));
    assert_eq!(outcome.artifacts[3].kind.as_str(), "write-confirmation");

    // Fence extracted, braces stripped, trailing comma added
    let written = std::fs::read_to_string(temp.path().join("part-a.json-fanyi.json")).unwrap();
    assert_eq!(written, "\n\n  \"Pod\": \"Pod\",\n  \"Node\": \"Node\",");
    assert_eq!(outcome.last_artifact().unwrap().content, written);
    assert_eq!(outcome.tokens_used, 10);
}

#[tokio::test]
async fn test_more_rounds_change_nothing_once_idle() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), "part-a.json", "{\"Pod\": \"Pod\"}");
    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new())));
    let pipeline = translate_pipeline();

    let short = orchestrator
        .run_pipeline(&pipeline, source.display().to_string(), &options(3), &CancelHandle::new())
        .await
        .unwrap();
    let long = orchestrator
        .run_pipeline(&pipeline, source.display().to_string(), &options(50), &CancelHandle::new())
        .await
        .unwrap();

    assert_eq!(short.state, RunState::Completed);
    assert_eq!(long.state, RunState::Completed);
    assert_eq!(short.rounds, long.rounds);

    let contents = |o: &roundtable::RunOutcome| o.artifacts.iter().map(|a| a.content.clone()).collect::<Vec<_>>();
    assert_eq!(contents(&short), contents(&long));
}

#[tokio::test]
async fn test_missing_source_fails_in_first_round() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("missing.json");

    let backend = Arc::new(EchoTranslator::new());
    let orchestrator = Orchestrator::new(toolbox(backend.clone()));

    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), missing.display().to_string(), &options(3), &CancelHandle::new())
        .await
        .unwrap();

    match outcome.state {
        RunState::Failed {
            ref stage, last_index, ..
        } => {
            assert_eq!(stage, "reader");
            assert_eq!(last_index, Some(0));
        }
        ref other => panic!("Expected Failed, got {other:?}"),
    }
    assert!(matches!(
        outcome.error,
        Some(StageError::Operation {
            source: OperationError::Io { .. },
            ..
        })
    ));
    assert_eq!(outcome.rounds, 0);
    assert_eq!(outcome.artifacts.len(), 1);
    assert!(!outcome.is_success());
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_round_budget_exhausts() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), "part-a.json", "{\"Pod\": \"Pod\"}");
    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new())));

    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), source.display().to_string(), &options(2), &CancelHandle::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.state,
        RunState::Exhausted {
            reason: ExhaustReason::Rounds { limit: 2 }
        }
    );
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.artifacts.len(), 3);
    assert!(outcome.is_success());
    assert!(!temp.path().join("part-a.json-fanyi.json").exists());
}

#[tokio::test]
async fn test_zero_rounds_only_checks_triggers() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), "part-a.json", "{}");
    let backend = Arc::new(EchoTranslator::new());
    let orchestrator = Orchestrator::new(toolbox(backend.clone()));

    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), source.display().to_string(), &options(0), &CancelHandle::new())
        .await
        .unwrap();

    // The reader is triggered by the seed but never activated
    assert_eq!(
        outcome.state,
        RunState::Exhausted {
            reason: ExhaustReason::Rounds { limit: 0 }
        }
    );
    assert_eq!(outcome.rounds, 0);
    assert_eq!(outcome.artifacts.len(), 1);
}

#[tokio::test]
async fn test_zero_rounds_with_nothing_triggered_completes() {
    let pipeline = Pipeline::from_yaml(
        r#"
name: dormant
stages:
  - name: writer
    triggers: [translated-text]
    context:
      - slot: input
        rule: most_recent
    operation:
      type: write_file
      path: /tmp/never-written
    output_kind: write-confirmation
"#,
    )
    .unwrap();

    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new())));
    let outcome = orchestrator
        .run_pipeline(&pipeline, "anything", &options(0), &CancelHandle::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.artifacts.len(), 1);
}

#[tokio::test]
async fn test_stage_without_triggers_never_runs() {
    let pipeline = Pipeline::from_yaml(
        r#"
name: untriggered
stages:
  - name: reader
    context:
      - slot: input
        rule: fixed_index
        index: 0
    operation:
      type: read_file
    output_kind: read-text
"#,
    )
    .unwrap();

    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new())));
    let outcome = orchestrator
        .run_pipeline(&pipeline, "/does/not/matter", &options(3), &CancelHandle::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.rounds, 0);
    assert_eq!(outcome.artifacts.len(), 1);
}

#[tokio::test]
async fn test_investment_caps_cost() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), "part-a.json", "{\"Pod\": \"Pod\"}");

    let backend = Arc::new(EchoTranslator {
        cost_usd: Some(0.5),
        ..EchoTranslator::new()
    });
    let orchestrator = Orchestrator::new(toolbox(backend));

    let run_options = RunOptions {
        n_round: 5,
        investment: Some(0.25),
    };
    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), source.display().to_string(), &run_options, &CancelHandle::new())
        .await
        .unwrap();

    // The translator spends past the investment; the writer never runs
    assert!(matches!(
        outcome.state,
        RunState::Exhausted {
            reason: ExhaustReason::Budget { .. }
        }
    ));
    assert_eq!(outcome.artifacts.len(), 3);
    assert_eq!(outcome.cost_usd, 0.5);
    assert!(!temp.path().join("part-a.json-fanyi.json").exists());
}

#[tokio::test]
async fn test_cancel_before_start() {
    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new())));
    let cancel = CancelHandle::new();
    cancel.cancel();

    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), "/tmp/whatever.json", &options(3), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Cancelled { last_index: Some(0) });
    assert_eq!(outcome.artifacts.len(), 1);
}

#[tokio::test]
async fn test_cancel_between_activations() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), "part-a.json", "{\"Pod\": \"Pod\"}");

    // The translator trips the handle while it runs; its output is kept
    let cancel = CancelHandle::new();
    let backend = Arc::new(EchoTranslator {
        cancel: Some(cancel.clone()),
        ..EchoTranslator::new()
    });
    let orchestrator = Orchestrator::new(toolbox(backend));

    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), source.display().to_string(), &options(5), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Cancelled { last_index: Some(2) });
    assert_eq!(outcome.artifacts.len(), 3);
    assert!(!temp.path().join("part-a.json-fanyi.json").exists());
}

#[tokio::test]
async fn test_journal_reconstructs_run() {
    let temp = TempDir::new().unwrap();
    let source = write_source(temp.path(), "part-a.json", "{\"Pod\": \"Pod\"}");
    let runs_dir = temp.path().join("runs");

    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new()))).with_journal_dir(&runs_dir);
    let outcome = orchestrator
        .run_pipeline(&translate_pipeline(), source.display().to_string(), &options(3), &CancelHandle::new())
        .await
        .unwrap();

    assert!(runs_dir.join(outcome.run_id.to_string()).join("journal.jsonl").exists());

    let summary = orchestrator.get_run_status(outcome.run_id).await.unwrap();
    assert_eq!(summary.id, outcome.run_id);
    assert_eq!(summary.pipeline_name, "translate");
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.rounds, 3);
    assert!(summary.finished_at.is_some());
    assert_eq!(summary.artifacts, outcome.artifacts);

    let runs = orchestrator.list_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, outcome.run_id);
}

#[tokio::test]
async fn test_status_of_unknown_run() {
    let temp = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new()))).with_journal_dir(temp.path());

    assert_err!(orchestrator.get_run_status(uuid::Uuid::new_v4()).await);
    let runs = assert_ok!(orchestrator.list_runs(10).await);
    assert!(runs.is_empty());

    let without = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new())));
    assert_err!(without.list_runs(10).await);
}

#[tokio::test]
async fn test_batch_translates_and_merges() {
    let temp = TempDir::new().unwrap();
    // Written out of order; runs and merge follow file names
    write_source(temp.path(), "c-part.json", "{\"Service\": \"Service\"}");
    write_source(temp.path(), "a-part.json", "{\"Pod\": \"Pod\"}");
    write_source(temp.path(), "b-part.json", "{\"Node\": \"Node\"}");

    let backend = Arc::new(EchoTranslator::new());
    let orchestrator = Orchestrator::new(toolbox(backend.clone()));
    let output = temp.path().join("zh.json");
    let merge = MergeSpec {
        pattern: "*-fanyi.json".to_string(),
        output: output.clone(),
    };

    let report = orchestrator
        .run_batch(
            &translate_pipeline(),
            temp.path(),
            "*-part.json",
            &options(3),
            Some(&merge),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    let names: Vec<String> = report
        .runs
        .iter()
        .map(|(path, _)| path.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["a-part.json", "b-part.json", "c-part.json"]);
    assert_eq!(report.failed().count(), 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    let merged = report.merged.unwrap();
    assert_eq!(std::fs::read_to_string(&output).unwrap(), merged);

    let value: serde_json::Value = serde_json::from_str(&merged).unwrap();
    assert_eq!(value["Pod"], "Pod");
    assert_eq!(value["Node"], "Node");
    assert_eq!(value["Service"], "Service");
    assert!(merged.find("Pod").unwrap() < merged.find("Node").unwrap());
    assert!(merged.find("Node").unwrap() < merged.find("Service").unwrap());
}

#[tokio::test]
async fn test_batch_keeps_going_after_failure() {
    let temp = TempDir::new().unwrap();
    write_source(temp.path(), "a-part.json", "{\"Pod\": \"Pod\"}");
    // Not UTF-8, so the reader fails
    std::fs::write(temp.path().join("b-part.json"), [0xff, 0xfe, 0xfd]).unwrap();
    // Directories matching the pattern are not inputs
    std::fs::create_dir(temp.path().join("d-part.json")).unwrap();
    write_source(temp.path(), "c-part.json", "{\"Node\": \"Node\"}");

    let orchestrator = Orchestrator::new(toolbox(Arc::new(EchoTranslator::new())));
    let report = orchestrator
        .run_batch(
            &translate_pipeline(),
            temp.path(),
            "*-part.json",
            &options(3),
            None,
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.runs.len(), 3);

    let failed: Vec<&PathBuf> = report.failed().map(|(path, _)| path).collect();
    assert_eq!(failed, vec![&temp.path().join("b-part.json")]);
    assert!(report.merged.is_none());
    assert!(temp.path().join("a-part.json-fanyi.json").exists());
    assert!(!temp.path().join("b-part.json-fanyi.json").exists());
    assert!(temp.path().join("c-part.json-fanyi.json").exists());
}
