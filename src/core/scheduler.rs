//! Round-based pipeline scheduler.
//!
//! The scheduler owns the hired stages and the artifact log. Each round it
//! activates, in hiring order, every stage triggered by an artifact
//! appended during the previous round (round 1 looks at the seed). Results
//! are appended as soon as a stage returns, so later stages of the same
//! round see them in their context; triggers for the next round are
//! computed from everything appended during this one.
//!
//! ```text
//! Idle -> Running{1} -> ... -> Completed | Exhausted | Failed | Cancelled
//! ```

use std::collections::BTreeSet;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cancel::CancelHandle;
use super::journal::{hash_content, Journal};
use super::limits::{LimitViolation, RunLimits, RunTracker};
use super::log::ArtifactLog;
use super::stage::{Stage, StageError};
use crate::adapters::OperationError;
use crate::domain::{Artifact, ArtifactDraft, ArtifactKind, EntryKind, ExhaustReason, JournalEntry, RunState};

/// Terminal state and log of a finished run
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub state: RunState,

    /// Rounds that activated at least one stage
    pub rounds: u32,

    /// The full artifact log, in append order
    pub artifacts: Vec<Artifact>,

    /// Originating error of a `Failed` run
    pub error: Option<StageError>,

    pub cost_usd: f64,
    pub tokens_used: u64,

    /// Stage activations that appended an artifact
    pub activations: u32,
    pub output_bytes: u64,
}

impl RunOutcome {
    /// The last appended artifact, usually the run's result
    pub fn last_artifact(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }

    /// Completed and budget-exhausted runs both count as success
    pub fn is_success(&self) -> bool {
        matches!(self.state, RunState::Completed | RunState::Exhausted { .. })
    }
}

/// Drives one pipeline run; not reentrant
pub struct Scheduler {
    run_id: Uuid,
    pipeline_name: String,
    stages: Vec<Stage>,
    log: ArtifactLog,
    limits: RunLimits,
    tracker: RunTracker,
    journal: Option<Journal>,
    state: RunState,
    started: bool,
}

impl Scheduler {
    pub fn new(pipeline_name: impl Into<String>, limits: RunLimits) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            stages: Vec::new(),
            log: ArtifactLog::new(),
            limits,
            tracker: RunTracker::new(),
            journal: None,
            state: RunState::Idle,
            started: false,
        }
    }

    /// Mirror every append into `journal`; the run takes the journal's ID
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.run_id = journal.run_id();
        self.journal = Some(journal);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn log(&self) -> &ArtifactLog {
        &self.log
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Register a stage; hiring order is activation order
    pub fn hire(&mut self, stage: Stage) -> Result<(), StageError> {
        if self.started {
            return Err(StageError::AlreadyStarted);
        }
        if self.stages.iter().any(|s| s.name() == stage.name()) {
            return Err(StageError::DuplicateStage {
                stage: stage.name().to_string(),
            });
        }
        stage.validate()?;

        debug!(stage = stage.name(), output_kind = %stage.output_kind(), "Hired stage");
        self.stages.push(stage);
        Ok(())
    }

    pub fn hire_all(&mut self, stages: impl IntoIterator<Item = Stage>) -> Result<(), StageError> {
        stages.into_iter().try_for_each(|stage| self.hire(stage))
    }

    /// Append the external request that starts the run
    pub async fn seed(&mut self, request: impl Into<String>) -> u64 {
        self.start().await;
        self.append(ArtifactDraft::request(request), 0).await
    }

    async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.warn_unreachable_triggers();

        let entry = JournalEntry::new(self.run_id, EntryKind::RunStarted, self.pipeline_name.clone());
        self.record(entry).await;
    }

    /// Trigger kinds that neither the seed nor any hired stage can produce
    fn warn_unreachable_triggers(&self) {
        let producible: BTreeSet<ArtifactKind> = self
            .stages
            .iter()
            .map(|s| s.output_kind().clone())
            .chain(std::iter::once(ArtifactKind::request()))
            .collect();

        for stage in &self.stages {
            for kind in stage.triggers().difference(&producible) {
                warn!(stage = stage.name(), kind = %kind, "Trigger kind is never produced");
            }
        }
    }

    async fn append(&mut self, draft: ArtifactDraft, round: u32) -> u64 {
        let seq = self.log.append(draft);

        if let Some(artifact) = self.log.get(seq as usize).cloned() {
            debug!(seq, producer = %artifact.producer, kind = %artifact.kind, "Appended artifact");
            let digest = hash_content(&artifact.content);
            let entry = JournalEntry::new(
                self.run_id,
                EntryKind::ArtifactAppended,
                format!("{} appended {}", artifact.producer, artifact.kind),
            )
            .with_round(round)
            .with_artifact(artifact, digest);
            self.record(entry).await;
        }
        seq
    }

    async fn record(&self, entry: JournalEntry) {
        if let Some(ref journal) = self.journal {
            if let Err(e) = journal.append(&entry).await {
                warn!(error = %e, path = %journal.path().display(), "Failed to write journal entry");
            }
        }
    }

    /// True if any hired stage is triggered by artifacts at or after `since`
    fn any_triggered(&self, since: usize) -> bool {
        self.stages.iter().any(|s| s.is_triggered(&self.log, since))
    }

    /// Run up to `n_round` rounds
    ///
    /// After the last permitted round an idle check decides between
    /// `Completed` (nothing would trigger) and `Exhausted`; it never
    /// activates a stage. With `n_round == 0` only that check runs, so a
    /// seed that triggers nobody ends `Completed`.
    #[instrument(skip(self, cancel), fields(run_id = %self.run_id, pipeline = %self.pipeline_name))]
    pub async fn run(mut self, n_round: u32, cancel: &CancelHandle) -> RunOutcome {
        self.start().await;
        info!(stages = self.stages.len(), n_round, "Starting run");

        let mut since = 0usize;
        let mut rounds = 0u32;

        for round in 1..=n_round {
            if cancel.is_cancelled() {
                return self.cancelled(rounds).await;
            }

            let activated: Vec<usize> = (0..self.stages.len())
                .filter(|&i| self.stages[i].is_triggered(&self.log, since))
                .collect();

            if activated.is_empty() {
                info!(round, "Idle round");
                return self.finish(RunState::Completed, rounds, None).await;
            }

            self.state = RunState::Running { round };
            let round_start = self.log.len();
            debug!(round, since, activated = activated.len(), "Round started");

            for index in activated {
                if cancel.is_cancelled() {
                    return self.cancelled(rounds).await;
                }

                if let Err(LimitViolation::Budget { spent_usd, limit_usd }) = self.limits.check_budget(&self.tracker) {
                    warn!(spent_usd, limit_usd, "Cost budget exhausted");
                    let reason = ExhaustReason::Budget { spent_usd, limit_usd };
                    return self.finish(RunState::Exhausted { reason }, rounds, None).await;
                }

                let stage = &self.stages[index];
                let name = stage.name().to_string();
                info!(round, stage = %name, "Activating stage");

                let result = stage.activate(&self.log).await.and_then(|activation| {
                    self.limits
                        .validate_output(&activation.draft.content)
                        .map(|_| activation)
                        .map_err(|violation| StageError::Operation {
                            stage: name.clone(),
                            source: OperationError::Limit(violation),
                        })
                });

                match result {
                    Ok(activation) => {
                        self.tracker.record_activation(
                            activation.draft.content.len() as u64,
                            activation.tokens_used,
                            activation.cost_usd,
                        );
                        self.append(activation.draft, round).await;
                    }
                    Err(e) => {
                        error!(round, stage = %name, error = %e, "Stage failed");
                        let state = RunState::Failed {
                            stage: name,
                            error: e.to_string(),
                            last_index: self.log.last_index(),
                        };
                        return self.finish(state, rounds, Some(e)).await;
                    }
                }
            }

            rounds = round;
            let entry = JournalEntry::new(
                self.run_id,
                EntryKind::RoundCompleted,
                format!("Round {} appended {} artifact(s)", round, self.log.len() - round_start),
            )
            .with_round(round);
            self.record(entry).await;

            since = round_start;
        }

        let state = if self.any_triggered(since) {
            info!(n_round, "Round budget exhausted");
            RunState::Exhausted {
                reason: ExhaustReason::Rounds { limit: n_round },
            }
        } else {
            RunState::Completed
        };
        self.finish(state, rounds, None).await
    }

    async fn cancelled(self, rounds: u32) -> RunOutcome {
        info!("Run cancelled");
        let state = RunState::Cancelled {
            last_index: self.log.last_index(),
        };
        self.finish(state, rounds, None).await
    }

    async fn finish(self, state: RunState, rounds: u32, error: Option<StageError>) -> RunOutcome {
        info!(
            state = state.label(),
            rounds,
            artifacts = self.log.len(),
            activations = self.tracker.activations,
            output_bytes = self.tracker.output_bytes,
            cost_usd = self.tracker.cost_usd,
            elapsed_s = self.tracker.elapsed_seconds(),
            "Run finished"
        );

        let entry = JournalEntry::new(
            self.run_id,
            EntryKind::RunFinished,
            format!("Run {} after {} round(s)", state.label(), rounds),
        )
        .with_state(state.clone());
        self.record(entry).await;

        RunOutcome {
            run_id: self.run_id,
            state,
            rounds,
            artifacts: self.log.into_artifacts(),
            error,
            cost_usd: self.tracker.cost_usd,
            tokens_used: self.tracker.tokens_used,
            activations: self.tracker.activations,
            output_bytes: self.tracker.output_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterOutput, Operation, OperationInput};
    use crate::core::stage::ContextRule;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Returns a fixed text, optionally reporting a cost
    struct Fixed {
        text: &'static str,
        cost: Option<f64>,
    }

    #[async_trait]
    impl Operation for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn invoke(&self, _input: &OperationInput) -> Result<AdapterOutput, OperationError> {
            Ok(AdapterOutput {
                content: self.text.to_string(),
                tokens_used: None,
                cost_usd: self.cost,
            })
        }
    }

    fn fixed(name: &str, trigger: &str, output: &'static str) -> Stage {
        Stage::new(name, Arc::new(Fixed { text: output, cost: None }), output)
            .triggered_by(trigger)
            .context(ContextRule::most_recent())
    }

    #[tokio::test]
    async fn test_hire_rejects_duplicates() {
        let mut scheduler = Scheduler::new("t", RunLimits::default());
        scheduler.hire(fixed("a", "request", "x")).unwrap();

        assert!(matches!(
            scheduler.hire(fixed("a", "x", "y")),
            Err(StageError::DuplicateStage { .. })
        ));
    }

    #[tokio::test]
    async fn test_hire_after_start_is_rejected() {
        let mut scheduler = Scheduler::new("t", RunLimits::default());
        scheduler.hire(fixed("a", "request", "x")).unwrap();
        scheduler.seed("go").await;

        assert_eq!(scheduler.state(), &RunState::Idle);
        assert_eq!(scheduler.log().len(), 1);
        assert_eq!(scheduler.log().last().unwrap().kind, ArtifactKind::request());

        assert!(matches!(
            scheduler.hire(fixed("b", "x", "y")),
            Err(StageError::AlreadyStarted)
        ));
        assert_eq!(scheduler.stages().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_completes() {
        let mut scheduler = Scheduler::new("t", RunLimits::default());
        scheduler
            .hire_all([fixed("a", "request", "x"), fixed("b", "x", "y")])
            .unwrap();
        scheduler.seed("go").await;

        let outcome = scheduler.run(5, &CancelHandle::new()).await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.artifacts.len(), 3);
        assert_eq!(outcome.last_artifact().unwrap().kind.as_str(), "y");
        assert_eq!(outcome.activations, 2);
        assert_eq!(outcome.output_bytes, 2);
    }

    #[tokio::test]
    async fn test_same_round_stages_see_earlier_appends() {
        // Both stages trigger on the seed; "second" reads what "first" appended
        let mut scheduler = Scheduler::new("t", RunLimits::default());
        scheduler
            .hire_all([
                fixed("first", "request", "x"),
                Stage::new("second", Arc::new(Fixed { text: "y", cost: None }), "y")
                    .triggered_by("request")
                    .context(ContextRule::most_recent_of(["x"])),
            ])
            .unwrap();
        scheduler.seed("go").await;

        let outcome = scheduler.run(1, &CancelHandle::new()).await;

        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.artifacts.len(), 3);
        assert!(outcome.artifacts[1].producer.is_stage("first"));
        assert!(outcome.artifacts[2].producer.is_stage("second"));
    }

    #[tokio::test]
    async fn test_budget_stops_before_activation() {
        let limits = RunLimits {
            max_cost_usd: 1.0,
            ..Default::default()
        };
        let mut scheduler = Scheduler::new("t", limits);
        scheduler
            .hire_all([
                Stage::new("a", Arc::new(Fixed { text: "x", cost: Some(1.5) }), "x")
                    .triggered_by("request")
                    .context(ContextRule::seed()),
                fixed("b", "x", "y"),
            ])
            .unwrap();
        scheduler.seed("go").await;

        let outcome = scheduler.run(5, &CancelHandle::new()).await;

        assert!(matches!(
            outcome.state,
            RunState::Exhausted {
                reason: ExhaustReason::Budget { .. }
            }
        ));
        assert_eq!(outcome.artifacts.len(), 2);
        assert_eq!(outcome.cost_usd, 1.5);
    }

    #[tokio::test]
    async fn test_output_limit_fails_run() {
        let limits = RunLimits {
            max_output_bytes: 1,
            ..Default::default()
        };
        let mut scheduler = Scheduler::new("t", limits);
        scheduler.hire(fixed("a", "request", "too-long")).unwrap();
        scheduler.seed("go").await;

        let outcome = scheduler.run(3, &CancelHandle::new()).await;

        assert!(matches!(outcome.state, RunState::Failed { ref stage, last_index: Some(0), .. } if stage == "a"));
        assert!(matches!(
            outcome.error,
            Some(StageError::Operation {
                source: OperationError::Limit(LimitViolation::MaxOutputBytes { .. }),
                ..
            })
        ));
        assert_eq!(outcome.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_fixed_index_beyond_log_fails_run() {
        let mut scheduler = Scheduler::new("t", RunLimits::default());
        scheduler
            .hire(
                Stage::new("a", Arc::new(Fixed { text: "x", cost: None }), "x")
                    .triggered_by("request")
                    .context(ContextRule::fixed_index(5)),
            )
            .unwrap();
        scheduler.seed("go").await;

        let outcome = scheduler.run(3, &CancelHandle::new()).await;

        match outcome.state {
            RunState::Failed {
                ref stage,
                ref error,
                last_index,
            } => {
                assert_eq!(stage, "a");
                assert!(error.contains("index 5 is beyond log length 1"));
                assert_eq!(last_index, Some(0));
            }
            ref other => panic!("Expected Failed, got {other:?}"),
        }
        assert!(matches!(
            outcome.error,
            Some(StageError::ContextUnavailable { ref stage, .. }) if stage == "a"
        ));
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.rounds, 0);
        assert_eq!(outcome.activations, 0);
    }

    #[tokio::test]
    async fn test_empty_since_last_own_output_fails_run() {
        // Nothing of kind "review" is ever appended
        let mut scheduler = Scheduler::new("t", RunLimits::default());
        scheduler
            .hire(
                Stage::new("a", Arc::new(Fixed { text: "x", cost: None }), "x")
                    .triggered_by("request")
                    .context(ContextRule::since_last_own_output(["review"])),
            )
            .unwrap();
        scheduler.seed("go").await;

        let outcome = scheduler.run(3, &CancelHandle::new()).await;

        assert!(matches!(
            outcome.state,
            RunState::Failed { ref stage, last_index: Some(0), .. } if stage == "a"
        ));
        assert!(matches!(outcome.error, Some(StageError::ContextUnavailable { .. })));
        assert_eq!(outcome.artifacts.len(), 1);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_zero_rounds_with_dormant_seed_completes() {
        let mut scheduler = Scheduler::new("t", RunLimits::default());
        scheduler.hire(fixed("a", "x", "y")).unwrap();
        scheduler.seed("go").await;

        let outcome = scheduler.run(0, &CancelHandle::new()).await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.rounds, 0);
        assert_eq!(outcome.artifacts.len(), 1);
    }
}
