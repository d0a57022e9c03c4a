//! Multi-model consensus: fan one logical operation out to every configured
//! model, then reconcile the answers into a single authoritative response.
//!
//! ```text
//!   models[0] ──call──┐
//!   models[1] ──call──┼── join_all ──► successes (by dispatch sequence)
//!   models[n] ──call──┘                   │
//!                                         ├── select (primary-first | majority)
//!                                         └── group by stringified output
//!                                               └── >1 group ──► DivergenceSink (spawned)
//! ```
//!
//! Every call is tagged with its dispatch sequence number before it starts.
//! Selection only ever looks at those numbers and the stringified outputs,
//! so the chosen answer does not depend on which provider replied first.
//!
//! Rate limiting is the caller's job: wrap `call` with a pool permit for
//! providers that have a quota.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::diff::{diff_summary, DiffSummary};
use crate::divergence::{
    DivergenceRecord, DivergenceSink, ModelOutput, NullDivergenceSink, ResponseGroup,
};
use crate::errors::{CoordinationError, CoordinationResult, ModelFailure};

/// A model participating in an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(default)]
    pub is_primary: bool,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_primary: false,
        }
    }

    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_primary: true,
        }
    }
}

/// How the authoritative answer is chosen when the primary is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Primary if it succeeded, otherwise the lowest-sequence success.
    PrimaryFirst,
    /// Primary if it succeeded, otherwise the largest group (first-seen on ties).
    Majority,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimaryFirst => write!(f, "primary_first"),
            Self::Majority => write!(f, "majority"),
        }
    }
}

/// Result of one consensus round.
#[derive(Debug, Clone)]
pub struct ConsensusOutcome<T> {
    /// The authoritative response.
    pub response: T,
    /// Model that produced `response`.
    pub model_name: String,
    pub strategy: SelectionStrategy,
    /// A primary was configured but failed.
    pub fallback_used: bool,
    /// Largest group holds strictly more than half of the successes.
    pub strict_majority: bool,
    /// Stringified successes in dispatch order.
    pub successes: Vec<ModelOutput>,
    pub failures: Vec<ModelFailure>,
    pub groups: Vec<ResponseGroup>,
    pub warnings: Vec<String>,
    /// Present when the successes disagreed; also handed to the sink.
    pub divergence: Option<DivergenceRecord>,
}

impl<T> ConsensusOutcome<T> {
    pub fn diverged(&self) -> bool {
        self.divergence.is_some()
    }
}

/// Stringifier for text responses.
pub fn as_text<T: AsRef<str>>(value: &T) -> String {
    value.as_ref().to_string()
}

struct Settled<T> {
    sequence: usize,
    model_name: String,
    value: T,
}

/// Fans operations out to several models and reconciles their answers.
#[derive(Clone)]
pub struct ConsensusInvoker {
    sink: Arc<dyn DivergenceSink>,
}

impl fmt::Debug for ConsensusInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusInvoker").finish_non_exhaustive()
    }
}

impl Default for ConsensusInvoker {
    fn default() -> Self {
        Self::new(Arc::new(NullDivergenceSink))
    }
}

impl ConsensusInvoker {
    pub fn new(sink: Arc<dyn DivergenceSink>) -> Self {
        Self { sink }
    }

    /// Primary-first consensus.
    ///
    /// Returns the primary's response when it succeeds, otherwise the
    /// success with the lowest dispatch sequence (recording a warning when a
    /// primary was configured). Fails only when every model failed.
    pub async fn invoke<T, F, Fut, E, S>(
        &self,
        operation: &str,
        input: &str,
        models: &[ModelDescriptor],
        call: F,
        stringify: S,
    ) -> CoordinationResult<ConsensusOutcome<T>>
    where
        F: Fn(&ModelDescriptor) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        S: Fn(&T) -> String,
    {
        self.run(
            SelectionStrategy::PrimaryFirst,
            operation,
            input,
            models,
            call,
            stringify,
        )
        .await
    }

    /// Majority consensus.
    ///
    /// Without a successful primary the largest group of identical outputs
    /// wins, ties going to the group seen first. Divergence is recorded when
    /// more than one group exists or no group reaches a strict majority.
    pub async fn call_with_consensus<T, F, Fut, E, S>(
        &self,
        operation: &str,
        input: &str,
        models: &[ModelDescriptor],
        call: F,
        stringify: S,
    ) -> CoordinationResult<ConsensusOutcome<T>>
    where
        F: Fn(&ModelDescriptor) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        S: Fn(&T) -> String,
    {
        self.run(
            SelectionStrategy::Majority,
            operation,
            input,
            models,
            call,
            stringify,
        )
        .await
    }

    async fn run<T, F, Fut, E, S>(
        &self,
        strategy: SelectionStrategy,
        operation: &str,
        input: &str,
        models: &[ModelDescriptor],
        call: F,
        stringify: S,
    ) -> CoordinationResult<ConsensusOutcome<T>>
    where
        F: Fn(&ModelDescriptor) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        S: Fn(&T) -> String,
    {
        if models.is_empty() {
            return Err(CoordinationError::NoModelsConfigured {
                operation: operation.to_string(),
            });
        }

        let primary = primary_index(models);
        if models.iter().filter(|m| m.is_primary).count() > 1 {
            warn!(operation, "multiple primary models configured; using the first");
        }

        debug!(
            operation,
            %strategy,
            models = models.len(),
            primary = primary.map(|i| models[i].name.as_str()).unwrap_or("-"),
            "Dispatching consensus round"
        );

        let calls = models.iter().enumerate().map(|(sequence, model)| {
            let pending = call(model);
            async move { (sequence, pending.await) }
        });
        let settled = join_all(calls).await;

        let mut successes: Vec<Settled<T>> = Vec::new();
        let mut failures: Vec<ModelFailure> = Vec::new();
        for (sequence, result) in settled {
            let model_name = models[sequence].name.clone();
            match result {
                Ok(value) => successes.push(Settled {
                    sequence,
                    model_name,
                    value,
                }),
                Err(e) => {
                    warn!(operation, model = %model_name, error = %e, "Model call failed");
                    failures.push(ModelFailure {
                        model_name,
                        message: e.to_string(),
                        sequence,
                    });
                }
            }
        }
        successes.sort_by_key(|s| s.sequence);

        if successes.is_empty() {
            error!(operation, failures = failures.len(), "All models failed");
            return Err(CoordinationError::AllModelsFailed {
                operation: operation.to_string(),
                failures,
            });
        }

        let outputs: Vec<ModelOutput> = successes
            .iter()
            .map(|s| ModelOutput {
                model_name: s.model_name.clone(),
                output: stringify(&s.value),
            })
            .collect();
        let sequences: Vec<usize> = successes.iter().map(|s| s.sequence).collect();
        let groups = group_outputs(&sequences, &outputs);

        let largest = largest_group(&groups);
        let strict_majority = groups[largest].size() * 2 > successes.len();

        let mut warnings = Vec::new();
        let primary_pos = primary.and_then(|p| successes.iter().position(|s| s.sequence == p));
        let fallback_used = primary.is_some() && primary_pos.is_none();
        if let (Some(p), true) = (primary, fallback_used) {
            let msg = format!(
                "primary model {} failed for {operation}; using fallback",
                models[p].name
            );
            warn!(operation, primary = %models[p].name, "Primary model failed, falling back");
            warnings.push(msg);
        }

        let chosen = match (primary_pos, strategy) {
            (Some(pos), _) => pos,
            (None, SelectionStrategy::PrimaryFirst) => 0,
            (None, SelectionStrategy::Majority) => {
                let first = groups[largest].first_sequence;
                successes
                    .iter()
                    .position(|s| s.sequence == first)
                    .unwrap_or(0)
            }
        };

        if strategy == SelectionStrategy::Majority && !strict_majority {
            warnings.push(format!(
                "no strict majority for {operation}: largest group {} of {}",
                groups[largest].size(),
                successes.len()
            ));
        }

        let authoritative = &outputs[chosen];
        let first_dissent = if successes.len() >= 2 {
            dissent_summary(operation, authoritative, &groups)
        } else {
            None
        };

        let diverged = successes.len() >= 2
            && match strategy {
                SelectionStrategy::PrimaryFirst => groups.len() > 1,
                SelectionStrategy::Majority => groups.len() > 1 || !strict_majority,
            };

        let divergence = diverged.then(|| DivergenceRecord {
            id: Uuid::new_v4().to_string(),
            operation_type: operation.to_string(),
            input: input.to_string(),
            responses: outputs.clone(),
            groups: groups.clone(),
            authoritative_model: authoritative.model_name.clone(),
            diff_summary: first_dissent.unwrap_or_default(),
            strict_majority,
            recorded_at: Utc::now(),
        });
        if let Some(record) = &divergence {
            self.emit(record.clone());
        }

        info!(
            operation,
            %strategy,
            model = %authoritative.model_name,
            successes = successes.len(),
            failures = failures.len(),
            groups = groups.len(),
            fallback_used,
            "Consensus resolved"
        );

        let model_name = authoritative.model_name.clone();
        let chosen = successes.swap_remove(chosen);

        Ok(ConsensusOutcome {
            response: chosen.value,
            model_name,
            strategy,
            fallback_used,
            strict_majority,
            successes: outputs,
            failures,
            groups,
            warnings,
            divergence,
        })
    }

    /// Hand a record to the sink without waiting on it.
    fn emit(&self, record: DivergenceRecord) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.record(&record).await {
                warn!(
                    operation = %record.operation_type,
                    id = %record.id,
                    error = %e,
                    "Failed to record divergence"
                );
            }
        });
    }
}

fn primary_index(models: &[ModelDescriptor]) -> Option<usize> {
    models.iter().position(|m| m.is_primary)
}

/// Group outputs by exact text, in first-seen order.
fn group_outputs(sequences: &[usize], outputs: &[ModelOutput]) -> Vec<ResponseGroup> {
    let mut groups: Vec<ResponseGroup> = Vec::new();
    for (sequence, out) in sequences.iter().zip(outputs) {
        match groups.iter_mut().find(|g| g.output == out.output) {
            Some(group) => group.models.push(out.model_name.clone()),
            None => groups.push(ResponseGroup {
                output: out.output.clone(),
                models: vec![out.model_name.clone()],
                first_sequence: *sequence,
            }),
        }
    }
    groups
}

/// Index of the largest group; the earliest wins on equal size.
fn largest_group(groups: &[ResponseGroup]) -> usize {
    let mut best = 0;
    for (idx, group) in groups.iter().enumerate().skip(1) {
        if group.size() > groups[best].size() {
            best = idx;
        }
    }
    best
}

/// Diff the authoritative output against every other group; returns the
/// summary for the first dissenting group.
fn dissent_summary(
    operation: &str,
    authoritative: &ModelOutput,
    groups: &[ResponseGroup],
) -> Option<DiffSummary> {
    let mut first = None;
    for group in groups.iter().filter(|g| g.output != authoritative.output) {
        let summary = diff_summary(&authoritative.output, &group.output);
        debug!(
            operation,
            authoritative = %authoritative.model_name,
            dissenting = %group.models.join(","),
            additions = summary.additions,
            deletions = summary.deletions,
            "Model outputs differ"
        );
        first.get_or_insert(summary);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<DivergenceRecord>);

    #[async_trait]
    impl DivergenceSink for ChannelSink {
        async fn record(&self, record: &DivergenceRecord) -> CoordinationResult<()> {
            let _ = self.0.send(record.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl DivergenceSink for FailingSink {
        async fn record(&self, _record: &DivergenceRecord) -> CoordinationResult<()> {
            Err(CoordinationError::Sink("disk full".into()))
        }
    }

    fn channel_invoker() -> (ConsensusInvoker, mpsc::UnboundedReceiver<DivergenceRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConsensusInvoker::new(Arc::new(ChannelSink(tx))), rx)
    }

    type Script = HashMap<&'static str, Result<&'static str, &'static str>>;

    fn scripted(
        script: &Script,
    ) -> impl Fn(&ModelDescriptor) -> futures::future::Ready<Result<String, String>> + '_ {
        move |model| {
            let result = script[model.name.as_str()]
                .map(str::to_string)
                .map_err(str::to_string);
            futures::future::ready(result)
        }
    }

    #[tokio::test]
    async fn fallback_to_first_success_when_primary_fails() {
        let (invoker, mut rx) = channel_invoker();
        let models = vec![
            ModelDescriptor::primary("A"),
            ModelDescriptor::new("B"),
            ModelDescriptor::new("C"),
        ];
        let script: Script = [("A", Err("timeout")), ("B", Ok("x")), ("C", Ok("y"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .invoke("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();

        assert_eq!(outcome.response, "x");
        assert_eq!(outcome.model_name, "B");
        assert!(outcome.fallback_used);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].model_name, "A");

        let record = rx.recv().await.expect("divergence record");
        assert_eq!(record.groups.len(), 2);
        assert_eq!(record.authoritative_model, "B");
        assert_eq!(record.diff_summary.additions, 1);
        assert_eq!(record.diff_summary.deletions, 1);
    }

    #[tokio::test]
    async fn primary_wins_even_in_the_minority() {
        let invoker = ConsensusInvoker::default();
        let models = vec![
            ModelDescriptor::new("m1"),
            ModelDescriptor::primary("m2"),
            ModelDescriptor::new("m3"),
        ];
        let script: Script = [("m1", Ok("q")), ("m2", Ok("p")), ("m3", Ok("q"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .invoke("example", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "p");
        assert!(!outcome.fallback_used);
        assert!(outcome.diverged());
    }

    #[tokio::test]
    async fn without_primary_first_success_is_used_silently() {
        let invoker = ConsensusInvoker::default();
        let models = vec![
            ModelDescriptor::new("A"),
            ModelDescriptor::new("B"),
            ModelDescriptor::new("C"),
        ];
        let script: Script = [("A", Err("500")), ("B", Ok("b")), ("C", Ok("c"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .invoke("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "b");
        assert!(!outcome.fallback_used);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn all_models_failing_is_a_hard_error() {
        let invoker = ConsensusInvoker::default();
        let models = vec![ModelDescriptor::primary("A"), ModelDescriptor::new("B")];
        let script: Script = [("A", Err("quota")), ("B", Err("timeout"))]
            .into_iter()
            .collect();

        let err = invoker
            .invoke("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "all models failed for definition");
        assert_eq!(err.model_failures().len(), 2);
    }

    #[tokio::test]
    async fn empty_model_list_is_rejected() {
        let invoker = ConsensusInvoker::default();
        let script: Script = HashMap::new();
        let err = invoker
            .invoke("definition", "word", &[], scripted(&script), as_text)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NoModelsConfigured { .. }));
    }

    #[tokio::test]
    async fn agreeing_models_produce_no_divergence() {
        let invoker = ConsensusInvoker::default();
        let models = vec![ModelDescriptor::new("m1"), ModelDescriptor::new("m2")];
        let script: Script = [("m1", Ok("same")), ("m2", Ok("same"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .call_with_consensus("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert!(!outcome.diverged());
        assert!(outcome.strict_majority);
        assert_eq!(outcome.groups.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_ignores_arrival_order() {
        let invoker = ConsensusInvoker::default();
        let models = vec![ModelDescriptor::new("slow"), ModelDescriptor::new("fast")];
        let call = |model: &ModelDescriptor| {
            let name = model.name.clone();
            async move {
                let delay = if name == "slow" { 30 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, String>(format!("from {name}"))
            }
        };

        for _ in 0..5 {
            let outcome = invoker
                .invoke("definition", "word", &models, call, as_text)
                .await
                .unwrap();
            assert_eq!(outcome.response, "from slow");
        }
    }

    #[tokio::test]
    async fn majority_picks_the_largest_group() {
        let (invoker, mut rx) = channel_invoker();
        let models = vec![
            ModelDescriptor::new("m1"),
            ModelDescriptor::new("m2"),
            ModelDescriptor::new("m3"),
        ];
        let script: Script = [("m1", Ok("A")), ("m2", Ok("A")), ("m3", Ok("B"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .call_with_consensus("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "A");
        assert!(outcome.strict_majority);

        let record = rx.recv().await.expect("divergence record");
        let groups: Vec<(&str, Vec<&str>)> = record
            .groups
            .iter()
            .map(|g| {
                (
                    g.output.as_str(),
                    g.models.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        assert_eq!(groups, vec![("A", vec!["m1", "m2"]), ("B", vec!["m3"])]);
    }

    #[tokio::test]
    async fn majority_tie_goes_to_first_seen_group() {
        let invoker = ConsensusInvoker::default();
        let models = vec![
            ModelDescriptor::new("m1"),
            ModelDescriptor::new("m2"),
            ModelDescriptor::new("m3"),
            ModelDescriptor::new("m4"),
        ];
        let script: Script = [("m1", Ok("B")), ("m2", Ok("A")), ("m3", Ok("A")), ("m4", Ok("B"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .call_with_consensus("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "B");
        assert_eq!(outcome.model_name, "m1");
        assert!(!outcome.strict_majority);
        assert!(outcome.diverged());
        assert!(outcome.warnings.iter().any(|w| w.contains("no strict majority")));
    }

    #[tokio::test]
    async fn majority_respects_a_successful_primary() {
        let invoker = ConsensusInvoker::default();
        let models = vec![
            ModelDescriptor::primary("m1"),
            ModelDescriptor::new("m2"),
            ModelDescriptor::new("m3"),
        ];
        let script: Script = [("m1", Ok("B")), ("m2", Ok("A")), ("m3", Ok("A"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .call_with_consensus("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "B");
        assert_eq!(outcome.divergence.unwrap().authoritative_model, "m1");
    }

    #[tokio::test]
    async fn majority_falls_back_to_largest_group_when_primary_fails() {
        let invoker = ConsensusInvoker::default();
        let models = vec![
            ModelDescriptor::primary("m1"),
            ModelDescriptor::new("m2"),
            ModelDescriptor::new("m3"),
            ModelDescriptor::new("m4"),
        ];
        let script: Script = [("m1", Err("down")), ("m2", Ok("X")), ("m3", Ok("Y")), ("m4", Ok("Y"))]
            .into_iter()
            .collect();

        let outcome = invoker
            .call_with_consensus("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "Y");
        assert_eq!(outcome.model_name, "m3");
        assert!(outcome.fallback_used);
    }

    #[tokio::test]
    async fn single_success_never_diverges() {
        let invoker = ConsensusInvoker::default();
        let models = vec![ModelDescriptor::new("m1"), ModelDescriptor::new("m2")];
        let script: Script = [("m1", Err("x")), ("m2", Ok("only"))].into_iter().collect();

        let outcome = invoker
            .call_with_consensus("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "only");
        assert!(!outcome.diverged());
    }

    #[tokio::test]
    async fn sink_failure_does_not_fail_the_round() {
        let invoker = ConsensusInvoker::new(Arc::new(FailingSink));
        let models = vec![ModelDescriptor::new("m1"), ModelDescriptor::new("m2")];
        let script: Script = [("m1", Ok("a")), ("m2", Ok("b"))].into_iter().collect();

        let outcome = invoker
            .invoke("definition", "word", &models, scripted(&script), as_text)
            .await
            .unwrap();
        assert_eq!(outcome.response, "a");
        assert!(outcome.diverged());
        tokio::task::yield_now().await;
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Card {
        term: String,
        score: u32,
    }

    #[tokio::test]
    async fn structured_responses_use_the_stringifier() {
        let invoker = ConsensusInvoker::default();
        let models = vec![ModelDescriptor::new("m1"), ModelDescriptor::new("m2")];
        let call = |model: &ModelDescriptor| {
            let score = if model.name == "m1" { 1 } else { 2 };
            futures::future::ready(Ok::<_, String>(Card {
                term: "cat".into(),
                score,
            }))
        };

        let outcome = invoker
            .invoke("card", "cat", &models, call, |c: &Card| c.term.clone())
            .await
            .unwrap();
        assert_eq!(outcome.response.score, 1);
        assert!(!outcome.diverged());
    }
}
