//! Vocabulary card pipeline.
//!
//! Phase one runs every word through three consensus stages:
//!
//! | Stage | Operation      | Selection     | Progress |
//! |-------|----------------|---------------|----------|
//! | 1     | `definition`   | majority      | 33       |
//! | 2     | `example`      | primary-first | 66       |
//! | 3     | `image_prompt` | primary-first | 100      |
//!
//! Phase two starts only after phase one has drained. It renders the image
//! prompts of every successful card, grouped by word, in a second and
//! independent batch run.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wordsmith_coordination::{
    as_text, group_by_owner, ArtifactBatch, BatchItem, BatchOrchestrator, BatchResult,
    BatchSettings, ConsensusInvoker, ConsensusOutcome, CoordinationResult, ModelDescriptor,
    ProgressReporter, RateLimitedPool, SelectionStrategy,
};

use crate::config::{ModelSpec, OperationModels};
use crate::provider::{ImageGenerator, ModelInvoker, Prompt, ProviderError};

const DEFINITION_SYSTEM: &str = "You are a lexicographer writing entries for language learners. \
Answer with a single plain sentence and nothing else.";
const EXAMPLE_SYSTEM: &str = "Write one natural example sentence that uses the given word. \
Answer with the sentence only.";
const IMAGE_PROMPT_SYSTEM: &str = "Describe a simple, memorable illustration for a vocabulary \
flashcard in one sentence. The image must not contain any text.";

/// A word to turn into a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordItem {
    pub id: String,
    pub term: String,
    /// Sentence the learner found the word in, if any.
    #[serde(default)]
    pub context: Option<String>,
}

impl WordItem {
    pub fn new(id: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            term: term.into(),
            context: None,
        }
    }
}

impl BatchItem for WordItem {
    fn item_id(&self) -> String {
        self.id.clone()
    }

    fn label(&self) -> String {
        self.term.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub word_id: String,
    pub term: String,
    pub definition: String,
    pub example: String,
    pub image_prompt: String,
    pub definition_model: String,
    /// Stages whose models disagreed.
    pub divergent_stages: Vec<String>,
    /// Stages answered by a fallback because the primary failed.
    pub fallback_stages: Vec<String>,
}

/// Side artifact handed from phase one to phase two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePrompt {
    pub word_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub word_id: String,
    pub prompt: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFailure {
    pub word_id: String,
    pub label: String,
    pub error: String,
}

/// Output of a full two-phase run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardRun {
    pub cards: Vec<Card>,
    pub failures: Vec<CardFailure>,
    pub images: Vec<ImageReference>,
    pub image_failures: Vec<CardFailure>,
    pub summary: BatchResult,
    pub image_summary: BatchResult,
}

/// Generates cards for a list of words.
pub struct CardGenerator {
    models: Arc<dyn ModelInvoker>,
    images: Arc<dyn ImageGenerator>,
    image_pool: Option<Arc<RateLimitedPool>>,
    consensus: ConsensusInvoker,
    operations: OperationModels,
    batch: BatchSettings,
    cancel: Option<CancellationToken>,
}

impl CardGenerator {
    pub fn new(
        models: Arc<dyn ModelInvoker>,
        images: Arc<dyn ImageGenerator>,
        consensus: ConsensusInvoker,
        operations: OperationModels,
        batch: BatchSettings,
    ) -> Self {
        Self {
            models,
            images,
            image_pool: None,
            consensus,
            operations,
            batch,
            cancel: None,
        }
    }

    /// Throttle image generation through `pool`.
    pub fn with_image_pool(mut self, pool: Arc<RateLimitedPool>) -> Self {
        self.image_pool = Some(pool);
        self
    }

    /// Stop claiming new words (and image batches) once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn orchestrator(&self, max_concurrency: usize) -> CoordinationResult<BatchOrchestrator> {
        let orchestrator = BatchOrchestrator::new(max_concurrency)?;
        Ok(match &self.cancel {
            Some(token) => orchestrator.with_cancellation(token.clone()),
            None => orchestrator,
        })
    }

    /// Run both phases. Fails only on invalid batch settings; per-word and
    /// per-image failures are reported in the returned [`CardRun`].
    pub async fn run(&self, words: Vec<WordItem>) -> CoordinationResult<CardRun> {
        info!(words = words.len(), "Generating cards");

        let cards_phase = self.orchestrator(self.batch.max_concurrency)?;
        let report = cards_phase
            .run(words.clone(), |word, _index, reporter| {
                self.build_card(word, reporter)
            })
            .await;

        let mut run = CardRun {
            summary: report.summary.clone(),
            ..CardRun::default()
        };
        let mut prompts = Vec::new();
        for (word, outcome) in words.iter().zip(report.outcomes) {
            match outcome {
                Ok((card, prompt)) => {
                    run.cards.push(card);
                    prompts.push(prompt);
                }
                Err(error) => run.failures.push(CardFailure {
                    word_id: word.id.clone(),
                    label: word.term.clone(),
                    error,
                }),
            }
        }

        let batches = group_by_owner(prompts, |p: &ImagePrompt| p.word_id.clone());
        let images_phase = self.orchestrator(self.batch.followup_concurrency)?;
        let image_report = images_phase
            .run(batches.clone(), |batch, _index, reporter| {
                self.render_images(batch, reporter)
            })
            .await;

        run.image_summary = image_report.summary.clone();
        for (batch, outcome) in batches.iter().zip(image_report.outcomes) {
            match outcome {
                Ok(references) => run.images.extend(references),
                Err(error) => run.image_failures.push(CardFailure {
                    word_id: batch.owner_id.clone(),
                    label: batch.label(),
                    error,
                }),
            }
        }

        info!(
            cards = run.cards.len(),
            failed = run.failures.len(),
            images = run.images.len(),
            image_failures = run.image_failures.len(),
            "Card generation finished"
        );
        Ok(run)
    }

    async fn build_card(
        &self,
        word: WordItem,
        reporter: ProgressReporter,
    ) -> CoordinationResult<(Card, ImagePrompt)> {
        let mut divergent_stages = Vec::new();
        let mut fallback_stages = Vec::new();
        let mut note = |operation: &str, outcome: &ConsensusOutcome<String>| {
            if outcome.diverged() {
                divergent_stages.push(operation.to_string());
            }
            if outcome.fallback_used {
                fallback_stages.push(operation.to_string());
            }
        };

        reporter.report(1, 0, "Generating definition");
        let context = word
            .context
            .as_deref()
            .map(|c| format!(" It was encountered in: \"{c}\""))
            .unwrap_or_default();
        let definition = self
            .ask(
                "definition",
                SelectionStrategy::Majority,
                &self.operations.definition,
                &word.term,
                Prompt::new(DEFINITION_SYSTEM, format!("Define \"{}\".{context}", word.term)),
            )
            .await?;
        note("definition", &definition);
        reporter.report(1, 33, "Definition ready");

        reporter.report(2, 33, "Generating example");
        let example = self
            .ask(
                "example",
                SelectionStrategy::PrimaryFirst,
                &self.operations.example,
                &word.term,
                Prompt::new(
                    EXAMPLE_SYSTEM,
                    format!("Word: {}\nDefinition: {}", word.term, definition.response),
                ),
            )
            .await?;
        note("example", &example);
        reporter.report(2, 66, "Example ready");

        reporter.report(3, 66, "Generating image prompt");
        let image_prompt = self
            .ask(
                "image_prompt",
                SelectionStrategy::PrimaryFirst,
                &self.operations.image_prompt,
                &word.term,
                Prompt::new(
                    IMAGE_PROMPT_SYSTEM,
                    format!(
                        "Word: {}\nDefinition: {}\nExample: {}",
                        word.term, definition.response, example.response
                    ),
                ),
            )
            .await?;
        note("image_prompt", &image_prompt);
        reporter.report(3, 100, "Image prompt ready");

        debug!(word = %word.term, divergent = divergent_stages.len(), "Card ready");
        let prompt = ImagePrompt {
            word_id: word.id.clone(),
            prompt: image_prompt.response.clone(),
        };
        let card = Card {
            word_id: word.id,
            term: word.term,
            definition: definition.response,
            example: example.response,
            image_prompt: image_prompt.response,
            definition_model: definition.model_name,
            divergent_stages,
            fallback_stages,
        };
        Ok((card, prompt))
    }

    async fn ask(
        &self,
        operation: &str,
        strategy: SelectionStrategy,
        specs: &[ModelSpec],
        input: &str,
        prompt: Prompt,
    ) -> CoordinationResult<ConsensusOutcome<String>> {
        let descriptors = OperationModels::descriptors(specs);
        let models = &self.models;
        let prompt = &prompt;
        let call = |model: &ModelDescriptor| {
            let name = model.name.clone();
            async move {
                models
                    .invoke(&name, prompt)
                    .await
                    .map(|text| text.trim().to_string())
            }
        };

        match strategy {
            SelectionStrategy::PrimaryFirst => {
                self.consensus
                    .invoke(operation, input, &descriptors, call, as_text)
                    .await
            }
            SelectionStrategy::Majority => {
                self.consensus
                    .call_with_consensus(operation, input, &descriptors, call, as_text)
                    .await
            }
        }
    }

    async fn render_images(
        &self,
        batch: ArtifactBatch<ImagePrompt>,
        reporter: ProgressReporter,
    ) -> Result<Vec<ImageReference>, ProviderError> {
        let total = batch.artifacts.len().max(1);
        let mut references = Vec::with_capacity(batch.artifacts.len());
        for (n, artifact) in batch.artifacts.into_iter().enumerate() {
            reporter.report(1, percent(n, total), format!("Rendering image {}", n + 1));
            let permit = match &self.image_pool {
                Some(pool) => Some(pool.acquire().await),
                None => None,
            };
            let reference = self.images.generate(&artifact.prompt).await;
            drop(permit);
            references.push(ImageReference {
                word_id: artifact.word_id,
                prompt: artifact.prompt,
                reference: reference?,
            });
        }
        Ok(references)
    }
}

fn percent(done: usize, total: usize) -> u8 {
    ((done * 100) / total).min(100) as u8
}

/// Parse a word list: either a JSON array of [`WordItem`] or plain text
/// with one term per line (blank lines and `#` comments skipped).
pub fn parse_word_list(raw: &str) -> Result<Vec<WordItem>> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("Failed to parse JSON word list");
    }

    let mut seen = HashSet::new();
    let mut words = Vec::new();
    for term in raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
    {
        let slug = term.to_lowercase().replace(char::is_whitespace, "-");
        let mut id = slug.clone();
        let mut n = 2;
        while !seen.insert(id.clone()) {
            id = format!("{slug}-{n}");
            n += 1;
        }
        words.push(WordItem::new(id, term));
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::OfflineInvoker;

    fn generator(offline: OfflineInvoker) -> CardGenerator {
        let offline = Arc::new(offline);
        CardGenerator::new(
            offline.clone(),
            offline,
            ConsensusInvoker::default(),
            OperationModels::default(),
            BatchSettings::default(),
        )
    }

    #[test]
    fn plain_word_list_gets_unique_ids() {
        let words = parse_word_list("# week 1\nserendipity\n\nice cream\nserendipity\n").unwrap();
        let ids: Vec<&str> = words.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["serendipity", "ice-cream", "serendipity-2"]);
        assert_eq!(words[1].term, "ice cream");
    }

    #[test]
    fn json_word_list() {
        let raw = r#"[{"id": "w1", "term": "lucid", "context": "a lucid dream"}]"#;
        let words = parse_word_list(raw).unwrap();
        assert_eq!(words[0].context.as_deref(), Some("a lucid dream"));
    }

    #[test]
    fn percent_is_bounded() {
        assert_eq!(percent(0, 3), 0);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(5, 3), 100);
    }

    #[tokio::test]
    async fn offline_run_builds_cards_and_images() {
        let words = vec![WordItem::new("w1", "lucid"), WordItem::new("w2", "brisk")];
        let run = generator(OfflineInvoker::new()).run(words).await.unwrap();

        assert_eq!(run.summary.succeeded, 2);
        assert_eq!(run.cards.len(), 2);
        assert!(run.cards.iter().all(|c| c.divergent_stages.is_empty()));
        assert_eq!(run.images.len(), 2);
        assert_eq!(run.image_summary.succeeded, 2);
        assert!(run.images[0].reference.starts_with("offline://images/"));
    }

    #[tokio::test]
    async fn definition_majority_overrules_a_dissenter() {
        let offline = OfflineInvoker::new().answering("gemini-2.0-flash", "something else");
        let run = generator(offline)
            .run(vec![WordItem::new("w1", "lucid")])
            .await
            .unwrap();

        let card = &run.cards[0];
        assert!(card.definition.starts_with("offline: Define \"lucid\""));
        assert_eq!(card.definition_model, "gpt-4o-mini");
        assert!(card.divergent_stages.contains(&"definition".to_string()));
    }

    #[tokio::test]
    async fn failed_primary_is_recorded_as_fallback() {
        let offline = OfflineInvoker::new().failing("gpt-4o-mini");
        let run = generator(offline)
            .run(vec![WordItem::new("w1", "lucid")])
            .await
            .unwrap();

        let card = &run.cards[0];
        assert_eq!(card.fallback_stages, vec!["example", "image_prompt"]);
    }

    #[tokio::test]
    async fn image_failures_do_not_drop_cards() {
        let offline = OfflineInvoker::new().failing("image");
        let run = generator(offline)
            .run(vec![WordItem::new("w1", "lucid")])
            .await
            .unwrap();

        assert_eq!(run.cards.len(), 1);
        assert!(run.images.is_empty());
        assert_eq!(run.image_failures.len(), 1);
        assert_eq!(run.image_failures[0].word_id, "w1");
    }
}
