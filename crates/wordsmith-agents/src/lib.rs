//! Provider adapters and the vocabulary card pipeline.
//!
//! Builds on `wordsmith-coordination`: model calls are routed per provider
//! through rate-limited pools, reconciled by consensus, and run as batches.

pub mod cards;
pub mod config;
pub mod provider;

pub use cards::{parse_word_list, Card, CardGenerator, CardRun, ImageReference, WordItem};
pub use config::{AgentsConfig, ModelSpec, OperationModels, ProviderEndpoint};
pub use provider::{
    ImageGenerator, ModelInvoker, ModelRouter, OfflineInvoker, OpenAiCompatInvoker,
    OpenAiImageGenerator, Prompt, ProviderError, ThrottledInvoker,
};
