//! Generative text completion.
//!
//! A [`Completion`] renders its prompt template from the stage context,
//! hands the prompt to a [`CompletionBackend`] and optionally extracts a
//! fenced payload from the answer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::text::extract_fenced;
use super::{AdapterOutput, Operation, OperationError, OperationInput};

/// A model endpoint: one prompt in, one text out
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Complete a rendered prompt
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<AdapterOutput, OperationError>;

    /// Check that the backend is reachable
    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Slot(String),
}

/// Prompt text with `{slot}` placeholders
///
/// Braces that do not enclose an identifier (JSON samples, for instance)
/// are kept literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pieces: Vec<Piece>,
}

impl PromptTemplate {
    pub fn new(source: &str) -> Self {
        let mut pieces = Vec::new();
        let mut text = String::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            text.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            match after.find('}') {
                Some(close) if is_identifier(&after[..close]) => {
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    pieces.push(Piece::Slot(after[..close].to_string()));
                    rest = &after[close + 1..];
                }
                _ => {
                    text.push('{');
                    rest = after;
                }
            }
        }
        text.push_str(rest);
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }

        Self { pieces }
    }

    /// Placeholder names in order of first appearance
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for piece in &self.pieces {
            if let Piece::Slot(name) = piece {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Substitute every placeholder with the text of the slot of that name
    pub fn render(&self, input: &OperationInput) -> Result<String, OperationError> {
        let mut prompt = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => prompt.push_str(text),
                Piece::Slot(name) => prompt.push_str(&input.text(name)?),
            }
        }
        Ok(prompt)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Completion operation
pub struct Completion {
    template: PromptTemplate,
    backend: Arc<dyn CompletionBackend>,
    fence: Option<String>,
    timeout: Duration,
}

impl Completion {
    pub fn new(template: PromptTemplate, backend: Arc<dyn CompletionBackend>, timeout: Duration) -> Self {
        Self {
            template,
            backend,
            fence: None,
            timeout,
        }
    }

    /// Extract the payload of a "```<tag>" fenced block from every answer
    pub fn with_fence(mut self, tag: impl Into<String>) -> Self {
        self.fence = Some(tag.into());
        self
    }
}

#[async_trait]
impl Operation for Completion {
    fn name(&self) -> &str {
        "completion"
    }

    fn required_slots(&self) -> Vec<String> {
        self.template.placeholders()
    }

    async fn invoke(&self, input: &OperationInput) -> Result<AdapterOutput, OperationError> {
        let prompt = self.template.render(input)?;
        debug!(backend = self.backend.name(), prompt_bytes = prompt.len(), "Requesting completion");

        let mut output = self.backend.complete(&prompt, self.timeout).await?;
        if let Some(ref tag) = self.fence {
            output.content = extract_fenced(&output.content, tag);
        }
        Ok(output)
    }
}
