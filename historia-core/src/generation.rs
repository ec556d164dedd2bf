//! Text generation: the backend seam and output parsing.
//!
//! The narrator only sees [`TextGenerator`]. [`GeminiGenerator`] is the
//! production implementation; tests use `testing::MockGenerator`.

use crate::prompt;
use crate::story::{Stage, Story, CHOICES_PER_PAUSE};
use crate::store::{StoreError, StoryStore};
use async_trait::async_trait;
use gemini::{Gemini, Request};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Options offered when the model asked for choices but gave fewer than three.
pub const FALLBACK_CHOICES: [&str; CHOICES_PER_PAUSE] = [
    "Investigar discretamente a próxima pista",
    "Confrontar diretamente o principal suspeito",
    "Recuar e preparar um plano mais seguro",
];

lazy_static! {
    static ref CHOICES_SECTION: Regex =
        Regex::new(r"(?i)\[(?:escolhas|choices)\]").expect("marker pattern is valid");
    static ref ENUMERATION: Regex =
        Regex::new(r"^(?:\d+\s*[).:]|[-*•])?\s*(.+)$").expect("enumeration pattern is valid");
}

/// Errors from a generation call.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Licença de Uso ausente. Configure a chave da API antes de gerar.")]
    MissingCredential,

    /// The remote call failed; carries the backend's own message.
    #[error("{0}")]
    Backend(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<gemini::Error> for GenerationError {
    fn from(err: gemini::Error) -> Self {
        match err {
            gemini::Error::NoApiKey => GenerationError::MissingCredential,
            other => GenerationError::Backend(other.user_message()),
        }
    }
}

/// Parsed output of one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub text: String,
    /// Present only when the output carried a choices section.
    pub choices: Option<[String; CHOICES_PER_PAUSE]>,
}

impl Generated {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            choices: None,
        }
    }

    pub fn with_choices(text: impl Into<String>, choices: [String; CHOICES_PER_PAUSE]) -> Self {
        Self {
            text: text.into(),
            choices: Some(choices),
        }
    }
}

/// Split raw model output into prose and (optionally) three options.
///
/// Without a choices marker there are no choices. With one, the first
/// three distinct non-empty lines after it are used, minus any leading
/// `1)`, `1.` or `-`; fewer than three yields [`FALLBACK_CHOICES`].
pub fn parse_output(raw: &str) -> Generated {
    let Some(marker) = CHOICES_SECTION.find(raw) else {
        return Generated::text(raw.trim());
    };

    let text = raw[..marker.start()].trim();
    let section = CHOICES_SECTION.replace_all(&raw[marker.end()..], "\n");

    let mut options: Vec<String> = Vec::with_capacity(CHOICES_PER_PAUSE);
    for line in section.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(captures) = ENUMERATION.captures(line) else {
            continue;
        };
        let option = captures[1].trim().trim_matches('*').trim();
        if option.is_empty() || options.iter().any(|o| o == option) {
            continue;
        }
        options.push(option.to_string());
        if options.len() == CHOICES_PER_PAUSE {
            break;
        }
    }

    match <[String; CHOICES_PER_PAUSE]>::try_from(options) {
        Ok(choices) => Generated::with_choices(text, choices),
        Err(partial) => {
            warn!(parsed = partial.len(), "too few choices in output, using fallback");
            Generated::with_choices(text, FALLBACK_CHOICES.map(str::to_string))
        }
    }
}

/// Produces story text. At most one call per story is in flight at a time.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate the segment that follows `stage` of the story's current chapter.
    async fn generate_segment(&self, story: &Story, stage: Stage)
        -> Result<Generated, GenerationError>;

    /// Resume the current text exactly where it stopped, without repeating it.
    async fn continue_generation(&self, story: &Story) -> Result<Generated, GenerationError>;
}

/// Sampling and context parameters for backend calls.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    /// Trailing characters of earlier text included in each prompt.
    pub context_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_p: 0.95,
            max_output_tokens: 1200,
            context_chars: 6000,
        }
    }
}

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_context_chars(mut self, chars: usize) -> Self {
        self.context_chars = chars;
        self
    }
}

/// Generator backed by the Gemini API.
///
/// Credential and model are read from the store on every call, so
/// settings changed at runtime apply to the next request.
pub struct GeminiGenerator<S> {
    store: Arc<S>,
    client: Gemini,
    config: GenerationConfig,
}

impl<S: StoryStore> GeminiGenerator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            client: Gemini::new(String::new()),
            config: GenerationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    async fn request(&self, story: &Story, prompt: String) -> Result<Generated, GenerationError> {
        let credential = self
            .store
            .credential()?
            .ok_or(GenerationError::MissingCredential)?;
        let model = self.store.model()?;

        debug!(
            story = %story.id(),
            model = %model,
            prompt_chars = prompt.chars().count(),
            "requesting generation"
        );

        let client = self.client.clone().with_api_key(credential).with_model(model);
        let request = Request::prompt(prompt)
            .with_temperature(self.config.temperature)
            .with_top_p(self.config.top_p)
            .with_max_output_tokens(self.config.max_output_tokens);

        let response = client.generate(request).await?;
        if response.hit_token_limit() {
            debug!(story = %story.id(), "output hit the token cap");
        }

        let generated = parse_output(&response.text);
        debug!(
            story = %story.id(),
            text_chars = generated.text.chars().count(),
            has_choices = generated.choices.is_some(),
            "parsed generation"
        );
        Ok(generated)
    }
}

#[async_trait]
impl<S: StoryStore> TextGenerator for GeminiGenerator<S> {
    async fn generate_segment(
        &self,
        story: &Story,
        stage: Stage,
    ) -> Result<Generated, GenerationError> {
        let prompt = prompt::segment_prompt(story, stage, self.config.context_chars);
        self.request(story, prompt).await
    }

    async fn continue_generation(&self, story: &Story) -> Result<Generated, GenerationError> {
        let prompt = prompt::continuation_prompt(story, self.config.context_chars);
        self.request(story, prompt).await
    }
}
