//! Transcription backends: one page image + prompt → page text.
//!
//! The orchestrator only knows the [`PageTranscriber`] capability and only
//! distinguishes "text" from "failed with a message". Which provider sits
//! behind it is decided once per run from configuration:
//!
//! ```text
//! EffectiveConfig ──▶ Backend::{OpenAi, Gemini} ──▶ TranscriberFactory ──▶ Arc<dyn PageTranscriber>
//! ```
//!
//! [`VisionTranscriber`] is the production implementation. It shapes the
//! request per provider, then sends it through `edgequake-llm`, which owns
//! the wire formats. Any transport, auth, rate-limit or parse failure comes
//! back as a [`TranscriptionError::Provider`] carrying only its message.

use crate::config::{EffectiveConfig, Settings};
use crate::error::{PagewiseError, TranscriptionError};
use crate::pipeline::encode::{PageImage, PNG_MIME};
use crate::prompts::OPENAI_USER_INSTRUCTION;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Supported vision providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    OpenAi,
    Gemini,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::OpenAi, Backend::Gemini];

    /// Configuration key, also the `edgequake-llm` provider name.
    pub fn key(self) -> &'static str {
        match self {
            Backend::OpenAi => "openai",
            Backend::Gemini => "gemini",
        }
    }

    /// Arrange prompt and page image in this provider's request shape.
    ///
    /// * OpenAI: the prompt is the system message; the user turn carries a
    ///   fixed instruction plus the image at `detail: high`.
    /// * Gemini: a single user turn with the prompt and the image.
    pub fn build_messages(self, prompt: &str, image: &PageImage) -> Vec<ChatMessage> {
        let data = ImageData::new(image.base64_png.clone(), PNG_MIME);
        match self {
            Backend::OpenAi => vec![
                ChatMessage::system(prompt),
                ChatMessage::user_with_images(OPENAI_USER_INSTRUCTION, vec![data.with_detail("high")]),
            ],
            Backend::Gemini => vec![ChatMessage::user_with_images(prompt, vec![data])],
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Backend {
    type Err = PagewiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        Backend::ALL
            .into_iter()
            .find(|b| b.key() == key)
            .ok_or(PagewiseError::UnknownBackend(key))
    }
}

/// Transcribe one page image.
///
/// The model is bound when the transcriber is built, so one instance serves
/// exactly one `(backend, model)` pair for a whole run.
#[async_trait]
pub trait PageTranscriber: Send + Sync {
    async fn transcribe_page(
        &self,
        image: &PageImage,
        prompt: &str,
    ) -> Result<String, TranscriptionError>;
}

/// Builds the transcriber for a run from its effective configuration.
///
/// The seam that lets the job manager run against scripted backends.
pub trait TranscriberFactory: Send + Sync {
    fn build(
        &self,
        backend: Backend,
        config: &EffectiveConfig,
    ) -> Result<Arc<dyn PageTranscriber>, PagewiseError>;
}

/// Knobs forwarded to every provider call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl CallOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            max_retries: settings.max_retries,
            retry_backoff_ms: settings.retry_backoff_ms,
        }
    }

    fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..Default::default()
        }
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// [`PageTranscriber`] backed by an `edgequake-llm` provider.
pub struct VisionTranscriber {
    backend: Backend,
    model: String,
    provider: Arc<dyn LLMProvider>,
    options: CallOptions,
}

impl VisionTranscriber {
    pub fn new(
        backend: Backend,
        model: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        options: CallOptions,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            provider,
            options,
        }
    }

    /// Create the provider for `backend` + `model`; API keys come from the
    /// provider's usual environment variables (`OPENAI_API_KEY`, `GEMINI_API_KEY`).
    pub fn connect(
        backend: Backend,
        model: &str,
        options: CallOptions,
    ) -> Result<Self, PagewiseError> {
        let provider = ProviderFactory::create_llm_provider(backend.key(), model).map_err(|e| {
            PagewiseError::ProviderNotConfigured {
                provider: backend.key().to_string(),
                hint: format!("{e}"),
            }
        })?;
        Ok(Self::new(backend, model, provider, options))
    }
}

#[async_trait]
impl PageTranscriber for VisionTranscriber {
    async fn transcribe_page(
        &self,
        image: &PageImage,
        prompt: &str,
    ) -> Result<String, TranscriptionError> {
        let start = Instant::now();
        let messages = self.backend.build_messages(prompt, image);
        let options = self.options.completion_options();
        let page_num = image.page_num();

        let mut last_err = String::new();
        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                let delay = self.options.backoff(attempt);
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    page_num,
                    attempt,
                    self.options.max_retries,
                    delay.as_millis()
                );
                sleep(delay).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Page {} via {}/{}: {} input tokens, {} output tokens, {:?}",
                        page_num,
                        self.backend,
                        self.model,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!("Page {}: attempt {} failed: {}", page_num, attempt + 1, last_err);
                }
            }
        }

        if last_err.is_empty() {
            last_err = "provider call failed".to_string();
        }
        Err(TranscriptionError::Provider(last_err))
    }
}

/// Production [`TranscriberFactory`]: one [`VisionTranscriber`] per run.
#[derive(Debug, Clone, Default)]
pub struct VisionTranscriberFactory {
    options: CallOptions,
}

impl VisionTranscriberFactory {
    pub fn new(options: CallOptions) -> Self {
        Self { options }
    }
}

impl TranscriberFactory for VisionTranscriberFactory {
    fn build(
        &self,
        backend: Backend,
        config: &EffectiveConfig,
    ) -> Result<Arc<dyn PageTranscriber>, PagewiseError> {
        let transcriber = VisionTranscriber::connect(backend, config.model(), self.options.clone())?;
        Ok(Arc::new(transcriber))
    }
}
