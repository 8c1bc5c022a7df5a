//! Configuration types for transcription runs.
//!
//! Two layers feed every run:
//!
//! 1. [`Settings`]: static configuration, built once by the host (CLI flags,
//!    environment) via [`SettingsBuilder`].
//! 2. [`SettingsOverride`]: a persisted record an operator can edit at
//!    runtime; non-empty fields take precedence over the static values.
//!
//! [`resolve_effective`] folds the two into an [`EffectiveConfig`]. It is
//! called once at the start of each run, so a run never observes a
//! half-applied settings change.

use crate::error::PagewiseError;
use crate::pipeline::transcribe::Backend;
use crate::prompts::DEFAULT_PROMPT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Static configuration for the job manager and its runs.
///
/// # Example
/// ```rust
/// use pagewise::Settings;
///
/// let settings = Settings::builder()
///     .backend("gemini")
///     .max_workers(8)
///     .max_pages(250)
///     .build()
///     .unwrap();
/// assert_eq!(settings.max_workers, 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Raw backend key, `"openai"` or `"gemini"`. Validated at dispatch time.
    pub backend: String,

    /// Model used when the backend is `openai`. Default: `gpt-4o-mini`.
    pub openai_model: String,

    /// Model used when the backend is `gemini`. Default: `gemini-2.0-flash`.
    pub gemini_model: String,

    /// Maximum concurrent provider calls within one run. Default: 4.
    pub max_workers: usize,

    /// Page-count safety ceiling; the resolved range is cut to its first
    /// `max_pages` pages. Default: 100.
    pub max_pages: usize,

    /// Prompt used when a job is created without one.
    pub default_prompt: String,

    /// Largest accepted source document in bytes. Default: 50 MiB.
    pub max_upload_bytes: usize,

    /// Longest edge of a rendered page in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Per-call timeout in seconds. `None` lets a call run indefinitely.
    pub call_timeout_secs: Option<u64>,

    /// Provider-level retries per call (exponential backoff). Default: 0.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds. Default: 500.
    pub retry_backoff_ms: u64,

    /// Sampling temperature forwarded to the provider, if set.
    pub temperature: Option<f32>,

    /// Output-token cap forwarded to the provider, if set.
    pub max_tokens: Option<usize>,

    /// Run [`crate::pipeline::postprocess::clean_markdown`] on page text. Default: false.
    pub clean_markdown: bool,

    /// Explicit pdfium shared library; otherwise `./` then the system library.
    pub pdfium_library: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: Backend::OpenAi.key().to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            max_workers: 4,
            max_pages: 100,
            default_prompt: DEFAULT_PROMPT.to_string(),
            max_upload_bytes: 50 * 1024 * 1024,
            max_rendered_pixels: 2000,
            password: None,
            call_timeout_secs: None,
            max_retries: 0,
            retry_backoff_ms: 500,
            temperature: None,
            max_tokens: None,
            clean_markdown: false,
            pdfium_library: None,
        }
    }
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder {
            settings: Self::default(),
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

/// Builder for [`Settings`].
#[derive(Debug)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn backend(mut self, key: impl Into<String>) -> Self {
        self.settings.backend = key.into();
        self
    }

    pub fn openai_model(mut self, model: impl Into<String>) -> Self {
        self.settings.openai_model = model.into();
        self
    }

    pub fn gemini_model(mut self, model: impl Into<String>) -> Self {
        self.settings.gemini_model = model.into();
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.settings.max_workers = n.max(1);
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.settings.max_pages = n;
        self
    }

    pub fn default_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.settings.default_prompt = prompt.into();
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.settings.max_upload_bytes = n;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.settings.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.settings.password = Some(pwd.into());
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.settings.call_timeout_secs = Some(secs);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.settings.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.settings.retry_backoff_ms = ms;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.settings.temperature = Some(t.clamp(0.0, 2.0));
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.settings.max_tokens = Some(n);
        self
    }

    pub fn clean_markdown(mut self, v: bool) -> Self {
        self.settings.clean_markdown = v;
        self
    }

    pub fn pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.pdfium_library = Some(path.into());
        self
    }

    /// Build the settings, validating constraints.
    ///
    /// The backend key is deliberately not validated here: an override record
    /// may replace it, so only the effective key is checked, at dispatch.
    pub fn build(self) -> Result<Settings, PagewiseError> {
        let s = &self.settings;
        if s.max_workers == 0 {
            return Err(PagewiseError::InvalidConfig(
                "max_workers must be ≥ 1".into(),
            ));
        }
        if s.max_pages == 0 {
            return Err(PagewiseError::InvalidConfig(
                "max_pages must be ≥ 1".into(),
            ));
        }
        if s.default_prompt.trim().is_empty() {
            return Err(PagewiseError::InvalidConfig(
                "default_prompt must not be empty".into(),
            ));
        }
        if s.call_timeout_secs == Some(0) {
            return Err(PagewiseError::InvalidConfig(
                "call_timeout_secs must be ≥ 1 when set".into(),
            ));
        }
        Ok(self.settings)
    }
}

/// Operator-editable override record. Empty fields mean "use the static value".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsOverride {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub openai_model: String,
    #[serde(default)]
    pub gemini_model: String,
}

impl SettingsOverride {
    pub fn is_empty(&self) -> bool {
        self.backend.trim().is_empty()
            && self.openai_model.trim().is_empty()
            && self.gemini_model.trim().is_empty()
    }
}

/// The backend selection a single run uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Normalised (trimmed, lower-cased) backend key; may be unknown.
    pub backend_key: String,
    pub openai_model: String,
    pub gemini_model: String,
}

impl EffectiveConfig {
    /// Parse the backend key, failing closed on anything unrecognised.
    pub fn backend(&self) -> Result<Backend, PagewiseError> {
        self.backend_key.parse()
    }

    /// The model for the selected backend.
    ///
    /// Anything other than `gemini` reports the OpenAI model, so a job can
    /// record a model even when its backend key turns out to be invalid.
    pub fn model(&self) -> &str {
        match self.backend() {
            Ok(Backend::Gemini) => &self.gemini_model,
            _ => &self.openai_model,
        }
    }
}

/// Fold the static settings and an optional override into one run's config.
///
/// A non-empty override backend replaces the static backend, and only then
/// are the override's (non-empty) model fields consulted.
pub fn resolve_effective(
    settings: &Settings,
    override_record: Option<&SettingsOverride>,
) -> EffectiveConfig {
    let pick = |over: &str, fallback: &str| -> String {
        let over = over.trim();
        if over.is_empty() {
            fallback.to_string()
        } else {
            over.to_string()
        }
    };

    match override_record {
        Some(o) if !o.backend.trim().is_empty() => EffectiveConfig {
            backend_key: o.backend.trim().to_lowercase(),
            openai_model: pick(&o.openai_model, &settings.openai_model),
            gemini_model: pick(&o.gemini_model, &settings.gemini_model),
        },
        _ => EffectiveConfig {
            backend_key: settings.backend.trim().to_lowercase(),
            openai_model: settings.openai_model.clone(),
            gemini_model: settings.gemini_model.clone(),
        },
    }
}
