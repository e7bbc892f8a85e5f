//! Deciding whether a submission took effect.
//!
//! The portal reports success and failure through several loosely related
//! channels. They are consulted in a fixed order and the first one that
//! fires decides the outcome. Evidence is gathered lazily, so a decisive
//! early signal means the later ones are never probed.

use crate::config::ClassifierConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    ValidationError,
    Inconclusive,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "SUCCESS",
            Outcome::ValidationError => "VALIDATION_ERROR",
            Outcome::Inconclusive => "INCONCLUSIVE",
        };
        f.write_str(s)
    }
}

/// A channel the portal reports results through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    /// A dialog whose text carries an error keyword.
    DialogError,
    /// An error marker in the commit response body.
    PayloadMarker,
    /// The pending-changes marker disappeared after the commit.
    SentinelGone,
    /// The screen closed itself after the commit.
    ScreenClosed,
}

impl Signal {
    /// Evaluation order; errors outrank success.
    pub const PRECEDENCE: [Signal; 4] = [
        Signal::DialogError,
        Signal::PayloadMarker,
        Signal::SentinelGone,
        Signal::ScreenClosed,
    ];

    pub fn outcome(self) -> Outcome {
        match self {
            Signal::DialogError | Signal::PayloadMarker => Outcome::ValidationError,
            Signal::SentinelGone | Signal::ScreenClosed => Outcome::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub outcome: Outcome,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
}

impl Classification {
    pub fn inconclusive(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Inconclusive,
            message: message.into(),
            signal: None,
        }
    }

    fn fired(signal: Signal, message: impl Into<String>) -> Self {
        Self {
            outcome: signal.outcome(),
            message: message.into(),
            signal: Some(signal),
        }
    }
}

/// Post-submit observations, fetched on demand.
#[async_trait]
pub trait Evidence: Send {
    /// Dialog texts raised since the commit.
    async fn dialogs(&mut self) -> Result<Vec<String>>;

    /// The commit response body, if one was captured.
    async fn payload(&mut self) -> Result<Option<String>>;

    /// `Some(true)` when the sentinel was present before the commit and is
    /// gone now; `None` when the screen has no usable sentinel.
    async fn sentinel_absent(&mut self) -> Result<Option<bool>>;

    async fn screen_closed(&mut self) -> Result<bool>;
}

/// Fixed observations, for replaying a decision offline.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub dialogs: Vec<String>,
    pub payload: Option<String>,
    pub sentinel_absent: Option<bool>,
    pub screen_closed: bool,
}

#[async_trait]
impl Evidence for Observed {
    async fn dialogs(&mut self) -> Result<Vec<String>> {
        Ok(self.dialogs.clone())
    }

    async fn payload(&mut self) -> Result<Option<String>> {
        Ok(self.payload.clone())
    }

    async fn sentinel_absent(&mut self) -> Result<Option<bool>> {
        Ok(self.sentinel_absent)
    }

    async fn screen_closed(&mut self) -> Result<bool> {
        Ok(self.screen_closed)
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    /// One regex per keyword, anchored at a word start.
    keywords: Vec<Regex>,
    markers: Vec<Regex>,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let markers = config
            .payload_markers
            .iter()
            .map(|m| {
                Regex::new(m).map_err(|e| {
                    Error::Config(format!("invalid payload marker '{}': {}", m, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let keywords = config
            .error_keywords
            .iter()
            .map(|k| {
                Regex::new(&format!(r"(?i)\b{}", regex::escape(k.trim()))).map_err(|e| {
                    Error::Config(format!("invalid error keyword '{}': {}", k, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { keywords, markers })
    }

    /// Walk the signals in precedence order and stop at the first that
    /// fires. Without any, the result is [`Outcome::Inconclusive`], carrying
    /// the text of any non-error dialog.
    pub async fn evaluate(&self, evidence: &mut dyn Evidence) -> Result<Classification> {
        let mut notes: Vec<String> = Vec::new();

        for signal in Signal::PRECEDENCE {
            let fired = match signal {
                Signal::DialogError => {
                    let dialogs = evidence.dialogs().await?;
                    let hit = dialogs.iter().find(|d| self.is_error_text(d)).cloned();
                    if hit.is_none() {
                        notes.extend(dialogs.into_iter().filter(|d| !d.trim().is_empty()));
                    }
                    hit.map(|d| d.trim().to_string())
                }
                Signal::PayloadMarker => match evidence.payload().await? {
                    Some(body) => self.payload_error(&body),
                    None => None,
                },
                Signal::SentinelGone => evidence
                    .sentinel_absent()
                    .await?
                    .filter(|gone| *gone)
                    .map(|_| "pending-changes marker cleared".to_string()),
                Signal::ScreenClosed => evidence
                    .screen_closed()
                    .await?
                    .then(|| "screen closed after commit".to_string()),
            };

            if let Some(message) = fired {
                debug!("classified by {:?}: {}", signal, message);
                return Ok(Classification::fired(signal, message));
            }
        }

        Ok(Classification::inconclusive(if notes.is_empty() {
            "no success or error signal observed".to_string()
        } else {
            notes.join(" | ")
        }))
    }

    pub fn is_error_text(&self, text: &str) -> bool {
        self.keywords.iter().any(|k| k.is_match(text))
    }

    /// Message of the first payload marker found in `body`.
    pub fn payload_error(&self, body: &str) -> Option<String> {
        self.markers.iter().find_map(|re| {
            let caps = re.captures(body)?;
            let text = caps
                .get(1)
                .map(|m| clean_markup(m.as_str()))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "portal rejected the submission".to_string());
            Some(text)
        })
    }
}

/// Strip tags and collapse whitespace.
fn clean_markup(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
