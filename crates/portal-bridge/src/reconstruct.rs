//! Manual replay of captured responses.
//!
//! The document is reset to the screen's captured shell, which carries the
//! portal's own scripts, and the body is handed to the portal's renderer the
//! way its transport callback would. The renderer is the only thing that
//! knows how to turn the payload into grid rows.

use crate::config::{RendererInput, Timeouts};
use crate::driver::PortalPage;
use crate::Result;
use std::time::Duration;
use tracing::{debug, info};

/// "At least `min_count` elements match `selector`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub selector: String,
    pub min_count: usize,
}

impl ReadinessProbe {
    pub fn new(selector: impl Into<String>, min_count: usize) -> Self {
        Self {
            selector: selector.into(),
            min_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    NotReady { attempts: u32, renderer_found: bool },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// What to replay and how.
#[derive(Debug, Clone, Copy)]
pub struct Replay<'a> {
    /// Document to restore before rendering.
    pub shell: &'a str,
    /// Global renderer function.
    pub renderer: &'a str,
    pub input: RendererInput,
    pub body: &'a str,
}

#[derive(Debug, Clone)]
pub struct DomReconstructor {
    attempts: u32,
    interval: Duration,
}

impl DomReconstructor {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn from_timeouts(t: &Timeouts) -> Self {
        Self::new(t.render_attempts, Duration::from_millis(t.render_interval_ms))
    }

    /// Replace the document, render `replay.body`, and poll `probe`.
    ///
    /// The renderer may not be defined until the shell's scripts have run,
    /// so the call is retried inside the same polling budget.
    pub async fn replay(
        &self,
        page: &dyn PortalPage,
        replay: Replay<'_>,
        probe: &ReadinessProbe,
    ) -> Result<Readiness> {
        page.replace_document(replay.shell).await?;
        page.install_hooks().await?;

        let mut renderer_found = false;
        for attempt in 1..=self.attempts {
            if !renderer_found {
                renderer_found = page
                    .invoke_renderer(replay.renderer, replay.input, replay.body)
                    .await?;
                if !renderer_found {
                    debug!(
                        "renderer '{}' not defined yet (attempt {})",
                        replay.renderer, attempt
                    );
                }
            }
            if renderer_found && self.probe(page, probe).await? {
                info!("replay ready after {} attempt(s)", attempt);
                return Ok(Readiness::Ready { attempts: attempt });
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Ok(Readiness::NotReady {
            attempts: self.attempts,
            renderer_found,
        })
    }

    async fn probe(&self, page: &dyn PortalPage, probe: &ReadinessProbe) -> Result<bool> {
        let count = page.count(&probe.selector).await?;
        debug!("readiness '{}': {} / {}", probe.selector, count, probe.min_count);
        Ok(count >= probe.min_count)
    }
}
