//! An open screen and the page it lives on.
//!
//! The portal keeps one implicit "current form" per page, so a session is the
//! unit of exclusive ownership: it owns its page, every mutation goes through
//! `&mut self`, and row handles are stamped with the id of the session that
//! produced them.

use crate::config::ScreenConfig;
use crate::driver::{CapturedResponse, PortalPage};
use crate::intercept::ResponseInterceptor;
use crate::reconstruct::{DomReconstructor, Readiness, ReadinessProbe, Replay};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_test(n: u64) -> Self {
        Self(n)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

pub struct ScreenSession {
    id: SessionId,
    page: Box<dyn PortalPage>,
    screen: Arc<ScreenConfig>,
    shell: String,
    last_payload: Option<String>,
    generation: u64,
    network_calls: usize,
    shadow_ids: HashSet<String>,
}

impl ScreenSession {
    /// Open `screen` on `page` and capture the document shell used for
    /// later replays.
    pub async fn open(
        page: Box<dyn PortalPage>,
        screen: Arc<ScreenConfig>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let id = SessionId::next();
        info!(
            "[{}] opening screen '{}' (layout {})",
            id,
            screen.name,
            screen.version.as_deref().unwrap_or("unversioned")
        );

        page.install_hooks().await?;
        page.run_script(&screen.open).await?;

        let started = Instant::now();
        while !page.is_reachable(&screen.ready_selector).await? {
            if started.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "screen '{}' did not show '{}' within {}ms",
                    screen.name,
                    screen.ready_selector,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }

        let shell = page.document_html().await?;
        debug!("[{}] captured shell ({} bytes)", id, shell.len());

        Ok(Self {
            id,
            page,
            screen,
            shell,
            last_payload: None,
            generation: 0,
            network_calls: 0,
            shadow_ids: HashSet::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn page(&self) -> &dyn PortalPage {
        self.page.as_ref()
    }

    pub fn screen(&self) -> &ScreenConfig {
        &self.screen
    }

    pub fn shared_screen(&self) -> Arc<ScreenConfig> {
        Arc::clone(&self.screen)
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Body of the last replayed response.
    pub fn last_payload(&self) -> Option<&str> {
        self.last_payload.as_deref()
    }

    /// Number of replays so far; shadow inputs do not survive a replay.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Network-triggering actions issued through this session.
    pub fn network_calls(&self) -> usize {
        self.network_calls
    }

    /// Trigger a network action and capture its response.
    pub async fn capture(
        &mut self,
        interceptor: &ResponseInterceptor,
        trigger: &str,
        key: Option<&str>,
    ) -> Result<CapturedResponse> {
        self.network_calls += 1;
        interceptor.capture(self.page.as_ref(), trigger, key).await
    }

    /// Replay `body` through the portal's renderer.
    pub async fn reconstruct(
        &mut self,
        reconstructor: &DomReconstructor,
        body: &str,
        probe: &ReadinessProbe,
    ) -> Result<Readiness> {
        self.generation += 1;
        self.shadow_ids.clear();
        self.last_payload = Some(body.to_string());
        let replay = Replay {
            shell: &self.shell,
            renderer: &self.screen.renderer,
            input: self.screen.renderer_input,
            body,
        };
        reconstructor.replay(self.page.as_ref(), replay, probe).await
    }

    /// Readiness probe for this screen's grid.
    pub fn grid_probe(&self) -> ReadinessProbe {
        ReadinessProbe::new(self.screen.grid.row_selector.clone(), self.screen.min_rows)
    }

    pub async fn is_reachable(&self) -> Result<bool> {
        self.page.is_reachable(&self.screen.ready_selector).await
    }

    pub(crate) fn knows_shadow(&self, id: &str) -> bool {
        self.shadow_ids.contains(id)
    }

    pub(crate) fn remember_shadow(&mut self, id: String) {
        self.shadow_ids.insert(id);
    }

    pub(crate) fn ensure_current(&self, handle: SessionId) -> Result<()> {
        if handle == self.id {
            Ok(())
        } else {
            Err(Error::StaleHandle {
                handle,
                current: self.id,
            })
        }
    }

    /// Close the screen. Failures are logged; the page is dropped either way.
    pub async fn close(self) {
        let Some(ref script) = self.screen.close else {
            return;
        };
        match self.page.is_reachable(&self.screen.ready_selector).await {
            Ok(true) => {
                if let Err(e) = self.page.run_script(script).await {
                    warn!("[{}] close script failed: {}", self.id, e);
                }
            }
            Ok(false) => debug!("[{}] screen already closed", self.id),
            Err(e) => warn!("[{}] reachability check failed: {}", self.id, e),
        }
    }
}
