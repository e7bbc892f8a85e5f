//! Response capture for in-page actions.
//!
//! The portal's own transport hands responses to a callback that, under
//! headless control, does not reliably run. So the engine never waits for the
//! DOM to change: it triggers the action and reads the raw body from the
//! page's capture log.

use crate::config::Timeouts;
use crate::driver::{CapturedResponse, PortalPage};
use crate::{Error, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Bounds for one capture.
#[derive(Debug, Clone)]
pub struct InterceptOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Extra wait after the first candidate, so a second one is noticed.
    pub settle: Duration,
}

impl From<&Timeouts> for InterceptOptions {
    fn from(t: &Timeouts) -> Self {
        Self {
            timeout: Duration::from_millis(t.response_ms),
            poll_interval: Duration::from_millis(t.poll_interval_ms.max(1)),
            settle: Duration::from_millis(t.settle_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseInterceptor {
    options: InterceptOptions,
}

impl ResponseInterceptor {
    pub fn new(options: InterceptOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &InterceptOptions {
        &self.options
    }

    /// Run `trigger` and return the single response it produced.
    ///
    /// `key` is a URL substring used to pick the right response when the
    /// action causes more than one request.
    pub async fn capture(
        &self,
        page: &dyn PortalPage,
        trigger: &str,
        key: Option<&str>,
    ) -> Result<CapturedResponse> {
        let cursor = page.response_cursor().await?;
        debug!("capture: cursor={} trigger={}", cursor, short(trigger));
        page.run_script(trigger).await?;

        let started = Instant::now();
        loop {
            let seen = candidates(page.responses_since(cursor).await?, key);
            if !seen.is_empty() {
                break;
            }
            if started.elapsed() >= self.options.timeout {
                return Err(Error::Timeout(format!(
                    "no response to '{}' within {}ms",
                    short(trigger),
                    self.options.timeout.as_millis()
                )));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }

        if !self.options.settle.is_zero() {
            tokio::time::sleep(self.options.settle).await;
        }
        let mut seen = candidates(page.responses_since(cursor).await?, key);

        match seen.len() {
            1 => {
                let response = seen.remove(0);
                info!(
                    "captured response #{} from {} ({} bytes, status {})",
                    response.seq,
                    response.url,
                    response.body.len(),
                    response.status
                );
                Ok(response)
            }
            count => {
                let urls: Vec<&str> = seen.iter().map(|r| r.url.as_str()).collect();
                debug!("ambiguous capture: {:?}", urls);
                Err(Error::AmbiguousResponse {
                    trigger: short(trigger),
                    count,
                })
            }
        }
    }
}

fn candidates(responses: Vec<CapturedResponse>, key: Option<&str>) -> Vec<CapturedResponse> {
    match key {
        Some(key) => responses
            .into_iter()
            .filter(|r| r.url.contains(key))
            .collect(),
        None => responses,
    }
}

fn short(script: &str) -> String {
    let s: String = script.chars().take(60).collect();
    if s.len() < script.len() {
        format!("{}...", s)
    } else {
        s
    }
}
