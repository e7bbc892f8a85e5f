//! One full operation against a screen.
//!
//! `Opening → Searching → AwaitingRender → Editing → (Snapshotting |
//! Submitting) → Classifying → Done`. Every wait is bounded, the session is
//! torn down on every path, and everything after a successful open is folded
//! into the returned [`TransactionResult`].

mod audit;
pub mod batch;
mod request;
mod result;

pub use audit::{AuditHook, AuditPoint, NoAudit, ScreenshotAudit};
pub use request::{CancelHandle, TransactionRequest};
pub use result::{Diagnostic, FieldRejection, RecordReport, RecordStatus, TransactionResult};

use crate::classify::{Classification, Classifier, Evidence, Outcome};
use crate::config::params::render_script;
use crate::config::{Config, RecordEdit, ScreenConfig, Timeouts};
use crate::driver::PortalPage;
use crate::intercept::{InterceptOptions, ResponseInterceptor};
use crate::locator::{locate, SourceMode};
use crate::reconstruct::DomReconstructor;
use crate::session::ScreenSession;
use crate::wire::RawPayload;
use crate::{shadow, writer, Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const HTML_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Opening,
    Searching,
    AwaitingRender,
    Editing,
    Snapshotting,
    Submitting,
    Classifying,
    Done,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Opening, Searching)
                | (Searching, AwaitingRender)
                | (AwaitingRender, Editing)
                | (Editing, Snapshotting)
                | (Editing, Submitting)
                | (Submitting, Classifying)
        ) || (self != Done && next == Done)
    }

    /// Whether a cancel request is still honoured on entering this phase.
    /// The commit is issued inside `Submitting`, so entering it is the last
    /// clean stop.
    pub fn is_cancellable(self) -> bool {
        !matches!(self, Phase::Classifying | Phase::Done)
    }
}

/// Drives transactions; one controller serves any number of sessions.
pub struct TransactionController {
    timeouts: Timeouts,
    interceptor: ResponseInterceptor,
    reconstructor: DomReconstructor,
    classifier: Classifier,
    audit: Arc<dyn AuditHook>,
}

impl TransactionController {
    pub fn new(timeouts: &Timeouts, classifier: Classifier) -> Self {
        Self {
            timeouts: timeouts.clone(),
            interceptor: ResponseInterceptor::new(InterceptOptions::from(timeouts)),
            reconstructor: DomReconstructor::from_timeouts(timeouts),
            classifier,
            audit: Arc::new(NoAudit),
        }
    }

    /// Controller with the job's timeouts, classifier vocabulary, and audit
    /// settings.
    pub fn from_config(config: &Config) -> Result<Self> {
        let controller = Self::new(&config.timeouts, Classifier::new(&config.classifier)?);
        Ok(match config.audit {
            Some(ref audit) => {
                controller.with_audit(Arc::new(ScreenshotAudit::from_config(audit)))
            }
            None => controller,
        })
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditHook>) -> Self {
        self.audit = audit;
        self
    }

    /// Run one transaction on `page`.
    ///
    /// Only a failure to open the screen is returned as `Err`; anything
    /// later ends up in the result with the edits accumulated so far.
    pub async fn run(
        &self,
        page: Box<dyn PortalPage>,
        screen: Arc<ScreenConfig>,
        request: TransactionRequest,
    ) -> Result<TransactionResult> {
        let started = Instant::now();
        let mut session = ScreenSession::open(
            page,
            screen,
            Duration::from_millis(self.timeouts.open_ms),
            Duration::from_millis(self.timeouts.poll_interval_ms.max(1)),
        )
        .await?;

        let mut progress = Progress::new(session.id().to_string());
        let classification = match self.drive(&mut session, &request, &mut progress).await {
            Ok(c) => c,
            Err(e) => self.fold_error(&session, &mut progress, e).await,
        };
        let result = progress.finish(classification, request.dry_run, started);
        info!(
            "[{}] {:?} -> Done: {} ({} written, {} rejected, {}ms)",
            session.id(),
            result.phase_reached,
            result.outcome,
            result.fields_written.len(),
            result.fields_rejected.len(),
            result.duration_ms
        );

        self.audit(AuditPoint::AfterResult, &session).await;
        session.close().await;
        Ok(result)
    }

    async fn drive(
        &self,
        session: &mut ScreenSession,
        request: &TransactionRequest,
        progress: &mut Progress,
    ) -> Result<Classification> {
        let screen = session.shared_screen();

        checkpoint(request, Phase::Searching)?;
        progress.advance(Phase::Searching);
        let script = render_script(&screen.search, &[("query", request.query())]);
        let response = session
            .capture(&self.interceptor, &script, screen.response_match.as_deref())
            .await?;
        let raw = RawPayload::parse(&response.body, screen.raw_field_count);
        if raw.malformed() > 0 {
            warn!(
                "[{}] {} of {} records in the search payload are malformed",
                session.id(),
                raw.malformed(),
                raw.len()
            );
            progress.diagnostic(
                format!("{} of {} records malformed", raw.malformed(), raw.len()),
                None,
            );
        }

        checkpoint(request, Phase::AwaitingRender)?;
        progress.advance(Phase::AwaitingRender);
        let probe = session.grid_probe();
        let readiness = session
            .reconstruct(&self.reconstructor, &response.body, &probe)
            .await?;
        if !readiness.is_ready() {
            let message = format!("grid not ready: {:?}", readiness);
            let html = session.page().document_html().await.ok();
            progress.diagnostic(message.clone(), html.as_deref().map(excerpt));
            self.audit(AuditPoint::Diagnostic, session).await;
            return Ok(Classification::inconclusive(message));
        }

        checkpoint(request, Phase::Editing)?;
        progress.advance(Phase::Editing);
        for edit in &request.records {
            checkpoint(request, Phase::Editing)?;
            self.edit_record(session, &raw, edit, progress).await?;
        }

        if request.dry_run {
            checkpoint(request, Phase::Snapshotting)?;
            progress.advance(Phase::Snapshotting);
            let ids: Vec<String> = progress.touched.values().cloned().collect();
            let values = session.page().read_inputs(&ids).await?;
            progress.snapshot = progress
                .touched
                .iter()
                .filter_map(|(key, id)| values.get(id).map(|v| (key.clone(), v.clone())))
                .collect();
            self.audit(AuditPoint::DryRunSnapshot, session).await;
            return Ok(progress.dry_run_classification());
        }

        if progress.written.is_empty() {
            info!("[{}] nothing accepted; skipping submit", session.id());
            return Ok(Classification {
                outcome: Outcome::ValidationError,
                message: "nothing to submit".into(),
                signal: None,
            });
        }

        checkpoint(request, Phase::Submitting)?;
        progress.advance(Phase::Submitting);
        self.audit(AuditPoint::BeforeSubmit, session).await;
        let sentinel_before = match screen.sentinel {
            Some(ref selector) => session.page().count(selector).await? > 0,
            None => false,
        };
        let stale = session.page().take_dialogs().await?;
        if !stale.is_empty() {
            debug!("[{}] discarding {} pre-submit dialog(s)", session.id(), stale.len());
        }

        let commit = match session
            .capture(
                &self.interceptor,
                &screen.commit,
                screen.commit_response_match.as_deref(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                progress.diagnostic(e.to_string(), None);
                return Ok(Classification::inconclusive(format!(
                    "submitted, but no response was observed: {}",
                    e
                )));
            }
            Err(e) => return Err(e),
        };

        progress.advance(Phase::Classifying);
        let mut evidence = LiveEvidence {
            session,
            dialogs: Vec::new(),
            payload: Some(commit.body.clone()),
            sentinel: screen.sentinel.as_deref().filter(|_| sentinel_before),
        };
        // dialogs raised by the commit must be read before any replay
        evidence.collect_dialogs().await?;

        let commit_records = RawPayload::parse(&commit.body, screen.raw_field_count);
        if !commit_records.is_empty() && evidence.session.is_reachable().await? {
            let readiness = evidence
                .session
                .reconstruct(&self.reconstructor, &commit.body, &probe)
                .await?;
            debug!("post-commit replay: {:?}", readiness);
        }

        self.classify(&mut evidence).await
    }

    async fn edit_record(
        &self,
        session: &mut ScreenSession,
        raw: &RawPayload,
        edit: &RecordEdit,
        progress: &mut Progress,
    ) -> Result<()> {
        let located = match locate(session, &edit.name, Some(raw)).await {
            Ok(located) => located,
            Err(e) if e.is_record_level() => {
                warn!("[{}] {}", session.id(), e);
                let status = match e {
                    Error::StructuralParse(_) => RecordStatus::Malformed,
                    _ => RecordStatus::NotFound,
                };
                for name in edit.fields.keys() {
                    progress.reject(&edit.name, name, e.to_string());
                }
                progress
                    .records
                    .push(RecordReport::missing(&edit.name, status, e.to_string()));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let handle = located.handle;
        let mut report = RecordReport::located(&edit.name, &handle, located.check);
        info!(
            "[{}] '{}' -> base id {} ({:?})",
            session.id(),
            edit.name,
            handle.base_id(),
            handle.source()
        );
        if handle.source() == SourceMode::RawXml {
            report.shadow_inputs = shadow::ensure_row(session, &handle).await?;
        }

        let (mut accepted, mut rejected) = (0, 0);
        for (name, value) in &edit.fields {
            let Some(field) = session.screen().field(name).cloned() else {
                progress.reject(&edit.name, name, "unknown field");
                rejected += 1;
                continue;
            };
            match writer::write(session, &handle, &field, value).await {
                Ok(out) if out.accepted => {
                    let key = format!("{}.{}", edit.name, field.name);
                    progress.touched.insert(key.clone(), out.element_id);
                    progress.written.insert(key, out.value);
                    accepted += 1;
                }
                Ok(out) => {
                    let reason = out.reason.unwrap_or_else(|| "rejected".into());
                    progress.reject(&edit.name, &field.name, reason);
                    rejected += 1;
                }
                Err(e) if e.is_record_level() => {
                    progress.reject(&edit.name, &field.name, e.to_string());
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        report.status = match (accepted, rejected) {
            (_, 0) => RecordStatus::Edited,
            (0, _) => RecordStatus::Rejected,
            _ => RecordStatus::Partial,
        };
        progress.records.push(report);
        Ok(())
    }

    /// Evaluate the signal chain until something fires or the polling budget
    /// runs out.
    async fn classify(&self, evidence: &mut LiveEvidence<'_>) -> Result<Classification> {
        let attempts = self.timeouts.classify_attempts.max(1);
        let interval = Duration::from_millis(self.timeouts.classify_interval_ms);
        let mut attempt = 1;
        loop {
            let classification = self.classifier.evaluate(evidence).await?;
            if classification.outcome != Outcome::Inconclusive || attempt >= attempts {
                return Ok(classification);
            }
            debug!("classification inconclusive (attempt {}/{})", attempt, attempts);
            attempt += 1;
            tokio::time::sleep(interval).await;
        }
    }

    async fn fold_error(
        &self,
        session: &ScreenSession,
        progress: &mut Progress,
        error: Error,
    ) -> Classification {
        warn!("[{}] aborted in {:?}: {}", session.id(), progress.phase, error);
        let html = match error {
            Error::Cancelled(_) => None,
            _ => session.page().document_html().await.ok(),
        };
        progress.diagnostic(error.to_string(), html.as_deref().map(excerpt));
        if !matches!(error, Error::Cancelled(_)) {
            self.audit(AuditPoint::Diagnostic, session).await;
        }

        let outcome = if error.is_record_level() {
            Outcome::ValidationError
        } else {
            Outcome::Inconclusive
        };
        Classification {
            outcome,
            message: error.to_string(),
            signal: None,
        }
    }

    async fn audit(&self, point: AuditPoint, session: &ScreenSession) {
        if let Err(e) = self
            .audit
            .capture(point, &session.screen().name, session.page())
            .await
        {
            warn!("[{}] audit hook {:?} failed: {}", session.id(), point, e);
        }
    }
}

fn checkpoint(request: &TransactionRequest, next: Phase) -> Result<()> {
    match request.interruption() {
        Some(reason) if next.is_cancellable() => {
            Err(Error::Cancelled(format!("{} before {:?}", reason, next)))
        }
        _ => Ok(()),
    }
}

fn excerpt(html: &str) -> String {
    html.chars().take(HTML_EXCERPT_CHARS).collect()
}

/// What a transaction has done so far.
struct Progress {
    session: String,
    phase: Phase,
    written: BTreeMap<String, String>,
    /// `"record.field"` -> element id, for accepted writes.
    touched: BTreeMap<String, String>,
    rejected: Vec<FieldRejection>,
    records: Vec<RecordReport>,
    snapshot: BTreeMap<String, String>,
    diagnostics: Vec<Diagnostic>,
}

impl Progress {
    fn new(session: String) -> Self {
        Self {
            session,
            phase: Phase::Opening,
            written: BTreeMap::new(),
            touched: BTreeMap::new(),
            rejected: Vec::new(),
            records: Vec::new(),
            snapshot: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    fn advance(&mut self, next: Phase) {
        if self.phase == next {
            return;
        }
        if !self.phase.can_advance_to(next) {
            warn!("[{}] unexpected transition {:?} -> {:?}", self.session, self.phase, next);
        }
        info!("[{}] {:?} -> {:?}", self.session, self.phase, next);
        self.phase = next;
    }

    fn reject(&mut self, record: &str, name: &str, reason: impl Into<String>) {
        self.rejected.push(FieldRejection {
            record: record.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        });
    }

    fn diagnostic(&mut self, message: String, html_excerpt: Option<String>) {
        self.diagnostics.push(Diagnostic {
            phase: self.phase,
            message,
            html_excerpt,
        });
    }

    fn dry_run_classification(&self) -> Classification {
        let unlocated = self.records.iter().filter(|r| !r.is_located()).count();
        if self.rejected.is_empty() && unlocated == 0 {
            return Classification {
                outcome: Outcome::Success,
                message: format!("dry run: {} field(s) staged", self.written.len()),
                signal: None,
            };
        }
        Classification {
            outcome: Outcome::ValidationError,
            message: format!(
                "dry run: {} field(s) rejected, {} record(s) not located",
                self.rejected.len(),
                unlocated
            ),
            signal: None,
        }
    }

    /// `phase_reached` is the last phase worked in before `Done`.
    fn finish(
        self,
        classification: Classification,
        dry_run: bool,
        started: Instant,
    ) -> TransactionResult {
        TransactionResult {
            outcome: classification.outcome,
            message: Some(classification.message).filter(|m| !m.is_empty()),
            signal: classification.signal,
            fields_written: self.written,
            fields_rejected: self.rejected,
            records: self.records,
            phase_reached: self.phase,
            dry_run,
            snapshot: self.snapshot,
            diagnostics: self.diagnostics,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Post-commit evidence read from the live session.
struct LiveEvidence<'a> {
    session: &'a mut ScreenSession,
    dialogs: Vec<String>,
    payload: Option<String>,
    /// Set only when the sentinel was present before the commit.
    sentinel: Option<&'a str>,
}

impl LiveEvidence<'_> {
    async fn collect_dialogs(&mut self) -> Result<()> {
        if self.session.is_reachable().await? {
            self.dialogs.extend(self.session.page().take_dialogs().await?);
        }
        Ok(())
    }
}

#[async_trait]
impl Evidence for LiveEvidence<'_> {
    async fn dialogs(&mut self) -> Result<Vec<String>> {
        self.collect_dialogs().await?;
        Ok(self.dialogs.clone())
    }

    async fn payload(&mut self) -> Result<Option<String>> {
        Ok(self.payload.clone())
    }

    async fn sentinel_absent(&mut self) -> Result<Option<bool>> {
        let Some(selector) = self.sentinel else {
            return Ok(None);
        };
        if !self.session.is_reachable().await? {
            return Ok(None);
        }
        Ok(Some(self.session.page().count(selector).await? == 0))
    }

    async fn screen_closed(&mut self) -> Result<bool> {
        Ok(!self.session.is_reachable().await?)
    }
}
