//! Evidence capture at fixed points of a transaction.

use crate::config::AuditConfig;
use crate::driver::PortalPage;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditPoint {
    BeforeSubmit,
    DryRunSnapshot,
    AfterResult,
    /// Something went wrong and the page state is worth keeping.
    Diagnostic,
}

impl AuditPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditPoint::BeforeSubmit => "before-submit",
            AuditPoint::DryRunSnapshot => "dry-run",
            AuditPoint::AfterResult => "after-result",
            AuditPoint::Diagnostic => "diagnostic",
        }
    }
}

/// Receives the page at each audit point. The transaction logs and ignores
/// failures.
#[async_trait]
pub trait AuditHook: Send + Sync {
    async fn capture(&self, point: AuditPoint, screen: &str, page: &dyn PortalPage) -> Result<()>;
}

pub struct NoAudit;

#[async_trait]
impl AuditHook for NoAudit {
    async fn capture(&self, _: AuditPoint, _: &str, _: &dyn PortalPage) -> Result<()> {
        Ok(())
    }
}

/// Writes a PNG screenshot and/or the document HTML per audit point.
#[derive(Debug, Clone)]
pub struct ScreenshotAudit {
    dir: PathBuf,
    pattern: String,
    screenshot: bool,
    html: bool,
}

impl ScreenshotAudit {
    pub const DEFAULT_PATTERN: &'static str = "{screen}-{point}-{timestamp}";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pattern: Self::DEFAULT_PATTERN.to_string(),
            screenshot: true,
            html: true,
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            screenshot: config.screenshot,
            html: config.html,
            ..Self::new(&config.dir)
        }
    }

    /// File stem pattern; `{screen}`, `{point}` and `{timestamp}` are
    /// replaced.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    fn stem(&self, point: AuditPoint, screen: &str) -> String {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        self.pattern
            .replace("{screen}", &sanitize(screen))
            .replace("{point}", point.as_str())
            .replace("{timestamp}", &timestamp)
    }
}

#[async_trait]
impl AuditHook for ScreenshotAudit {
    async fn capture(&self, point: AuditPoint, screen: &str, page: &dyn PortalPage) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let stem = self.stem(point, screen);

        if self.screenshot {
            let path = self.dir.join(format!("{}.png", stem));
            info!("Saving {} screenshot to: {}", point.as_str(), path.display());
            std::fs::write(&path, page.screenshot().await?)?;
        }
        if self.html {
            let path = self.dir.join(format!("{}.html", stem));
            std::fs::write(&path, page.document_html().await?)?;
        }
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakePortal;

    #[tokio::test]
    async fn test_screenshot_audit_writes_files() {
        let dir = std::env::temp_dir().join(format!("pb-audit-{}", std::process::id()));
        let audit = ScreenshotAudit::new(&dir).pattern("{screen}-{point}");
        let fake = FakePortal::new();

        audit
            .capture(AuditPoint::BeforeSubmit, "cidades uf", &fake)
            .await
            .unwrap();

        let png = std::fs::read(dir.join("cidades_uf-before-submit.png")).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let html = std::fs::read_to_string(dir.join("cidades_uf-before-submit.html")).unwrap();
        assert!(html.contains("frmCidades"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_default_stem_has_timestamp() {
        let audit = ScreenshotAudit::new("audit");
        let stem = audit.stem(AuditPoint::AfterResult, "cidades");
        assert!(stem.starts_with("cidades-after-result-20"), "{}", stem);
    }
}
