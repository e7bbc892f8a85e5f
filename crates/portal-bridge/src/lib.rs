//! # portal-bridge
//!
//! Headless data entry for legacy AJAX/XML grid portals. The portal has no API:
//! every operation is an in-page script call whose response the portal's own
//! renderer would normally paint into the DOM. This crate captures those
//! responses, replays them explicitly, addresses grid rows (including the ones
//! a virtual-scrolling grid never renders), writes fields, submits, and
//! classifies the outcome.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portal_bridge::{Config, EokaProvider, PageProvider, TransactionController};
//!
//! # #[tokio::main]
//! # async fn main() -> portal_bridge::Result<()> {
//! let config = Config::load("configs/cidades.yaml")?;
//! let provider = EokaProvider::launch(&config.browser, &config.target.url).await?;
//! let controller = TransactionController::from_config(&config)?;
//! let screen = Arc::new(config.screen()?.clone());
//!
//! let page = provider.open_page().await?;
//! let result = controller.run(page, screen, config.request()).await?;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```

pub mod classify;
mod config;
pub mod driver;
pub mod intercept;
pub mod locator;
pub mod reconstruct;
pub mod session;
pub mod shadow;
pub mod transaction;
pub mod wire;
pub mod writer;

pub use classify::{Classification, Classifier, Outcome, Signal};
pub use config::{
    AuditConfig, BrowserConfig, ClassifierConfig, Config, FieldSpec, GridLayout, ParamDef,
    Params, RecordEdit, RendererInput, ScreenConfig, TargetUrl, Timeouts, Viewport,
};
pub use driver::{EokaProvider, PageProvider, PortalPage};
pub use locator::{AddressCheck, RowHandle, SourceMode};
pub use session::{ScreenSession, SessionId};
pub use transaction::{
    AuditHook, AuditPoint, CancelHandle, FieldRejection, NoAudit, Phase, RecordReport,
    RecordStatus, ScreenshotAudit, TransactionController, TransactionRequest,
    TransactionResult,
};
pub use wire::{RawPayload, RawRecord, StructuralParseError};

/// Result type for portal-bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading configuration or driving a screen.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("ambiguous response: {count} candidate responses to '{trigger}'")]
    AmbiguousResponse { trigger: String, count: usize },

    #[error("structural parse error: {0}")]
    StructuralParse(#[from] StructuralParseError),

    #[error("record '{0}' not found")]
    RecordNotFound(String),

    #[error("field '{field}' rejected: {reason}")]
    ValidationRejected { field: String, reason: String },

    #[error("row handle from session {handle} used against session {current}")]
    StaleHandle {
        handle: SessionId,
        current: SessionId,
    },

    #[error("script error: {0}")]
    Script(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Whether this error only concerns the record being edited, not the
    /// whole transaction.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Error::StructuralParse(_) | Error::RecordNotFound(_) | Error::ValidationRejected { .. }
        )
    }

    /// Whether a suspension point ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCREEN: &str = r##"
  name: "cidades"
  version: "2024.1"
  open: "abreOpcao('cidades')"
  ready_selector: "#frmCidades"
  search: "pesquisaCidade(${query})"
  commit: "gravaCidades()"
  renderer: "carregaGrid"
  grid:
    row_selector: "tr.linha"
    name_selector: "td.nome"
  record_stride: 17
  raw_field_count: 3
  fields:
    - name: polo
      offset: 1
      max_length: 1
      domain: ["P", "S"]
    - name: prazo
      offset: 2
      max_length: 3
"##;

    fn job(extra: &str) -> String {
        format!(
            "name: \"Test\"\ntarget:\n  url: \"https://portal.example.com\"\nscreen:{}{}",
            SCREEN, extra
        )
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(&job("")).unwrap();
        assert_eq!(config.name, "Test");
        assert_eq!(config.target.url, "https://portal.example.com");
        assert!(config.records.is_empty());
        assert!(!config.browser.headless);
        assert!(!config.dry_run);

        let screen = config.screen().unwrap();
        assert_eq!(screen.record_stride, 17);
        assert_eq!(screen.grid.form_selector, "form");
        assert_eq!(screen.grid.id_prefix, "");
        assert_eq!(screen.renderer_input, RendererInput::Text);
        assert_eq!(screen.version.as_deref(), Some("2024.1"));
    }

    #[test]
    fn test_parse_records_and_search() {
        let yaml = job(
            r#"
search: "CAMPO"
dry_run: true
records:
  - name: "CAMPO GRANDE"
    fields:
      polo: "P"
      prazo: "2"
"#,
        );
        let config = Config::parse(&yaml).unwrap();
        assert_eq!(config.search.as_deref(), Some("CAMPO"));
        assert!(config.dry_run);
        assert_eq!(config.records.len(), 1);
        assert_eq!(config.records[0].fields.get("prazo"), Some(&"2".to_string()));

        let request = config.request();
        assert!(request.dry_run);
        assert_eq!(request.records.len(), 1);
    }

    #[test]
    fn test_default_timeouts() {
        let config = Config::parse(&job("")).unwrap();
        assert_eq!(config.timeouts.response_ms, 30_000);
        assert_eq!(config.timeouts.render_attempts, 40);
        assert_eq!(config.timeouts.classify_attempts, 20);
    }

    #[test]
    fn test_default_classifier_vocabulary() {
        let config = Config::parse(&job("")).unwrap();
        assert!(config
            .classifier
            .error_keywords
            .iter()
            .any(|k| k.contains("obrigat")));
        assert!(!config.classifier.payload_markers.is_empty());
    }

    #[test]
    fn test_validation_missing_url() {
        let yaml = format!(
            "name: \"Test\"\ntarget:\n  url: \"\"\nscreen:{}",
            SCREEN
        );
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn test_validation_missing_screen() {
        let yaml = r#"
name: "Test"
target:
  url: "https://portal.example.com"
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("screen"));
    }

    #[test]
    fn test_validation_duplicate_offsets() {
        let yaml = job("").replace("offset: 2", "offset: 1");
        let err = Config::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("offset 1"), "{}", err);
    }

    #[test]
    fn test_validation_bad_marker_regex() {
        let yaml = job(
            r#"
classifier:
  payload_markers: ["<erro>(unclosed"]
"#,
        );
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn test_params_in_search() {
        let yaml = job(
            r#"
params:
  cidade:
    required: true
search: "${cidade}"
"#,
        );
        let params = Params::new().set("cidade", "CORUMBA");
        let config = Config::parse_with_params(&yaml, &params).unwrap();
        assert_eq!(config.search.as_deref(), Some("CORUMBA"));
        // ${query} is filled at run time, not at load time
        assert_eq!(config.screen().unwrap().search, "pesquisaCidade(${query})");
    }

    #[test]
    fn test_params_missing_required() {
        let yaml = job(
            r#"
params:
  cidade:
    required: true
search: "${cidade}"
"#,
        );
        let err = Config::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("cidade"));
    }

    #[test]
    fn test_load_example_config() {
        let config = Config::load("configs/cidades.yaml").unwrap();
        assert_eq!(config.name, "Atualizar cidades");
        let screen = config.screen().unwrap();
        assert_eq!(screen.fields.len(), 14);
        assert_eq!(screen.record_stride, 17);
    }

    #[test]
    fn test_error_levels() {
        assert!(Error::RecordNotFound("X".into()).is_record_level());
        assert!(!Error::Timeout("search".into()).is_record_level());
        assert!(Error::Timeout("search".into()).is_timeout());
        assert!(!Error::AmbiguousResponse {
            trigger: "x".into(),
            count: 2
        }
        .is_record_level());
    }
}
