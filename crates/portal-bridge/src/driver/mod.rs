//! The seam between the engine and a live page.
//!
//! Everything the engine does to the portal goes through [`PortalPage`]: each
//! method is one in-page operation. [`EokaPortal`] implements it with
//! JavaScript evaluated over CDP; tests use an in-memory fake.

mod cdp;
#[cfg(test)]
pub(crate) mod fake;

pub use cdp::{EokaPortal, EokaProvider};

use crate::config::{GridLayout, RendererInput};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A response body observed by the in-page network hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    /// Position in the page's capture log.
    pub seq: usize,
    pub url: String,
    #[serde(default)]
    pub status: u16,
    pub body: String,
}

/// A grid row as currently rendered.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RenderedRow {
    /// Position among rendered rows.
    pub position: usize,
    /// Display name text.
    pub name: String,
    /// Inputs of the row whose id parses as a numeric identifier.
    pub inputs: Vec<RenderedInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RenderedInput {
    pub id: u32,
    pub value: String,
}

/// Whether an element can take a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputState {
    Missing,
    ReadOnly,
    Writable,
}

/// A hidden input standing in for a field the grid never rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowInput {
    /// DOM id and form name.
    pub id: String,
    pub record_index: usize,
    pub offset: u32,
    /// Initial value (the record's current raw value).
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowOutcome {
    Created,
    Existing,
}

/// One open portal page.
#[async_trait]
pub trait PortalPage: Send + Sync {
    /// Install the response and dialog hooks. Idempotent.
    async fn install_hooks(&self) -> Result<()>;

    /// Run a portal script (open, search, commit, close).
    async fn run_script(&self, expression: &str) -> Result<()>;

    /// Number of responses captured so far.
    async fn response_cursor(&self) -> Result<usize>;

    /// Responses captured after `cursor`.
    async fn responses_since(&self, cursor: usize) -> Result<Vec<CapturedResponse>>;

    /// Drain the text of native dialogs raised since the last call.
    async fn take_dialogs(&self) -> Result<Vec<String>>;

    async fn document_html(&self) -> Result<String>;

    /// Replace the whole document with `shell`.
    async fn replace_document(&self, shell: &str) -> Result<()>;

    /// Call the portal's renderer with `body`. `false` when the renderer is
    /// not (yet) defined.
    async fn invoke_renderer(
        &self,
        renderer: &str,
        input: RendererInput,
        body: &str,
    ) -> Result<bool>;

    /// Number of elements matching `selector`.
    async fn count(&self, selector: &str) -> Result<usize>;

    async fn rendered_rows(&self, grid: &GridLayout) -> Result<Vec<RenderedRow>>;

    async fn input_state(&self, id: &str) -> Result<InputState>;

    /// Set a value and dispatch `input`/`change`. `false` if the element is gone.
    async fn set_input(&self, id: &str, value: &str) -> Result<bool>;

    /// Current values of the given element ids; missing ids are omitted.
    async fn read_inputs(&self, ids: &[String]) -> Result<BTreeMap<String, String>>;

    /// Create `input` inside the form unless an element with its id exists.
    async fn ensure_hidden_input(
        &self,
        form_selector: &str,
        input: &ShadowInput,
    ) -> Result<ShadowOutcome>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Whether `selector` still resolves. A page that can no longer be
    /// evaluated is not reachable.
    async fn is_reachable(&self, selector: &str) -> Result<bool>;
}

/// Supplies opened, authenticated pages. One page per screen session.
#[async_trait]
pub trait PageProvider: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn PortalPage>>;
}
