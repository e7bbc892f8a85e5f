//! Per-screen field catalog and grid layout.
//!
//! The addressing scheme of a screen is reverse-engineered, not documented:
//! every record of a grid owns a block of `record_stride` element ids starting
//! at `record_index * record_stride`, and each logical field sits at a fixed
//! offset inside that block. Both numbers are versioned configuration.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// How the portal's renderer expects to receive a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RendererInput {
    /// The response body as a string.
    #[default]
    Text,
    /// An XHR-like object (`responseText`, `responseXML`, `status`, `readyState`).
    Xhr,
}

/// Where rows, names and the submitted form live in the screen's DOM.
#[derive(Debug, Clone, Deserialize)]
pub struct GridLayout {
    /// Selector matching one element per rendered record.
    pub row_selector: String,

    /// Selector (inside a row) of the element holding the display name.
    /// The row's own text is used when absent.
    pub name_selector: Option<String>,

    /// Form that the commit action serializes.
    #[serde(default = "default_form_selector")]
    pub form_selector: String,

    /// Prefix of the numeric element ids, e.g. `"c"` for `id="c341"`.
    #[serde(default)]
    pub id_prefix: String,
}

fn default_form_selector() -> String {
    "form".into()
}

/// One logical field of a screen.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    /// Logical name used by callers.
    pub name: String,

    /// Offset added to a row's base id.
    pub offset: u32,

    /// Maximum accepted length, in characters.
    pub max_length: usize,

    /// Accepted values (case-insensitive), when the field is a closed set.
    #[serde(default)]
    pub domain: Option<Vec<String>>,

    /// Positional sub-field carrying the current value in the raw payload.
    /// Defaults to `offset`.
    #[serde(default)]
    pub raw_index: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, offset: u32, max_length: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            max_length,
            domain: None,
            raw_index: None,
        }
    }

    pub fn with_domain(mut self, values: &[&str]) -> Self {
        self.domain = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn raw_index(&self) -> usize {
        self.raw_index.unwrap_or(self.offset as usize)
    }

    /// Check `value` against the local constraints. Returns the value to
    /// write (the domain's own spelling when the field has a domain) or the
    /// reason for rejection. Surrounding whitespace is not part of the value.
    pub fn check(&self, value: &str) -> std::result::Result<String, String> {
        let value = value.trim();
        let len = value.chars().count();
        if len > self.max_length {
            return Err(format!(
                "length {} exceeds maximum {}",
                len, self.max_length
            ));
        }
        match &self.domain {
            None => Ok(value.to_string()),
            Some(domain) => {
                let wanted = value.to_lowercase();
                domain
                    .iter()
                    .find(|d| d.to_lowercase() == wanted)
                    .cloned()
                    .ok_or_else(|| {
                        format!("'{}' is not one of [{}]", value, domain.join(", "))
                    })
            }
        }
    }
}

/// Everything the engine knows about one screen type.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenConfig {
    /// Screen type name, e.g. "cidades".
    pub name: String,

    /// Version of the reverse-engineered layout this catalog describes.
    #[serde(default)]
    pub version: Option<String>,

    /// Script that opens the screen.
    pub open: String,

    /// Script that closes the screen at teardown.
    #[serde(default)]
    pub close: Option<String>,

    /// Present while the screen is open.
    pub ready_selector: String,

    /// Search script; `${query}` receives the quoted search text.
    pub search: String,

    /// Commit script; serializes and posts the whole form.
    pub commit: String,

    /// URL substring identifying the search response.
    #[serde(default)]
    pub response_match: Option<String>,

    /// URL substring identifying the commit response.
    #[serde(default)]
    pub commit_response_match: Option<String>,

    /// Global function (dotted path allowed) the portal renders responses with.
    pub renderer: String,

    #[serde(default)]
    pub renderer_input: RendererInput,

    pub grid: GridLayout,

    /// Rows that must be rendered before the grid counts as ready.
    #[serde(default = "default_min_rows")]
    pub min_rows: usize,

    /// Element ids reserved per record (the `K` of `base = index * K`).
    pub record_stride: u32,

    /// Raw sub-field holding the display name.
    #[serde(default)]
    pub raw_name_field: usize,

    /// Sub-fields every raw record must carry.
    pub raw_field_count: usize,

    /// Element present only while some record is incomplete.
    #[serde(default)]
    pub sentinel: Option<String>,

    pub fields: Vec<FieldSpec>,
}

fn default_min_rows() -> usize {
    1
}

impl ScreenConfig {
    /// Load a screen catalog from its own YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let screen: ScreenConfig = serde_yaml::from_str(&content)?;
        screen.validate()?;
        Ok(screen)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn field_at(&self, offset: u32) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.offset == offset)
    }

    /// DOM id of the element with numeric identifier `concrete`.
    pub fn element_id(&self, concrete: u32) -> String {
        format!("{}{}", self.grid.id_prefix, concrete)
    }

    /// Parse a DOM id back into its numeric identifier.
    pub fn parse_element_id(&self, id: &str) -> Option<u32> {
        id.strip_prefix(self.grid.id_prefix.as_str())?.parse().ok()
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("screen '{}': {}", self.name, msg)));

        if self.name.is_empty() {
            return Err(Error::Config("screen.name is required".into()));
        }
        if self.record_stride == 0 {
            return fail("record_stride must be at least 1".into());
        }
        if self.raw_name_field >= self.raw_field_count {
            return fail(format!(
                "raw_name_field {} is outside raw_field_count {}",
                self.raw_name_field, self.raw_field_count
            ));
        }
        if self.fields.is_empty() {
            return fail("at least one field is required".into());
        }

        let mut offsets = HashSet::new();
        let mut names = HashSet::new();
        for f in &self.fields {
            if f.offset == 0 || f.offset >= self.record_stride {
                return fail(format!(
                    "field '{}': offset {} must be within 1..{}",
                    f.name, f.offset, self.record_stride
                ));
            }
            if !offsets.insert(f.offset) {
                return fail(format!("offset {} is used twice", f.offset));
            }
            if !names.insert(f.name.to_lowercase()) {
                return fail(format!("field '{}' is defined twice", f.name));
            }
            if f.max_length == 0 {
                return fail(format!("field '{}': max_length must be at least 1", f.name));
            }
            if f.raw_index() >= self.raw_field_count {
                return fail(format!(
                    "field '{}': raw index {} is outside raw_field_count {}",
                    f.name,
                    f.raw_index(),
                    self.raw_field_count
                ));
            }
        }
        Ok(())
    }
}
