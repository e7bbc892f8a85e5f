//! Writing logical field values into a record's inputs.

use crate::config::FieldSpec;
use crate::driver::InputState;
use crate::locator::RowHandle;
use crate::session::ScreenSession;
use crate::{shadow, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Result of one field write. A rejection is not an error: the remaining
/// fields are still written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub accepted: bool,
    /// The value as written; the domain's spelling for domain fields.
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub element_id: String,
    /// Written through a hidden input created for the record.
    pub shadow: bool,
}

impl WriteOutcome {
    fn accepted(element_id: String, value: String, shadow: bool) -> Self {
        Self {
            accepted: true,
            value,
            reason: None,
            element_id,
            shadow,
        }
    }

    fn rejected(element_id: String, value: &str, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            value: value.to_string(),
            reason: Some(reason.into()),
            element_id,
            shadow: false,
        }
    }
}

/// Write `value` into `field` of the record behind `handle`.
///
/// Values failing the field's length or domain constraint are rejected
/// before the page is touched. A field that is not in the DOM gets a hidden
/// input first. A handle from another session fails with
/// [`crate::Error::StaleHandle`].
pub async fn write(
    session: &mut ScreenSession,
    handle: &RowHandle,
    field: &FieldSpec,
    value: &str,
) -> Result<WriteOutcome> {
    session.ensure_current(handle.session())?;
    let id = session
        .screen()
        .element_id(handle.concrete_id(field.offset));

    let requested = value;
    let value = match field.check(requested) {
        Ok(v) => v,
        Err(reason) => {
            debug!("[{}] {} rejected: {}", session.id(), field.name, reason);
            return Ok(WriteOutcome::rejected(id, requested, reason));
        }
    };

    let mut via_shadow = session.knows_shadow(&id);
    match session.page().input_state(&id).await? {
        InputState::Writable => {}
        InputState::ReadOnly => {
            return Ok(WriteOutcome::rejected(id, requested, "read-only"));
        }
        InputState::Missing => {
            shadow::ensure(session, handle, field).await?;
            via_shadow = true;
        }
    }

    if !session.page().set_input(&id, &value).await? {
        warn!("[{}] element {} vanished before write", session.id(), id);
        return Ok(WriteOutcome::rejected(id, requested, "element not found"));
    }
    info!("[{}] {} = '{}' (#{})", session.id(), field.name, value, id);
    Ok(WriteOutcome::accepted(id, value, via_shadow))
}
