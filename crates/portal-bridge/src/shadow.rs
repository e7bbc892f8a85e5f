//! Hidden inputs for records the grid never rendered.
//!
//! The portal's save routine serializes whatever form controls carry the
//! record's ids, so a record located through the raw payload gets one hidden
//! input per field, seeded with the value it already has.

use crate::config::FieldSpec;
use crate::driver::{ShadowInput, ShadowOutcome};
use crate::locator::RowHandle;
use crate::session::ScreenSession;
use crate::Result;
use tracing::debug;

/// Ensure the hidden input for `field` of `handle` exists.
///
/// Repeated calls in the same session never add a second element.
pub async fn ensure(
    session: &mut ScreenSession,
    handle: &RowHandle,
    field: &FieldSpec,
) -> Result<ShadowOutcome> {
    session.ensure_current(handle.session())?;

    let screen = session.screen();
    let id = screen.element_id(handle.concrete_id(field.offset));
    if session.knows_shadow(&id) {
        return Ok(ShadowOutcome::Existing);
    }

    let input = ShadowInput {
        id: id.clone(),
        record_index: handle.record_index(),
        offset: field.offset,
        value: handle
            .current_values()
            .get(&field.offset)
            .cloned()
            .unwrap_or_default(),
    };
    let form = screen.grid.form_selector.clone();
    let outcome = session.page().ensure_hidden_input(&form, &input).await?;
    if outcome == ShadowOutcome::Created {
        debug!(
            "[{}] shadow input {} for record {} offset {}",
            session.id(),
            id,
            input.record_index,
            input.offset
        );
    }
    session.remember_shadow(id);
    Ok(outcome)
}

/// Ensure hidden inputs for every field of the record. Returns how many
/// were created.
pub async fn ensure_row(session: &mut ScreenSession, handle: &RowHandle) -> Result<usize> {
    let fields = session.screen().fields.clone();
    let mut created = 0;
    for field in &fields {
        if ensure(session, handle, field).await? == ShadowOutcome::Created {
            created += 1;
        }
    }
    Ok(created)
}
