//! Finding a record's row handle.
//!
//! The grid only renders a window of its records (around 90 of several
//! hundred). A record outside that window is absent from the DOM but still
//! present in the search payload, and its ids follow the screen's positional
//! formula `base_id = record_index * record_stride`. So the locator tries the
//! rendered rows first and falls back to decoding the payload.

use crate::config::ScreenConfig;
use crate::driver::RenderedRow;
use crate::session::{ScreenSession, SessionId};
use crate::wire::{RawEntry, RawPayload};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Where a row handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    Rendered,
    RawXml,
}

/// Anchor of one record's element ids, valid only in the session that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowHandle {
    session: SessionId,
    base_id: u32,
    record_index: usize,
    source: SourceMode,
    partial_match: bool,
    current_values: BTreeMap<u32, String>,
}

impl RowHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn base_id(&self) -> u32 {
        self.base_id
    }

    pub fn record_index(&self) -> usize {
        self.record_index
    }

    pub fn source(&self) -> SourceMode {
        self.source
    }

    /// Found by substring rather than exact name; lower confidence.
    pub fn partial_match(&self) -> bool {
        self.partial_match
    }

    /// Values at locate time, by field offset. Provenance only.
    pub fn current_values(&self) -> &BTreeMap<u32, String> {
        &self.current_values
    }

    pub fn concrete_id(&self, offset: u32) -> u32 {
        self.base_id + offset
    }
}

/// Outcome of comparing a rendered row with the positional formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum AddressCheck {
    /// No raw record to compare against.
    NotAvailable,
    Match,
    Mismatch { rendered: u32, computed: u32 },
}

#[derive(Debug, Clone)]
pub struct Located {
    pub handle: RowHandle,
    pub check: AddressCheck,
}

/// Locate `display_name` in the session's grid, falling back to `raw`.
///
/// Fails with [`Error::RecordNotFound`] when every strategy misses, and with
/// [`Error::StructuralParse`] when the record can only be in a malformed part
/// of the payload.
pub async fn locate(
    session: &ScreenSession,
    display_name: &str,
    raw: Option<&RawPayload>,
) -> Result<Located> {
    let screen = session.screen();
    let rows = session.page().rendered_rows(&screen.grid).await?;
    debug!(
        "[{}] locating '{}' among {} rendered rows",
        session.id(),
        display_name,
        rows.len()
    );
    locate_in(session.id(), screen, &rows, display_name, raw)
}

/// The strategy chain, over already-fetched rows.
///
/// An exact name beats a partial one wherever it is found: an off-screen
/// record named exactly is preferred over a rendered row that only contains
/// the name.
pub fn locate_in(
    session: SessionId,
    screen: &ScreenConfig,
    rows: &[RenderedRow],
    display_name: &str,
    raw: Option<&RawPayload>,
) -> Result<Located> {
    let wanted = normalize(display_name);
    if wanted.is_empty() {
        return Err(Error::RecordNotFound(display_name.to_string()));
    }

    if let Some(row) = rows.iter().find(|r| normalize(&r.name) == wanted) {
        if let Some(handle) = from_rendered(session, screen, row, false) {
            let check = self_check(screen, &handle, raw, &wanted);
            if let AddressCheck::Mismatch { rendered, computed } = check {
                warn!(
                    "'{}': rendered base id {} but layout '{}' computes {}",
                    display_name,
                    rendered,
                    screen.version.as_deref().unwrap_or("unversioned"),
                    computed
                );
            }
            return Ok(Located { handle, check });
        }
        debug!("'{}' is rendered without addressable inputs", display_name);
    }

    if let Some(entry) = raw.and_then(|raw| find_raw(screen, raw, &wanted)) {
        let handle = from_raw(session, screen, entry)?;
        info!(
            "'{}' located in raw payload: record {} -> base id {}",
            display_name, handle.record_index, handle.base_id
        );
        return Ok(Located {
            handle,
            check: AddressCheck::NotAvailable,
        });
    }

    let partial: Vec<&RenderedRow> = rows
        .iter()
        .filter(|r| normalize(&r.name).contains(&wanted))
        .collect();
    if let Some(row) = partial.first() {
        if partial.len() > 1 {
            warn!(
                "'{}' partially matches {} rendered rows; using '{}'",
                display_name,
                partial.len(),
                row.name
            );
        }
        if let Some(handle) = from_rendered(session, screen, row, true) {
            info!("'{}' located by partial match on '{}'", display_name, row.name);
            return Ok(Located {
                handle,
                check: AddressCheck::NotAvailable,
            });
        }
    }

    // A malformed record without a readable name could be the one.
    let unreadable = raw.and_then(|raw| {
        raw.entries()
            .iter()
            .find(|e| !e.is_valid() && e.name(screen.raw_name_field).is_none())
    });
    if let Some(err) = unreadable.and_then(|e| e.error.clone()) {
        warn!("'{}' not found; payload has unreadable records", display_name);
        return Err(err.into());
    }

    Err(Error::RecordNotFound(display_name.to_string()))
}

/// Handle for a rendered row. Every field offset is below the stride, so any
/// addressable input id gives the record's block: `base = id - id % K`.
fn from_rendered(
    session: SessionId,
    screen: &ScreenConfig,
    row: &RenderedRow,
    partial_match: bool,
) -> Option<RowHandle> {
    let stride = screen.record_stride;
    if stride == 0 {
        return None;
    }
    let addressable: Vec<_> = row
        .inputs
        .iter()
        .filter(|i| screen.field_at(i.id % stride).is_some())
        .collect();
    let base_id = addressable
        .iter()
        .map(|i| i.id - i.id % stride)
        .min()?;

    let current_values: BTreeMap<u32, String> = addressable
        .iter()
        .filter(|i| i.id - i.id % stride == base_id)
        .map(|i| (i.id - base_id, i.value.clone()))
        .collect();
    if current_values.len() < addressable.len() {
        warn!(
            "row '{}' carries inputs outside block {}..{}",
            row.name,
            base_id,
            base_id + stride
        );
    }
    if addressable.len() < row.inputs.len() {
        debug!(
            "row '{}': {} input(s) match no catalog offset",
            row.name,
            row.inputs.len() - addressable.len()
        );
    }

    Some(RowHandle {
        session,
        base_id,
        record_index: (base_id / stride) as usize,
        source: SourceMode::Rendered,
        partial_match,
        current_values,
    })
}

fn from_raw(session: SessionId, screen: &ScreenConfig, entry: &RawEntry) -> Result<RowHandle> {
    if let Some(ref err) = entry.error {
        return Err(err.clone().into());
    }

    let base_id = entry.index as u32 * screen.record_stride;
    let current_values = screen
        .fields
        .iter()
        .filter_map(|f| {
            entry
                .record
                .get(f.raw_index())
                .map(|v| (f.offset, v.to_string()))
        })
        .collect();

    Ok(RowHandle {
        session,
        base_id,
        record_index: entry.index,
        source: SourceMode::RawXml,
        partial_match: false,
        current_values,
    })
}

fn find_raw<'a>(screen: &ScreenConfig, raw: &'a RawPayload, wanted: &str) -> Option<&'a RawEntry> {
    raw.entries().iter().find(|e| {
        e.name(screen.raw_name_field)
            .map(|n| normalize(n) == wanted)
            .unwrap_or(false)
    })
}

fn self_check(
    screen: &ScreenConfig,
    handle: &RowHandle,
    raw: Option<&RawPayload>,
    wanted: &str,
) -> AddressCheck {
    let Some(entry) = raw.and_then(|raw| find_raw(screen, raw, wanted)) else {
        return AddressCheck::NotAvailable;
    };
    let computed = entry.index as u32 * screen.record_stride;
    if computed == handle.base_id {
        AddressCheck::Match
    } else {
        AddressCheck::Mismatch {
            rendered: handle.base_id,
            computed,
        }
    }
}

/// Trimmed, lowercased, inner whitespace collapsed.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{self, cidades_screen, payload, FakePortal};
    use crate::driver::RenderedInput;
    use std::sync::Arc;
    use std::time::Duration;

    fn rendered(position: usize, name: &str, record_index: usize) -> RenderedRow {
        let r = fake::row(position, name, record_index);
        RenderedRow {
            position: r.position,
            name: r.name,
            inputs: r
                .inputs
                .into_iter()
                .map(|(id, value)| RenderedInput { id, value })
                .collect(),
        }
    }

    fn sid() -> SessionId {
        SessionId::for_test(7)
    }

    #[test]
    fn test_scenario_a_rendered_exact_match() {
        let screen = cidades_screen();
        let rows = vec![
            rendered(0, "BATAGUASSU", 19),
            rendered(1, "Campo Grande", 20),
        ];
        let located = locate_in(sid(), &screen, &rows, "CAMPO GRANDE", None).unwrap();
        let h = &located.handle;
        assert_eq!(h.base_id(), 340);
        assert_eq!(h.record_index(), 20);
        assert_eq!(h.source(), SourceMode::Rendered);
        assert!(!h.partial_match());
        assert_eq!(h.concrete_id(1), 341);
        assert_eq!(h.concrete_id(7), 347);
        assert_eq!(h.current_values().get(&7).map(String::as_str), Some("7"));
        assert_eq!(located.check, AddressCheck::NotAvailable);
    }

    #[test]
    fn test_base_id_survives_missing_first_column() {
        let screen = cidades_screen();
        let mut row = rendered(0, "CAMPO GRANDE", 20);
        // polo (offset 1) shown as text, not as an input
        row.inputs.retain(|i| i.id != 341);
        let located = locate_in(sid(), &screen, &[row], "CAMPO GRANDE", None).unwrap();
        let h = &located.handle;
        assert_eq!(h.base_id(), 340);
        assert_eq!(h.record_index(), 20);
        assert_eq!(h.concrete_id(7), 347);
        assert!(h.current_values().get(&1).is_none());
        assert_eq!(h.current_values().len(), 13);
    }

    #[test]
    fn test_inputs_without_catalog_offset_are_ignored() {
        let screen = cidades_screen();
        let mut row = rendered(0, "CAMPO GRANDE", 20);
        // offsets 16 (previous block) and 0 belong to no field
        row.inputs.push(RenderedInput { id: 339, value: "x".into() });
        row.inputs.push(RenderedInput { id: 340, value: "x".into() });
        let located = locate_in(sid(), &screen, &[row], "CAMPO GRANDE", None).unwrap();
        assert_eq!(located.handle.base_id(), 340);
        assert_eq!(located.handle.current_values().len(), 14);
    }

    #[test]
    fn test_exact_raw_match_beats_partial_rendered_row() {
        let screen = cidades_screen();
        let raw = RawPayload::parse(
            &payload(&["A", "B", "C", "D", "E", "F", "CORUMBA", "CORUMBA DO NORTE"]),
            screen.raw_field_count,
        );
        let rows = vec![rendered(0, "CORUMBA DO NORTE", 7)];

        let located = locate_in(sid(), &screen, &rows, "CORUMBA", Some(&raw)).unwrap();
        let h = &located.handle;
        assert_eq!(h.base_id(), 102);
        assert_eq!(h.source(), SourceMode::RawXml);
        assert!(!h.partial_match());
    }

    #[test]
    fn test_blank_name_matches_nothing() {
        let screen = cidades_screen();
        let raw = RawPayload::parse(&payload(&["A"]), screen.raw_field_count);
        let rows = vec![rendered(0, "CAMPO GRANDE", 20)];
        for name in ["", "   "] {
            let err = locate_in(sid(), &screen, &rows, name, Some(&raw)).unwrap_err();
            assert!(matches!(err, Error::RecordNotFound(_)), "{}", err);
        }
    }

    #[test]
    fn test_partial_match_is_flagged() {
        let screen = cidades_screen();
        let rows = vec![rendered(0, "CAMPO GRANDE - MS", 3)];
        let located = locate_in(sid(), &screen, &rows, "campo grande", None).unwrap();
        assert!(located.handle.partial_match());
        assert_eq!(located.handle.base_id(), 51);
    }

    #[test]
    fn test_scenario_b_raw_fallback() {
        let screen = cidades_screen();
        let raw = RawPayload::parse(
            &payload(&["A", "B", "C", "D", "E", "F", "CORUMBA", "H"]),
            screen.raw_field_count,
        );
        let rows = vec![rendered(0, "A", 0), rendered(1, "B", 1)];

        let located = locate_in(sid(), &screen, &rows, "Corumba", Some(&raw)).unwrap();
        let h = &located.handle;
        assert_eq!(h.record_index(), 6);
        assert_eq!(h.base_id(), 102);
        assert_eq!(h.source(), SourceMode::RawXml);
        assert_eq!(h.current_values().len(), 14);
        assert_eq!(h.current_values().get(&3).map(String::as_str), Some("3"));
    }

    #[test]
    fn test_rendered_and_raw_agree_on_base_id() {
        let screen = cidades_screen();
        let names = ["A", "B", "C", "D", "E"];
        let raw = RawPayload::parse(&payload(&names), screen.raw_field_count);
        let rows: Vec<RenderedRow> = names
            .iter()
            .enumerate()
            .map(|(i, n)| rendered(i, n, i))
            .collect();

        for name in names {
            let from_dom = locate_in(sid(), &screen, &rows, name, Some(&raw)).unwrap();
            let from_wire = locate_in(sid(), &screen, &[], name, Some(&raw)).unwrap();
            assert_eq!(from_dom.handle.base_id(), from_wire.handle.base_id());
            assert_eq!(from_dom.handle.record_index(), from_wire.handle.record_index());
            assert_eq!(from_dom.check, AddressCheck::Match);
            assert_eq!(from_wire.handle.source(), SourceMode::RawXml);
        }
    }

    #[test]
    fn test_self_check_reports_mismatch() {
        let screen = cidades_screen();
        let raw = RawPayload::parse(&payload(&["A", "B"]), screen.raw_field_count);
        // rendered at record 5 while the payload puts it at position 1
        let rows = vec![rendered(0, "B", 5)];
        let located = locate_in(sid(), &screen, &rows, "B", Some(&raw)).unwrap();
        assert_eq!(located.handle.base_id(), 85);
        assert_eq!(
            located.check,
            AddressCheck::Mismatch {
                rendered: 85,
                computed: 17
            }
        );
    }

    #[test]
    fn test_malformed_target_record_is_structural() {
        let screen = cidades_screen();
        let body = format!(
            "{}<r><f0>CORUMBA</f0><f1>x</f1></r>",
            payload(&["A"])
        );
        let raw = RawPayload::parse(&body, screen.raw_field_count);
        let err = locate_in(sid(), &screen, &[], "CORUMBA", Some(&raw)).unwrap_err();
        assert!(matches!(err, Error::StructuralParse(_)), "{}", err);
    }

    #[test]
    fn test_not_found() {
        let screen = cidades_screen();
        let raw = RawPayload::parse(&payload(&["A"]), screen.raw_field_count);
        let err = locate_in(sid(), &screen, &[], "ZZZ", Some(&raw)).unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(ref n) if n == "ZZZ"));
        let err = locate_in(sid(), &screen, &[], "ZZZ", None).unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_locate_reads_live_rows() {
        let fake = FakePortal::new();
        fake.render("grid", vec![fake::row(0, "CAMPO GRANDE", 20)]);
        let screen = Arc::new(cidades_screen());
        let mut session = ScreenSession::open(
            fake.boxed(),
            screen,
            Duration::from_millis(20),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        let r = crate::reconstruct::DomReconstructor::new(2, Duration::from_millis(1));
        let probe = session.grid_probe();
        session.reconstruct(&r, "grid", &probe).await.unwrap();

        let located = locate(&session, "campo grande", None).await.unwrap();
        assert_eq!(located.handle.base_id(), 340);
        assert_eq!(located.handle.session(), session.id());
    }
}
