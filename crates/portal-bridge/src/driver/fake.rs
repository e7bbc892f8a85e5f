//! In-memory [`PortalPage`] for tests.
//!
//! Scripts are matched by substring: a scripted reply fires when its key
//! appears in the expression passed to `run_script`. The renderer "paints"
//! the rows registered for the exact body it is given.

use super::{
    CapturedResponse, InputState, PortalPage, RenderedInput, RenderedRow, ShadowInput,
    ShadowOutcome,
};
use crate::config::{FieldSpec, GridLayout, RendererInput, ScreenConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) const ROW_SELECTOR: &str = "tr.linha";
pub(crate) const READY_SELECTOR: &str = "#frmCidades";
pub(crate) const SENTINEL_SELECTOR: &str = "#pendente";
pub(crate) const STRIDE: u32 = 17;
pub(crate) const FIELD_NAMES: [&str; 14] = [
    "polo",
    "tipo_frete",
    "regiao",
    "rota",
    "km",
    "pedagio",
    "prazo",
    "tde",
    "trt",
    "tda",
    "gris",
    "advalorem",
    "restricao",
    "observacao",
];

/// The screen used across the crate's tests: 14 fields at offsets 1..=14,
/// `K = 17`, name in `f0`.
pub(crate) fn cidades_screen() -> ScreenConfig {
    let fields = FIELD_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let offset = i as u32 + 1;
            match *name {
                "polo" => FieldSpec::new(*name, offset, 1).with_domain(&["P", "S", "N"]),
                "tipo_frete" => FieldSpec::new(*name, offset, 3).with_domain(&["CIF", "FOB"]),
                "prazo" => FieldSpec::new(*name, offset, 3),
                "observacao" => FieldSpec::new(*name, offset, 40),
                _ => FieldSpec::new(*name, offset, 10),
            }
        })
        .collect();

    ScreenConfig {
        name: "cidades".into(),
        version: Some("test".into()),
        open: "abreOpcao('cidades')".into(),
        close: Some("fechaOpcao()".into()),
        ready_selector: READY_SELECTOR.into(),
        search: "pesquisaCidade(${query})".into(),
        commit: "gravaCidades()".into(),
        response_match: None,
        commit_response_match: None,
        renderer: "carregaGrid".into(),
        renderer_input: RendererInput::Text,
        grid: GridLayout {
            row_selector: ROW_SELECTOR.into(),
            name_selector: Some("td.nome".into()),
            form_selector: "form".into(),
            id_prefix: String::new(),
        },
        min_rows: 1,
        record_stride: STRIDE,
        raw_name_field: 0,
        raw_field_count: 15,
        sentinel: Some(SENTINEL_SELECTOR.into()),
        fields,
    }
}

/// A 15-field raw record for `name`; field `i` holds `"{i}"`.
pub(crate) fn raw_record(name: &str) -> String {
    let mut out = format!("<r><f0>{}</f0>", name);
    for i in 1..15 {
        out.push_str(&format!("<f{i}>{i}</f{i}>"));
    }
    out.push_str("</r>");
    out
}

pub(crate) fn payload(names: &[&str]) -> String {
    names.iter().map(|n| raw_record(n)).collect()
}

/// Rendered row for the record at `record_index`, with inputs at
/// `index * K + 1 ..= index * K + 14`.
pub(crate) fn row(position: usize, name: &str, record_index: usize) -> FakeRow {
    let base = record_index as u32 * STRIDE;
    FakeRow {
        position,
        name: name.into(),
        inputs: (1..=14).map(|o| (base + o, o.to_string())).collect(),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeRow {
    pub position: usize,
    pub name: String,
    pub inputs: Vec<(u32, String)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeInput {
    pub value: String,
    pub readonly: bool,
    pub shadow: bool,
    pub events: u32,
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub hooks_installed: u32,
    pub scripts: Vec<String>,
    pub responses: Vec<CapturedResponse>,
    /// trigger key -> responses (url, body) produced by it
    pub replies: Vec<(String, Vec<(String, String)>)>,
    /// trigger key -> dialog text raised by it
    pub dialog_replies: Vec<(String, String)>,
    pub dialogs: Vec<String>,
    /// body -> rows the renderer paints for it
    pub renders: HashMap<String, Vec<FakeRow>>,
    pub renderer_missing_calls: u32,
    pub renderer_calls: u32,
    pub rows: Vec<FakeRow>,
    pub inputs: BTreeMap<String, FakeInput>,
    pub readonly_ids: Vec<String>,
    /// every successful `set_input`, in order
    pub writes: Vec<(String, String)>,
    pub form_present: bool,
    pub reachable: bool,
    /// trigger key that makes the screen close itself
    pub close_on: Option<String>,
    pub sentinel_present: bool,
    /// trigger key after which the re-rendered grid has no sentinel
    pub sentinel_cleared_by: Option<String>,
    pub sentinel_probes: u32,
    pub documents_replaced: u32,
}

#[derive(Clone)]
pub(crate) struct FakePortal {
    state: Arc<Mutex<FakeState>>,
}

impl FakePortal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                form_present: true,
                reachable: true,
                ..Default::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    pub fn boxed(&self) -> Box<dyn PortalPage> {
        Box::new(self.clone())
    }

    /// `key` in a script produces one response with `body`.
    pub fn reply(&self, key: &str, body: &str) -> &Self {
        self.reply_many(key, &[("/portal/acao.asp", body)])
    }

    pub fn reply_many(&self, key: &str, responses: &[(&str, &str)]) -> &Self {
        let responses = responses
            .iter()
            .map(|(u, b)| (u.to_string(), b.to_string()))
            .collect();
        self.state().replies.push((key.into(), responses));
        self
    }

    pub fn dialog_on(&self, key: &str, text: &str) -> &Self {
        self.state().dialog_replies.push((key.into(), text.into()));
        self
    }

    pub fn render(&self, body: &str, rows: Vec<FakeRow>) -> &Self {
        self.state().renders.insert(body.into(), rows);
        self
    }

    pub fn network_scripts(&self, key: &str) -> usize {
        self.state().scripts.iter().filter(|s| s.contains(key)).count()
    }

    fn paint(state: &mut FakeState, rows: Vec<FakeRow>) {
        for row in &rows {
            for (id, value) in &row.inputs {
                let key = id.to_string();
                let readonly = state.readonly_ids.contains(&key);
                state.inputs.insert(
                    key,
                    FakeInput {
                        value: value.clone(),
                        readonly,
                        ..Default::default()
                    },
                );
            }
        }
        state.rows = rows;
    }
}

#[async_trait]
impl PortalPage for FakePortal {
    async fn install_hooks(&self) -> Result<()> {
        self.state().hooks_installed += 1;
        Ok(())
    }

    async fn run_script(&self, expression: &str) -> Result<()> {
        let mut state = self.state();
        if !state.reachable {
            return Err(Error::Script(format!("'{}': target closed", expression)));
        }
        state.scripts.push(expression.to_string());

        let produced: Vec<(String, String)> = state
            .replies
            .iter()
            .filter(|(key, _)| expression.contains(key.as_str()))
            .flat_map(|(_, r)| r.clone())
            .collect();
        for (url, body) in produced {
            let seq = state.responses.len();
            state.responses.push(CapturedResponse {
                seq,
                url,
                status: 200,
                body,
            });
        }

        let dialogs: Vec<String> = state
            .dialog_replies
            .iter()
            .filter(|(key, _)| expression.contains(key.as_str()))
            .map(|(_, text)| text.clone())
            .collect();
        state.dialogs.extend(dialogs);

        if let Some(key) = state.close_on.clone() {
            if expression.contains(&key) {
                state.reachable = false;
            }
        }
        if let Some(key) = state.sentinel_cleared_by.clone() {
            if expression.contains(&key) {
                state.sentinel_present = false;
            }
        }
        Ok(())
    }

    async fn response_cursor(&self) -> Result<usize> {
        Ok(self.state().responses.len())
    }

    async fn responses_since(&self, cursor: usize) -> Result<Vec<CapturedResponse>> {
        Ok(self.state().responses.iter().skip(cursor).cloned().collect())
    }

    async fn take_dialogs(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut self.state().dialogs))
    }

    async fn document_html(&self) -> Result<String> {
        Ok(format!(
            "<html><body><form id=\"frmCidades\">{} rows</form></body></html>",
            self.state().rows.len()
        ))
    }

    async fn replace_document(&self, _shell: &str) -> Result<()> {
        let mut state = self.state();
        state.documents_replaced += 1;
        state.rows.clear();
        state.inputs.clear();
        Ok(())
    }

    async fn invoke_renderer(
        &self,
        _renderer: &str,
        _input: RendererInput,
        body: &str,
    ) -> Result<bool> {
        let mut state = self.state();
        if state.renderer_missing_calls > 0 {
            state.renderer_missing_calls -= 1;
            return Ok(false);
        }
        state.renderer_calls += 1;
        let rows = state.renders.get(body).cloned().unwrap_or_default();
        Self::paint(&mut state, rows);
        Ok(true)
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        let mut state = self.state();
        Ok(match selector {
            ROW_SELECTOR => state.rows.len(),
            SENTINEL_SELECTOR => {
                state.sentinel_probes += 1;
                usize::from(state.sentinel_present && state.reachable)
            }
            READY_SELECTOR => usize::from(state.reachable),
            _ => 0,
        })
    }

    async fn rendered_rows(&self, _grid: &GridLayout) -> Result<Vec<RenderedRow>> {
        Ok(self
            .state()
            .rows
            .iter()
            .map(|r| RenderedRow {
                position: r.position,
                name: r.name.clone(),
                inputs: r
                    .inputs
                    .iter()
                    .map(|(id, value)| RenderedInput {
                        id: *id,
                        value: value.clone(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn input_state(&self, id: &str) -> Result<InputState> {
        Ok(match self.state().inputs.get(id) {
            None => InputState::Missing,
            Some(i) if i.readonly => InputState::ReadOnly,
            Some(_) => InputState::Writable,
        })
    }

    async fn set_input(&self, id: &str, value: &str) -> Result<bool> {
        let mut state = self.state();
        let Some(input) = state.inputs.get_mut(id) else {
            return Ok(false);
        };
        input.value = value.to_string();
        input.events += 2;
        state.writes.push((id.to_string(), value.to_string()));
        Ok(true)
    }

    async fn read_inputs(&self, ids: &[String]) -> Result<BTreeMap<String, String>> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.inputs.get(id).map(|i| (id.clone(), i.value.clone())))
            .collect())
    }

    async fn ensure_hidden_input(
        &self,
        form_selector: &str,
        input: &ShadowInput,
    ) -> Result<ShadowOutcome> {
        let mut state = self.state();
        if state.inputs.contains_key(&input.id) {
            return Ok(ShadowOutcome::Existing);
        }
        if !state.form_present {
            return Err(Error::Script(format!("form '{}' not found", form_selector)));
        }
        state.inputs.insert(
            input.id.clone(),
            FakeInput {
                value: input.value.clone(),
                shadow: true,
                ..Default::default()
            },
        );
        Ok(ShadowOutcome::Created)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn is_reachable(&self, _selector: &str) -> Result<bool> {
        Ok(self.state().reachable)
    }
}
