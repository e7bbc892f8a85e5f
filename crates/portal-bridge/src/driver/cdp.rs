//! [`PortalPage`] over an `eoka` page.

use super::{
    CapturedResponse, InputState, PageProvider, PortalPage, RenderedRow, ShadowInput,
    ShadowOutcome,
};
use crate::config::params::js_literal;
use crate::config::{BrowserConfig, GridLayout, RendererInput};
use crate::{Error, Result};
use async_trait::async_trait;
use eoka::{Browser, Page};
use std::collections::BTreeMap;
use tracing::debug;

/// Records every XHR/fetch response and swallows native dialogs.
const HOOK_JS: &str = r#"
(() => {
    if (window.__pbHooked) return false;
    window.__pbHooked = true;
    window.__pbResponses = window.__pbResponses || [];
    window.__pbDialogs = window.__pbDialogs || [];

    const record = (url, status, body) => {
        const log = window.__pbResponses;
        log.push({ seq: log.length, url: String(url || ''), status: status || 0, body: String(body ?? '') });
    };

    const open = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.open = function (method, url) {
        this.__pbUrl = url;
        return open.apply(this, arguments);
    };
    const send = XMLHttpRequest.prototype.send;
    XMLHttpRequest.prototype.send = function () {
        this.addEventListener('loadend', () => {
            let body = '';
            try { body = this.responseText; } catch (e) {}
            record(this.__pbUrl, this.status, body);
        });
        return send.apply(this, arguments);
    };

    if (window.fetch) {
        const fetch = window.fetch;
        window.fetch = function (input) {
            const url = typeof input === 'string' ? input : (input && input.url);
            return fetch.apply(this, arguments).then(resp => {
                resp.clone().text().then(t => record(url, resp.status, t)).catch(() => {});
                return resp;
            });
        };
    }

    const swallow = msg => { window.__pbDialogs.push(String(msg ?? '')); return true; };
    window.alert = swallow;
    window.confirm = swallow;
    return true;
})()
"#;

const TAKE_DIALOGS_JS: &str = r#"
(() => {
    const d = window.__pbDialogs || [];
    window.__pbDialogs = [];
    return JSON.stringify(d);
})()
"#;

const REPLACE_DOCUMENT_JS: &str = r#"
((shell) => {
    document.open();
    document.write(shell);
    document.close();
    return true;
})
"#;

const INVOKE_RENDERER_JS: &str = r#"
((path, mode, body) => {
    const fn = path.split('.').reduce((o, k) => (o == null ? o : o[k]), window);
    if (typeof fn !== 'function') return false;
    if (mode === 'xhr') {
        const xml = new DOMParser().parseFromString(body, 'text/xml');
        fn({ readyState: 4, status: 200, responseText: body, responseXML: xml });
    } else {
        fn(body);
    }
    return true;
})
"#;

const ROWS_JS: &str = r#"
((rowSel, nameSel, prefix) => {
    const rows = Array.from(document.querySelectorAll(rowSel));
    return JSON.stringify(rows.map((row, position) => {
        const nameEl = nameSel ? row.querySelector(nameSel) : row;
        let name = '';
        if (nameEl) {
            name = nameEl.matches('input, select, textarea') ? nameEl.value : nameEl.textContent;
        }
        const inputs = Array.from(row.querySelectorAll('input, select, textarea'))
            .filter(el => el.id && el.id.startsWith(prefix))
            .map(el => ({ id: Number(el.id.slice(prefix.length)), value: String(el.value ?? '') }))
            .filter(i => Number.isInteger(i.id) && i.id >= 0);
        return { position, name: String(name || '').trim(), inputs };
    }));
})
"#;

const INPUT_STATE_JS: &str = r#"
((id) => {
    const el = document.getElementById(id);
    if (!el) return 'missing';
    if (el.readOnly || el.disabled) return 'readonly';
    return 'writable';
})
"#;

const SET_INPUT_JS: &str = r#"
((id, value) => {
    const el = document.getElementById(id);
    if (!el) return false;
    el.value = value;
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
})
"#;

const READ_INPUTS_JS: &str = r#"
((ids) => {
    const out = {};
    for (const id of ids) {
        const el = document.getElementById(id);
        if (el) out[id] = String(el.value ?? '');
    }
    return JSON.stringify(out);
})
"#;

const ENSURE_HIDDEN_JS: &str = r#"
((formSel, spec) => {
    if (document.getElementById(spec.id)) return 'existing';
    const form = document.querySelector(formSel);
    if (!form) return 'no_form';
    const el = document.createElement('input');
    el.type = 'hidden';
    el.id = spec.id;
    el.name = spec.id;
    el.value = spec.value;
    el.dataset.row = String(spec.record_index);
    el.dataset.offset = String(spec.offset);
    el.dataset.shadow = '1';
    form.appendChild(el);
    return 'created';
})
"#;

/// A portal page driven through `eoka`.
pub struct EokaPortal {
    page: Page,
}

impl EokaPortal {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn eval_json<T: serde::de::DeserializeOwned>(&self, js: &str) -> Result<T> {
        let json: String = self.page.evaluate(js).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl PortalPage for EokaPortal {
    async fn install_hooks(&self) -> Result<()> {
        let installed: bool = self.page.evaluate(HOOK_JS).await?;
        debug!("capture hooks {}", if installed { "installed" } else { "already present" });
        Ok(())
    }

    async fn run_script(&self, expression: &str) -> Result<()> {
        // Wrapped so that a script returning a promise or a value does not
        // leak into the CDP result.
        let js = format!("(() => {{ {}; }})()", expression.trim().trim_end_matches(';'));
        self.page
            .execute(&js)
            .await
            .map_err(|e| Error::Script(format!("'{}': {}", expression, e)))
    }

    async fn response_cursor(&self) -> Result<usize> {
        Ok(self
            .page
            .evaluate("(window.__pbResponses || []).length")
            .await?)
    }

    async fn responses_since(&self, cursor: usize) -> Result<Vec<CapturedResponse>> {
        self.eval_json(&format!(
            "JSON.stringify((window.__pbResponses || []).slice({}))",
            cursor
        ))
        .await
    }

    async fn take_dialogs(&self) -> Result<Vec<String>> {
        self.eval_json(TAKE_DIALOGS_JS).await
    }

    async fn document_html(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn replace_document(&self, shell: &str) -> Result<()> {
        let js = format!("{}({})", REPLACE_DOCUMENT_JS.trim(), js_literal(shell));
        let _: bool = self.page.evaluate(&js).await?;
        Ok(())
    }

    async fn invoke_renderer(
        &self,
        renderer: &str,
        input: RendererInput,
        body: &str,
    ) -> Result<bool> {
        let mode = match input {
            RendererInput::Text => "text",
            RendererInput::Xhr => "xhr",
        };
        let js = format!(
            "{}({}, {}, {})",
            INVOKE_RENDERER_JS.trim(),
            js_literal(renderer),
            js_literal(mode),
            js_literal(body)
        );
        self.page
            .evaluate(&js)
            .await
            .map_err(|e| Error::Script(format!("renderer '{}': {}", renderer, e)))
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        let js = format!(
            "document.querySelectorAll({}).length",
            js_literal(selector)
        );
        Ok(self.page.evaluate(&js).await?)
    }

    async fn rendered_rows(&self, grid: &GridLayout) -> Result<Vec<RenderedRow>> {
        let name_selector = grid
            .name_selector
            .as_deref()
            .map(js_literal)
            .unwrap_or_else(|| "null".into());
        let js = format!(
            "{}({}, {}, {})",
            ROWS_JS.trim(),
            js_literal(&grid.row_selector),
            name_selector,
            js_literal(&grid.id_prefix)
        );
        self.eval_json(&js).await
    }

    async fn input_state(&self, id: &str) -> Result<InputState> {
        let js = format!("{}({})", INPUT_STATE_JS.trim(), js_literal(id));
        let state: String = self.page.evaluate(&js).await?;
        Ok(match state.as_str() {
            "writable" => InputState::Writable,
            "readonly" => InputState::ReadOnly,
            _ => InputState::Missing,
        })
    }

    async fn set_input(&self, id: &str, value: &str) -> Result<bool> {
        let js = format!(
            "{}({}, {})",
            SET_INPUT_JS.trim(),
            js_literal(id),
            js_literal(value)
        );
        Ok(self.page.evaluate(&js).await?)
    }

    async fn read_inputs(&self, ids: &[String]) -> Result<BTreeMap<String, String>> {
        let js = format!(
            "{}({})",
            READ_INPUTS_JS.trim(),
            serde_json::to_string(ids)?
        );
        self.eval_json(&js).await
    }

    async fn ensure_hidden_input(
        &self,
        form_selector: &str,
        input: &ShadowInput,
    ) -> Result<ShadowOutcome> {
        let js = format!(
            "{}({}, {})",
            ENSURE_HIDDEN_JS.trim(),
            js_literal(form_selector),
            serde_json::to_string(input)?
        );
        let outcome: String = self.page.evaluate(&js).await?;
        match outcome.as_str() {
            "created" => Ok(ShadowOutcome::Created),
            "existing" => Ok(ShadowOutcome::Existing),
            _ => Err(Error::Script(format!(
                "form '{}' not found for shadow input {}",
                form_selector, input.id
            ))),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(self.page.screenshot().await?)
    }

    async fn is_reachable(&self, selector: &str) -> Result<bool> {
        let js = format!("!!document.querySelector({})", js_literal(selector));
        match self.page.evaluate::<bool>(&js).await {
            Ok(present) => Ok(present),
            Err(e) => {
                debug!("page not reachable: {}", e);
                Ok(false)
            }
        }
    }
}

/// Launches one browser and hands out a fresh tab per session.
pub struct EokaProvider {
    browser: Browser,
    url: String,
}

impl EokaProvider {
    /// Launch a browser with the job's browser config. Session bootstrap
    /// (cookies, login) is expected to be handled by the profile or proxy.
    pub async fn launch(config: &BrowserConfig, url: &str) -> Result<Self> {
        let stealth = eoka::StealthConfig {
            headless: config.headless,
            proxy: config.proxy.clone(),
            user_agent: config.user_agent.clone(),
            viewport_width: config.viewport.as_ref().map(|v| v.width).unwrap_or(1280),
            viewport_height: config.viewport.as_ref().map(|v| v.height).unwrap_or(720),
            ..Default::default()
        };

        debug!(
            "Launching browser (headless: {}, proxy: {:?})",
            config.headless, config.proxy
        );
        let browser = Browser::launch_with_config(stealth).await?;
        Ok(Self {
            browser,
            url: url.to_string(),
        })
    }

    /// Close the browser.
    pub async fn close(self) -> Result<()> {
        self.browser.close().await?;
        Ok(())
    }
}

#[async_trait]
impl PageProvider for EokaProvider {
    async fn open_page(&self) -> Result<Box<dyn PortalPage>> {
        let page = self.browser.new_page(&self.url).await?;
        Ok(Box::new(EokaPortal::new(page)))
    }
}
