use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Runtime parameters for a job file.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse from CLI args like "key=value".
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut params = Self::new();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                Error::Config(format!("invalid param '{}', expected key=value", arg))
            })?;
            params.values.insert(key.trim().to_string(), value.to_string());
        }
        Ok(params)
    }
}

/// Parameter definition in a job file.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamDef {
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided.
    pub default: Option<String>,

    pub description: Option<String>,
}

/// Names reserved for run-time substitution into screen scripts. They are
/// left untouched when the job file is loaded.
const RUNTIME_VARS: &[&str] = &["query"];

/// Substitute `${var}` and `${env:VAR}` patterns in a string.
pub fn substitute(
    template: &str,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let token = &rest[start..start + len + 1];
        let name = &token[2..token.len() - 1];

        if let Some(var) = name.strip_prefix("env:") {
            let value = std::env::var(var).map_err(|_| {
                Error::Config(format!("environment variable {} is not set", var))
            })?;
            out.push_str(&value);
        } else if let Some(v) = params.get(name) {
            out.push_str(v);
        } else if let Some(def) = defs.get(name) {
            match (&def.default, def.required) {
                (Some(default), _) => out.push_str(default),
                (None, true) => {
                    return Err(Error::Config(format!(
                        "missing required parameter: {}",
                        name
                    )))
                }
                (None, false) => {}
            }
        } else if RUNTIME_VARS.contains(&name) {
            out.push_str(token);
        } else {
            return Err(Error::Config(format!("unknown parameter: {}", name)));
        }

        rest = &rest[start + len + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Recursively substitute params in a serde_yaml::Value.
pub fn substitute_value(
    value: &mut serde_yaml::Value,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = substitute(s, params, defs)?;
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Quote a string as a JavaScript literal.
pub fn js_literal(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

/// Fill `${name}` slots of a screen script with quoted JS literals, e.g.
/// `pesquisa(${query})` becomes `pesquisa("CAMPO")`.
pub fn render_script(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("${{{}}}", name), &js_literal(value))
    })
}
