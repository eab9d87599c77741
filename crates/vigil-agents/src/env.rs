use std::collections::BTreeMap;
use std::path::Path;

use crate::error::AgentError;

/// Set last so agent output arrives unbuffered and UTF-8 encoded.
pub const FIXED_OVERRIDES: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
];

/// Environment sources for an agent launch, lowest precedence first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvLayers {
    pub system: BTreeMap<String, String>,
    pub project: BTreeMap<String, String>,
    pub credentials: BTreeMap<String, String>,
}

impl EnvLayers {
    /// Layers seeded with the current process environment. Non-UTF-8
    /// variables are skipped.
    pub fn from_system() -> Self {
        Self {
            system: std::env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_project(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.project.extend(vars);
        self
    }

    pub fn with_credentials(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.credentials.extend(vars);
        self
    }

    pub fn build(&self) -> BTreeMap<String, String> {
        let mut merged = self.system.clone();
        merged.extend(self.project.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(self.credentials.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in FIXED_OVERRIDES {
            merged.insert((*key).to_string(), (*value).to_string());
        }
        merged
    }
}

/// Read a dotenv file. A missing file is an empty map.
pub fn load_dotenv(path: &Path) -> Result<BTreeMap<String, String>, AgentError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(AgentError::EnvFileRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_dotenv(&raw).map_err(|(line, message)| AgentError::EnvFileParse {
        path: path.to_path_buf(),
        line,
        message,
    })
}

fn parse_dotenv(raw: &str) -> Result<BTreeMap<String, String>, (usize, String)> {
    let mut vars = BTreeMap::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err((index + 1, "missing '='".to_string()));
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err((index + 1, format!("invalid key '{key}'")));
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
