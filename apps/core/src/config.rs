use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "step.rc";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub no_startup: bool,
    pub auto_hide_modules: bool,
    pub set_as_shell: bool,
    pub use_system_dde: bool,
    pub no_shell_warning: bool,
    pub modules: Vec<ModuleEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            no_startup: false,
            auto_hide_modules: true,
            set_as_shell: true,
            use_system_dde: true,
            no_shell_warning: false,
            modules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct ModuleEntry {
    pub path: String,
    pub threaded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
    Json5,
}

fn format_for(path: &Path) -> Format {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => Format::Json,
        Some("json5") => Format::Json5,
        _ => Format::Toml,
    }
}

pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let settings = parse(&raw, format_for(path)).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })?;
    validate(&settings)?;
    Ok(settings)
}

/// Like [`load`] but falls back to defaults when the file is unreadable or not
/// in a format this crate understands.
pub fn load_or_default(path: &Path) -> Settings {
    match load(path) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::warn!(%error, "using default settings");
            Settings::default()
        }
    }
}

fn parse(raw: &str, format: Format) -> Result<Settings, String> {
    match format {
        Format::Toml => toml::from_str(raw).map_err(|e| e.to_string()),
        Format::Json => serde_json::from_str(raw).map_err(|e| e.to_string()),
        Format::Json5 => json5::from_str(raw).map_err(|e| e.to_string()),
    }
}

pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if let Some(index) = settings
        .modules
        .iter()
        .position(|module| module.path.trim().is_empty())
    {
        return Err(ConfigError::Invalid(format!(
            "modules[{index}].path is required"
        )));
    }
    Ok(())
}

pub fn resolve_module_path(app_dir: &Path, raw: &str) -> PathBuf {
    let trimmed = raw.trim().trim_matches('"');
    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        app_dir.join(candidate)
    }
}

pub fn stable_app_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA").filter(|v| !v.is_empty()) {
            return PathBuf::from(appdata).join("stepshell");
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(data).join("stepshell");
        }
        if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(home).join(".local").join("share").join("stepshell");
        }
    }

    std::env::temp_dir().join("stepshell")
}
