use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use wb_session::SessionConfig;

const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "workbench.db";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding the package files.
    pub root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub session: SessionConfig,
}

impl CliConfig {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse workbench config")
    }

    /// Reads `explicit` when given, otherwise the per-user config file if it
    /// exists; an absent default file yields the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn resolve_root(&self, flag: Option<PathBuf>) -> Result<PathBuf> {
        match flag.or_else(|| self.root.clone()) {
            Some(root) => Ok(root),
            None => std::env::current_dir().context("Failed to resolve current directory"),
        }
    }

    pub fn resolve_database(&self, flag: Option<PathBuf>) -> Result<PathBuf> {
        let dir = flag
            .or_else(|| self.data_dir.clone())
            .or_else(|| dirs::data_dir().map(|dir| dir.join("wb")))
            .context("No data directory available; pass --data-dir")?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data dir {}", dir.display()))?;
        Ok(dir.join(DATABASE_FILE))
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wb").join(CONFIG_FILE))
}

pub fn tabs_scope(package: &str) -> String {
    format!("workbench:{package}:tabs")
}
