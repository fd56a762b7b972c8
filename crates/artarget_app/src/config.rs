use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context};
use artarget_engine::EngineSettings;
use artarget_logging::{pipeline_info, LogDestination};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_CONFIG_FILENAME: &str = "artarget.ron";

/// Everything the binary reads from its config file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub engine: EngineSettings,
    pub compiler: CompilerConfig,
    pub log: LogConfig,
}

/// External program that turns an image into a `.mind` artifact. It is
/// invoked as `program args.. <input> <output>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct CompilerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mindar-compile"),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    pub terminal: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            terminal: true,
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> anyhow::Result<LevelFilter> {
        LevelFilter::from_str(&self.level)
            .with_context(|| format!("unknown log level {:?}", self.level))
    }

    pub fn destination(&self) -> LogDestination {
        match (&self.file, self.terminal) {
            (Some(path), true) => LogDestination::Both(path.clone()),
            (Some(path), false) => LogDestination::File(path.clone()),
            (None, _) => LogDestination::Terminal,
        }
    }
}

/// Reads `path`. A missing file yields the defaults; a malformed one is an error.
pub(crate) fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AppConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {}", path.display()));
        }
    };
    ron::from_str(&content).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Writes the default config to `path`, refusing to clobber an existing file
/// unless `force` is set.
pub(crate) fn write_default_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    let pretty = ron::ser::PrettyConfig::new();
    let content = ron::ser::to_string_pretty(&AppConfig::default(), pretty)
        .context("failed to serialize default config")?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    pipeline_info!("Wrote default config to {:?}", path);
    Ok(())
}
