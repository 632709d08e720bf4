use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessSpec>,
}

/// One supervised process: `[[process]]` in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    /// Label used in logs and errors. Defaults to the command.
    #[serde(default)]
    name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: None,
            command: command.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.command)
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            processes: vec![
                ProcessSpec::new("postgres", &["-D", "/usr/local/var/postgres"]),
                ProcessSpec::new("etcd", &[]),
            ],
        }
    }
}

/// Errors that can occur while loading the configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// The file lists no processes.
    NoProcesses { path: PathBuf },
    /// A `[[process]]` entry has an empty command.
    EmptyCommand { index: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ConfigError::NoProcesses { path } => {
                write!(f, "{} lists no [[process]] entries", path.display())
            }
            ConfigError::EmptyCommand { index } => {
                write!(f, "process #{} has an empty command", index + 1)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::NoProcesses { .. } | ConfigError::EmptyCommand { .. } => None,
        }
    }
}

/// Load the configuration from `path`, or the defaults if the file does not exist.
pub fn load(path: &Path) -> Result<WardenConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(WardenConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let config: WardenConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    if config.processes.is_empty() {
        return Err(ConfigError::NoProcesses {
            path: path.to_path_buf(),
        });
    }

    if let Some(index) = config
        .processes
        .iter()
        .position(|spec| spec.command.trim().is_empty())
    {
        return Err(ConfigError::EmptyCommand { index });
    }

    Ok(config)
}

#[cfg(test)]
impl ProcessSpec {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
