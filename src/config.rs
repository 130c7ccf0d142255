use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::hash::HashAlgorithm;

/// repository configuration stored in config.toml
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub core: Core,
    /// the single upstream this repository mirrors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Remote>,
    /// branch checked out as HEAD at clone time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Core {
    #[serde(default)]
    pub object_format: HashAlgorithm,
}

impl Config {
    pub fn new(object_format: HashAlgorithm) -> Self {
        Self {
            core: Core { object_format },
            remote: None,
            default_branch: None,
        }
    }

    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file, replacing it atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).with_path(&tmp)?;
        std::fs::rename(&tmp, path).with_path(path)?;
        Ok(())
    }

    /// url of the configured remote, if any
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.url.as_str())
    }
}

/// the configured remote repository
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub url: String,
    pub provider: String,
}

impl Remote {
    pub fn origin(url: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: "origin".to_string(),
            url: url.into(),
            provider: provider.into(),
        }
    }
}

/// engine-wide tunables, read from `<base>/settings.toml` when present
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// extra attempts for remote ref listing after a network failure
    pub list_retries: u32,
    /// delay before the first retry, doubled on each further attempt
    pub retry_backoff_ms: u64,
    /// upper bound on `have` lines sent during negotiation
    pub max_haves: usize,
    /// number of progress events a transfer is split into
    pub progress_steps: u64,
    /// ssh client program
    pub ssh_program: String,
    pub connect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            list_retries: 2,
            retry_backoff_ms: 200,
            max_haves: 256,
            progress_steps: 100,
            ssh_program: "ssh".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub const FILE_NAME: &'static str = "settings.toml";

    /// load settings from the base directory, falling back to defaults
    pub fn load(base: &Path) -> Result<Self> {
        let path = base.join(Self::FILE_NAME);
        let mut settings = if path.is_file() {
            let content = std::fs::read_to_string(&path).with_path(&path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };

        if let Ok(program) = std::env::var("HIGIT_SSH") {
            if !program.is_empty() {
                settings.ssh_program = program;
            }
        }
        Ok(settings)
    }
}
