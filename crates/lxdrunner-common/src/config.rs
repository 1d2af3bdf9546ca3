// Application configuration loaded from YAML.
// Search order: explicit path, $LXDRCFG, ./config.yml, $XDG_CONFIG_HOME/lxdrunner/config.yml.

use crate::constants::{self, config as keys};
use crate::errors::ConfigError;
use crate::models::LabelSet;

use lxdrunner_sdk::StringUtil;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Operating system of a runner package / configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerOs {
    Linux,
    Win,
    Osx,
}

impl RunnerOs {
    /// Name used in runner package file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerOs::Linux => "linux",
            RunnerOs::Win => "win",
            RunnerOs::Osx => "osx",
        }
    }
}

impl fmt::Display for RunnerOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture of a runner package / configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerArch {
    X64,
    Arm,
    Arm64,
}

impl RunnerArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerArch::X64 => "x64",
            RunnerArch::Arm => "arm",
            RunnerArch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for RunnerArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of compute instance to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    Container,
    VirtualMachine,
}

impl InstanceType {
    /// Value of the fleet API `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Container => "container",
            InstanceType::VirtualMachine => "virtual-machine",
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

/// A fleet endpoint or image server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// `https://host:8443` for the fleet API, or an image server URL.
    #[serde(default)]
    pub addr: Option<String>,

    /// Image server protocol (`lxd` or `simplestreams`).
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Verify the server certificate. Fleet hosts usually present a
    /// self-signed certificate that is trusted out of band.
    #[serde(default)]
    pub verify: bool,

    /// PEM client certificate presented to the fleet API.
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// PEM private key matching `cert`.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_protocol() -> String {
    "lxd".to_string()
}

// ---------------------------------------------------------------------------
// RunnerConfig
// ---------------------------------------------------------------------------

/// One entry of `runnermap`: how to build runners for a label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    pub labels: LabelSet,
    /// `alias` for a local image, `remote:alias` for an image server.
    pub image: String,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<String>,
    pub runner_os: RunnerOs,
    pub runner_arch: RunnerArch,
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    pub setup_script: PathBuf,
    /// Concurrent instances for this configuration. Falls back to the
    /// global `max_workers`.
    #[serde(default)]
    pub max_workers: Option<usize>,
}

fn default_profiles() -> Vec<String> {
    vec!["default".to_string()]
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Personal access token for the CI provider API.
    pub pat: String,

    /// Managed-name prefix for instances and runners.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Package cache directory.
    #[serde(default)]
    pub pkgdir: Option<PathBuf>,

    /// Lifecycle tasks allowed to run at once, across all configurations.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Delete instances whose launch failed. Disable to keep them for
    /// inspection.
    #[serde(default = "default_true")]
    pub cleanup: bool,

    #[serde(default)]
    pub remotes: HashMap<String, RemoteConfig>,

    pub runnermap: Vec<RunnerConfig>,

    #[serde(default = "default_github_url")]
    pub github_url: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_prefix() -> String {
    constants::DEFAULT_PREFIX.to_string()
}

fn default_max_workers() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_github_url() -> String {
    keys::DEFAULT_GITHUB_URL.to_string()
}

fn default_api_url() -> String {
    keys::DEFAULT_API_URL.to_string()
}

impl AppConfig {
    /// Parse, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Resolve which file to load. An explicit path always wins, even if it
    /// does not exist (the read error is more useful than a search failure).
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        let candidates = Self::candidate_paths();
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| {
                let searched: Vec<String> =
                    candidates.iter().map(|p| p.display().to_string()).collect();
                ConfigError::NotFound(searched.join(" | "))
            })
    }

    /// Default search locations, highest priority first.
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(p) = env::var(keys::FILE_ENV_VAR) {
            if !p.is_empty() {
                paths.push(PathBuf::from(p));
            }
        }
        paths.push(PathBuf::from(keys::FILE_NAME));
        if let Some(dir) = xdg_dir("XDG_CONFIG_HOME", ".config") {
            paths.push(dir.join(keys::APP_DIR).join(keys::FILE_NAME));
        }
        paths
    }

    /// Environment overrides applied after parsing.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(keys::CLEANUP_ENV_VAR) {
            if let Some(cleanup) = StringUtil::convert_to_bool(&val) {
                self.cleanup = cleanup;
            }
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("prefix must not be empty".into()));
        }
        if self.max_workers == 0 || self.max_workers > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "max_workers must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if !self.remotes.contains_key(constants::MAIN_REMOTE) {
            return Err(ConfigError::Invalid(format!(
                "remote '{}' is required",
                constants::MAIN_REMOTE
            )));
        }
        if self.runnermap.is_empty() {
            return Err(ConfigError::Invalid("runnermap is empty".into()));
        }

        let mut seen = HashSet::new();
        for rc in &self.runnermap {
            if rc.labels.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "runner config '{}' has no labels",
                    rc.name
                )));
            }
            if let Some(n) = rc.max_workers {
                if n == 0 || n > Semaphore::MAX_PERMITS {
                    return Err(ConfigError::Invalid(format!(
                        "runner config '{}' has max_workers {}, expected 1 to {}",
                        rc.name,
                        n,
                        Semaphore::MAX_PERMITS
                    )));
                }
            }
            if !seen.insert(rc.labels.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "label set {} is used by more than one runner config",
                    rc.labels
                )));
            }
            if let Some((remote, _)) = rc.image.split_once(':') {
                if !self.remotes.contains_key(remote) {
                    return Err(ConfigError::Invalid(format!(
                        "runner config '{}' uses unknown remote '{}'",
                        rc.name, remote
                    )));
                }
            }
        }
        Ok(())
    }

    /// The fleet endpoint the engine drives.
    pub fn main_remote(&self) -> Result<&RemoteConfig, ConfigError> {
        self.remotes.get(constants::MAIN_REMOTE).ok_or_else(|| {
            ConfigError::Invalid(format!("remote '{}' is required", constants::MAIN_REMOTE))
        })
    }

    /// Package cache directory, defaulting under the XDG cache dir.
    pub fn package_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.pkgdir {
            return dir.clone();
        }
        xdg_dir("XDG_CACHE_HOME", ".cache")
            .map(|d| d.join(keys::APP_DIR).join("packages"))
            .unwrap_or_else(|| PathBuf::from("packages"))
    }

    /// Concurrency ceiling for one runner configuration.
    pub fn max_workers_for(&self, rc: &RunnerConfig) -> usize {
        rc.max_workers.unwrap_or(self.max_workers)
    }
}

/// `$var`, or `$HOME/<fallback>` when unset.
fn xdg_dir(var: &str, fallback: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => env::var("HOME").ok().map(|home| Path::new(&home).join(fallback)),
    }
}
