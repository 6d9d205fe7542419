//! Configuration for shellscribe.
//!
//! Configuration sources (highest priority first):
//! 1. `SHELLSCRIBE_HOME` environment variable (state directory)
//! 2. Config file (`.shellscribe/config.yaml`)
//! 3. Defaults (`~/.shellscribe`)
//!
//! Config file discovery:
//! - Searches the current directory and its parents for `.shellscribe/config.yaml`
//! - Storage paths in the config file are relative to the state directory

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::core::PolicyConfig;
use crate::domain::Tier;
use crate::inference::InferenceConfig;

/// Name of the per-project state directory
pub const STATE_DIR_NAME: &str = ".shellscribe";

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "SHELLSCRIBE_HOME";

const CONFIG_FILE_NAME: &str = "config.yaml";
const PLUGINS_FILE_NAME: &str = "plugins.yaml";

/// Config file schema (matches YAML structure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Refuse anything but loopback network access for inference
    #[serde(default = "default_true")]
    pub offline: bool,

    /// Simulate every task instead of acting on targets
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Targets permitted for live action (exact or glob)
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Inference runtime name
    #[serde(default = "default_llm_runtime")]
    pub llm_runtime: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub policy: PolicySection,

    /// Module worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_runs_dir")]
    pub runs_dir: String,

    #[serde(default = "default_findings_db")]
    pub findings_db: String,

    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    /// Tiers whose tasks wait for an approval signal
    #[serde(default = "default_approval_tiers")]
    pub approval_tiers: Vec<Tier>,
}

fn default_true() -> bool {
    true
}

fn default_llm_runtime() -> String {
    "llama_cpp".to_string()
}

fn default_workers() -> usize {
    crate::core::orchestrator::DEFAULT_WORKERS
}

fn default_runs_dir() -> String {
    "runs".to_string()
}

fn default_findings_db() -> String {
    "findings.db".to_string()
}

fn default_artifacts_dir() -> String {
    "artifacts".to_string()
}

fn default_approval_tiers() -> Vec<Tier> {
    PolicyConfig::default().approval_tiers
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            findings_db: default_findings_db(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            approval_tiers: default_approval_tiers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            offline: true,
            dry_run: true,
            allowlist: Vec::new(),
            llm_runtime: default_llm_runtime(),
            storage: StorageConfig::default(),
            policy: PolicySection::default(),
            workers: default_workers(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Config {
    /// Load and parse a config file
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Write the config file atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        write_atomic(path, &yaml)
    }

    /// Policy settings derived from this config
    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            dry_run: self.dry_run,
            allowlist: self.allowlist.clone(),
            approval_tiers: self.policy.approval_tiers.clone(),
        }
    }

    /// Value at a dotted key (e.g. `storage.runs_dir`)
    pub fn get(&self, key: &str) -> Result<Value> {
        let root = serde_yaml::to_value(self).context("Failed to serialize config")?;
        let mut current = &root;
        for segment in key.split('.') {
            current = current
                .get(segment)
                .with_context(|| format!("Unknown config key: {}", key))?;
        }
        Ok(current.clone())
    }

    /// Copy of this config with a dotted key set. `raw` is parsed as YAML, so
    /// `false`, `8` and `[a, b]` keep their types.
    pub fn with_value(&self, key: &str, raw: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(raw)
            .with_context(|| format!("Invalid value for {}: {}", key, raw))?;

        let mut root = serde_yaml::to_value(self).context("Failed to serialize config")?;
        set_dotted(&mut root, key, value)?;

        serde_yaml::from_value(root).with_context(|| format!("Invalid setting {}={}", key, raw))
    }
}

fn set_dotted(root: &mut Value, key: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        anyhow::bail!("Invalid config key: {}", key);
    }

    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        let mapping = current
            .as_mapping_mut()
            .with_context(|| format!("Config key {} is not a section", key))?;
        current = mapping
            .entry(Value::String(segment.to_string()))
            .or_insert_with(|| Value::Mapping(Default::default()));
    }

    let last = segments[segments.len() - 1];
    current
        .as_mapping_mut()
        .with_context(|| format!("Config key {} is not a section", key))?
        .insert(Value::String(last.to_string()), value);
    Ok(())
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, content.as_bytes())
        .context("Failed to write config")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory (`.shellscribe`)
    pub state_dir: PathBuf,

    /// Path to the config file (if found)
    pub config_file: Option<PathBuf>,

    pub config: Config,
}

impl ResolvedConfig {
    fn resolve(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.state_dir.join(path)
        }
    }

    /// Directory holding one event log per run
    pub fn runs_dir(&self) -> PathBuf {
        self.resolve(&self.config.storage.runs_dir)
    }

    pub fn findings_db(&self) -> PathBuf {
        self.resolve(&self.config.storage.findings_db)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.resolve(&self.config.storage.artifacts_dir)
    }

    pub fn plugins_path(&self) -> PathBuf {
        self.state_dir.join(PLUGINS_FILE_NAME)
    }

    /// Config file to edit: the discovered one, else the state directory's
    pub fn config_path(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join(CONFIG_FILE_NAME))
    }
}

/// Find the config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(STATE_DIR_NAME).join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Resolve configuration from an explicit start directory and home override
fn resolve_from(start: &Path, home_override: Option<PathBuf>) -> Result<ResolvedConfig> {
    if let Some(state_dir) = home_override {
        let config_path = state_dir.join(CONFIG_FILE_NAME);
        let (config, config_file) = if config_path.exists() {
            (Config::load_file(&config_path)?, Some(config_path))
        } else {
            (Config::default(), None)
        };
        return Ok(ResolvedConfig {
            state_dir,
            config_file,
            config,
        });
    }

    if let Some(config_path) = find_config_file(start) {
        let config = Config::load_file(&config_path)?;
        let state_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(STATE_DIR_NAME));
        return Ok(ResolvedConfig {
            state_dir,
            config_file: Some(config_path),
            config,
        });
    }

    let state_dir = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(STATE_DIR_NAME);
    Ok(ResolvedConfig {
        state_dir,
        config_file: None,
        config: Config::default(),
    })
}

/// Load configuration from all sources
pub fn load() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let home = std::env::var_os(HOME_ENV).map(PathBuf::from);
    resolve_from(&cwd, home)
}

/// Create `.shellscribe/` with a default config under `root`. An existing
/// config file is left untouched. Returns the config file path.
pub fn project_init(root: &Path) -> Result<PathBuf> {
    let state_dir = root.join(STATE_DIR_NAME);
    let config_path = state_dir.join(CONFIG_FILE_NAME);

    if !config_path.exists() {
        Config::default().save(&config_path)?;
    }

    let resolved = ResolvedConfig {
        config: Config::load_file(&config_path)?,
        config_file: Some(config_path.clone()),
        state_dir,
    };
    std::fs::create_dir_all(resolved.runs_dir())
        .with_context(|| format!("Failed to create {}", resolved.runs_dir().display()))?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.offline);
        assert!(config.dry_run);
        assert!(config.allowlist.is_empty());
        assert_eq!(config.llm_runtime, "llama_cpp");
        assert_eq!(config.storage.runs_dir, "runs");
        assert_eq!(config.workers, 4);
        assert_eq!(config.policy.approval_tiers, vec![Tier::High, Tier::Critical]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
dry_run: false
allowlist: ["10.0.0.*"]
storage:
  runs_dir: /var/lib/shellscribe/runs
"#,
        )
        .unwrap();

        assert!(config.offline);
        assert!(!config.dry_run);
        assert_eq!(config.storage.runs_dir, "/var/lib/shellscribe/runs");
        assert_eq!(config.storage.findings_db, "findings.db");

        let policy = config.policy_config();
        assert!(!policy.dry_run);
        assert!(policy.is_allowlisted("10.0.0.5"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(serde_yaml::from_str::<Config>("dryrun: false\n").is_err());
    }

    #[test]
    fn test_get_and_set_dotted_keys() {
        let config = Config::default();
        assert_eq!(config.get("dry_run").unwrap(), Value::Bool(true));
        assert_eq!(
            config.get("storage.runs_dir").unwrap(),
            Value::String("runs".to_string())
        );
        assert!(config.get("storage.nope").is_err());

        let updated = config
            .with_value("dry_run", "false")
            .unwrap()
            .with_value("policy.approval_tiers", "[critical]")
            .unwrap()
            .with_value("inference.endpoint", "http://127.0.0.1:9000")
            .unwrap();
        assert!(!updated.dry_run);
        assert_eq!(updated.policy.approval_tiers, vec![Tier::Critical]);
        assert_eq!(updated.inference.endpoint, "http://127.0.0.1:9000");

        assert!(config.with_value("workers", "many").is_err());
        assert!(config.with_value("policy.approval_tiers", "[urgent]").is_err());
        assert!(config.with_value("bogus", "1").is_err());
    }

    #[test]
    fn test_project_init_and_discovery() {
        let temp = TempDir::new().unwrap();
        let config_path = project_init(temp.path()).unwrap();
        assert!(config_path.exists());
        assert!(temp.path().join(".shellscribe/runs").is_dir());

        let nested = temp.path().join("scenarios/web");
        std::fs::create_dir_all(&nested).unwrap();

        let resolved = resolve_from(&nested, None).unwrap();
        assert_eq!(resolved.config_file.as_deref(), Some(config_path.as_path()));
        assert_eq!(resolved.state_dir, temp.path().join(".shellscribe"));
        assert_eq!(resolved.runs_dir(), temp.path().join(".shellscribe/runs"));
        assert_eq!(resolved.config, Config::default());
    }

    #[test]
    fn test_save_round_trip_and_reinit_keeps_file() {
        let temp = TempDir::new().unwrap();
        let config_path = project_init(temp.path()).unwrap();

        let mut config = Config::load_file(&config_path).unwrap();
        config.allowlist.push("scanme.example.org".to_string());
        config.save(&config_path).unwrap();

        project_init(temp.path()).unwrap();
        let reloaded = Config::load_file(&config_path).unwrap();
        assert_eq!(reloaded.allowlist, vec!["scanme.example.org"]);
    }

    #[test]
    fn test_home_override() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("state");

        let resolved = resolve_from(temp.path(), Some(home.clone())).unwrap();
        assert_eq!(resolved.state_dir, home);
        assert!(resolved.config_file.is_none());
        assert_eq!(resolved.config_path(), home.join("config.yaml"));
        assert_eq!(resolved.findings_db(), home.join("findings.db"));
    }
}
