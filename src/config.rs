//! Configuration for roundtable.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ROUNDTABLE_HOME, ROUNDTABLE_LLM_ENDPOINT, ROUNDTABLE_LLM_MODEL)
//! 2. Config file (.roundtable/config.yaml)
//! 3. Defaults (~/.roundtable)
//!
//! Config file discovery:
//! - Searches current directory and parents for .roundtable/config.yaml
//! - `paths.home` is relative to the .roundtable/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".roundtable";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .roundtable/)
    pub home: Option<String>,
    /// Directory holding pipeline definitions (relative to the project root)
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    pub backend: Option<LlmBackend>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub price_per_1k_tokens: Option<f64>,
    pub timeout_seconds: Option<u64>,
    pub fabric_binary: Option<String>,
    pub fabric_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShellConfig {
    pub program: Option<String>,
    pub interpreter: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfig {
    pub n_round: Option<u32>,
    pub investment: Option<f64>,
    pub journal: Option<bool>,
}

/// Which completion backend stages talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// OpenAI-compatible chat completion endpoint
    #[default]
    Http,
    /// The fabric CLI
    Fabric,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to roundtable home (engine state)
    pub home: PathBuf,
    /// Directory searched for `<name>.yaml` pipelines
    pub pipelines_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub llm: LlmSettings,
    pub shell: ShellSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub price_per_1k_tokens: f64,
    pub timeout_seconds: u64,
    /// Binary for the fabric backend; detected when unset
    pub fabric_binary: Option<String>,
    /// Fabric pattern wrapped around every prompt
    pub fabric_pattern: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Http,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            price_per_1k_tokens: 0.0,
            timeout_seconds: 300,
            fabric_binary: None,
            fabric_pattern: None,
        }
    }
}

impl LlmSettings {
    /// API key from the configured environment variable, if set
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub program: String,
    pub interpreter: String,
    pub timeout_seconds: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            program: "kubectl".to_string(),
            interpreter: "sh".to_string(),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub n_round: u32,
    /// Cost budget in USD; each pipeline's own limit when unset
    pub investment: Option<f64>,
    pub journal: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            n_round: 3,
            investment: None,
            journal: true,
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path).canonicalize().unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed file with defaults; `config_path` anchors relative paths
fn resolve(file: ConfigFile, config_path: Option<&Path>, default_home: PathBuf) -> ResolvedConfig {
    let config_dir = config_path.and_then(Path::parent);
    let project_root = config_dir.and_then(Path::parent);

    let home = match (file.paths.home.as_deref(), config_dir) {
        (Some(home), Some(dir)) => resolve_path(dir, home),
        (Some(home), None) => PathBuf::from(home),
        (None, _) => default_home,
    };

    let pipelines_dir = match (file.paths.pipelines.as_deref(), project_root) {
        (Some(dir), Some(root)) => resolve_path(root, dir),
        (Some(dir), None) => PathBuf::from(dir),
        (None, Some(root)) => root.join("pipelines"),
        (None, None) => PathBuf::from("pipelines"),
    };

    let llm_defaults = LlmSettings::default();
    let llm = LlmSettings {
        backend: file.llm.backend.unwrap_or(llm_defaults.backend),
        endpoint: file.llm.endpoint.unwrap_or(llm_defaults.endpoint),
        model: file.llm.model.unwrap_or(llm_defaults.model),
        api_key_env: file.llm.api_key_env.unwrap_or(llm_defaults.api_key_env),
        price_per_1k_tokens: file.llm.price_per_1k_tokens.unwrap_or(llm_defaults.price_per_1k_tokens),
        timeout_seconds: file.llm.timeout_seconds.unwrap_or(llm_defaults.timeout_seconds),
        fabric_binary: file.llm.fabric_binary,
        fabric_pattern: file.llm.fabric_pattern,
    };

    let shell_defaults = ShellSettings::default();
    let shell = ShellSettings {
        program: file.shell.program.unwrap_or(shell_defaults.program),
        interpreter: file.shell.interpreter.unwrap_or(shell_defaults.interpreter),
        timeout_seconds: file.shell.timeout_seconds.unwrap_or(shell_defaults.timeout_seconds),
    };

    let scheduler_defaults = SchedulerSettings::default();
    let scheduler = SchedulerSettings {
        n_round: file.scheduler.n_round.unwrap_or(scheduler_defaults.n_round),
        investment: file.scheduler.investment.or(scheduler_defaults.investment),
        journal: file.scheduler.journal.unwrap_or(scheduler_defaults.journal),
    };

    ResolvedConfig {
        home,
        pipelines_dir,
        config_file: config_path.map(Path::to_path_buf),
        llm,
        shell,
        scheduler,
    }
}

/// Environment variables win over everything else
fn apply_env(config: &mut ResolvedConfig) {
    if let Ok(home) = std::env::var("ROUNDTABLE_HOME") {
        config.home = PathBuf::from(home);
    }
    if let Ok(endpoint) = std::env::var("ROUNDTABLE_LLM_ENDPOINT") {
        config.llm.endpoint = endpoint;
    }
    if let Ok(model) = std::env::var("ROUNDTABLE_LLM_MODEL") {
        config.llm.model = model;
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let mut config = resolve(file, config_file.as_deref(), default_home);
    apply_env(&mut config);
    Ok(config)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory ($ROUNDTABLE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(ConfigFile::default(), None, PathBuf::from("/home/u/.roundtable"));

        assert_eq!(config.home, PathBuf::from("/home/u/.roundtable"));
        assert_eq!(config.pipelines_dir, PathBuf::from("pipelines"));
        assert!(config.config_file.is_none());
        assert_eq!(config.shell.program, "kubectl");
        assert_eq!(config.scheduler.n_round, 3);
        assert_eq!(config.scheduler.investment, None);
        assert!(config.scheduler.journal);
        assert_eq!(config.llm.backend, LlmBackend::Http);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
llm:
  backend: fabric
  fabric_pattern: translate
  model: llama3
  price_per_1k_tokens: 0.002
shell:
  program: helm
scheduler:
  n_round: 5
  journal: false
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1.0"));
        assert_eq!(parsed.paths.home.as_deref(), Some("./state"));

        let config = resolve(parsed, Some(&config_path), PathBuf::from("/unused"));
        assert_eq!(config.home, config_dir.join("./state"));
        assert_eq!(config.pipelines_dir, temp.path().join("pipelines"));
        assert_eq!(config.llm.backend, LlmBackend::Fabric);
        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.llm.fabric_pattern.as_deref(), Some("translate"));
        assert_eq!(config.llm.price_per_1k_tokens, 0.002);
        assert_eq!(config.shell.program, "helm");
        assert_eq!(config.shell.interpreter, "sh");
        assert_eq!(config.scheduler.n_round, 5);
        assert!(!config.scheduler.journal);
        assert_eq!(config.config_file.as_deref(), Some(config_path.as_path()));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
