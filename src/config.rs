//! Configuration for deckrun.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DECKRUN_HOME)
//! 2. Config file (.deckrun/config.yaml)
//! 3. Defaults (~/.deckrun)
//!
//! Config file discovery:
//! - Searches current directory and parents for .deckrun/config.yaml
//! - `paths.home` is relative to the .deckrun/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::CommandSpec;
use crate::core::{PhaseRegistry, PipelineSettings};
use crate::domain::Phase;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub executors: BTreeMap<Phase, CommandSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .deckrun/)
    pub home: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to deckrun home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Approval gates, QA routing defaults and retry policy
    pub pipeline: PipelineSettings,
    /// Subprocess executor per phase
    pub executors: BTreeMap<Phase, CommandSpec>,
}

impl ResolvedConfig {
    /// Runs directory ($DECKRUN_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Registry of subprocess executors for the configured phases
    pub fn registry(&self) -> PhaseRegistry {
        PhaseRegistry::from_commands(&self.executors)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".deckrun").join("config.yaml");
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

    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = serde_yaml::from_str(content).context("Failed to parse YAML")?;
    config.pipeline.validate()?;

    for (phase, spec) in &config.executors {
        if !phase.is_executable() {
            anyhow::bail!("'{}' has no executor", phase);
        }
        if spec.command.trim().is_empty() {
            anyhow::bail!("Executor for phase '{}' has an empty command", phase);
        }
    }

    Ok(config)
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".deckrun");

    let env_home = std::env::var("DECKRUN_HOME").ok().map(PathBuf::from);
    let config_file = find_config_file();

    let Some(ref config_path) = config_file else {
        return Ok(ResolvedConfig {
            home: env_home.unwrap_or(default_home),
            config_file: None,
            pipeline: PipelineSettings::default(),
            executors: BTreeMap::new(),
        });
    };

    let config = load_config_file(config_path)?;

    let home = match (env_home, &config.paths.home) {
        (Some(home), _) => home,
        (None, Some(home_path)) => {
            let deckrun_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(deckrun_dir, home_path)
        }
        (None, None) => default_home,
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        pipeline: config.pipeline,
        executors: config.executors,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory ($DECKRUN_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let deckrun_dir = temp.path().join(".deckrun");
        std::fs::create_dir_all(&deckrun_dir).unwrap();

        let config_path = deckrun_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
pipeline:
  approval_phases: [brainstorm]
  max_regenerations: 2
  retry:
    max_attempts: 4
executors:
  brainstorm:
    command: ./bin/outline
    args: ["--json"]
  qa:
    command: ./bin/score
    timeout_seconds: 60
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert!(config.pipeline.requires_approval(Phase::Brainstorm));
        assert_eq!(config.pipeline.max_regenerations, 2);
        assert_eq!(config.pipeline.quality_threshold, 3.0);
        assert_eq!(config.pipeline.retry.max_attempts, 4);

        let brainstorm = &config.executors[&Phase::Brainstorm];
        assert_eq!(brainstorm.args, vec!["--json".to_string()]);
        assert_eq!(brainstorm.timeout_seconds, 300);
        assert_eq!(config.executors[&Phase::Qa].timeout_seconds, 60);
    }

    #[test]
    fn test_gated_qa_is_rejected() {
        let err = parse_config(
            r#"
version: "1.0"
pipeline:
  approval_phases: [qa]
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("qa"));
    }

    #[test]
    fn test_finalize_executor_is_rejected() {
        let result = parse_config(
            r#"
version: "1.0"
executors:
  finalize:
    command: /bin/true
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("version: \"1.0\"\n").unwrap();
        assert!(config.paths.home.is_none());
        assert_eq!(config.pipeline, PipelineSettings::default());
        assert!(config.executors.is_empty());
    }

    #[test]
    fn test_registry_from_resolved_config() {
        let config = ResolvedConfig {
            home: PathBuf::from("/test/.deckrun"),
            config_file: None,
            pipeline: PipelineSettings::default(),
            executors: [(Phase::Research, CommandSpec::new("research-bot"))]
                .into_iter()
                .collect(),
        };

        assert_eq!(config.runs_dir(), PathBuf::from("/test/.deckrun/runs"));
        let registry = config.registry();
        assert_eq!(registry.get(Phase::Research).unwrap().name(), "research-bot");
        assert_eq!(registry.missing().len(), 4);
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
