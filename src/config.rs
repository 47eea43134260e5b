use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Default tracing filter level when `RUST_LOG` is unset
    pub log_level: LogLevel,
    pub cad: CadConfig,
    pub policy: PolicyConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CadConfig {
    /// Path to the headless CAD interpreter (e.g. FreeCADCmd).
    /// Supports ${ENV_VAR} substitution
    pub executable: Option<String>,
    pub timeout_secs: u64,
    /// Scratch directory for job scripts and artifacts
    pub output_dir: PathBuf,
    /// Artifacts smaller than this are treated as empty geometry
    pub min_artifact_bytes: u64,
    /// Scratch files older than this are swept
    pub retention_secs: u64,
}

impl Default for CadConfig {
    fn default() -> Self {
        Self {
            executable: None,
            timeout_secs: 30,
            output_dir: PathBuf::from("outputs"),
            min_artifact_bytes: 100,
            retention_secs: 3600,
        }
    }
}

impl CadConfig {
    /// Configured executable with surrounding quotes removed
    /// (paths pasted from a shell often keep them).
    pub fn executable_path(&self) -> Option<PathBuf> {
        self.executable
            .as_deref()
            .map(|p| p.trim().trim_matches(|c: char| c == '\'' || c == '"'))
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_lines: usize,
    pub banned_calls: Vec<String>,
    pub banned_modules: Vec<String>,
    pub export_calls: Vec<String>,
    /// Refuse scripts that call an export operation themselves
    pub reject_self_export: bool,
    pub terminal_binding: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_lines: 2000,
            banned_calls: strings(&[
                "exec",
                "eval",
                "open",
                "compile",
                "__import__",
                "getattr",
                "setattr",
                "delattr",
                "globals",
                "locals",
                "vars",
                "memoryview",
                "SystemExit",
            ]),
            banned_modules: strings(&[
                "os",
                "sys",
                "subprocess",
                "shutil",
                "socket",
                "urllib",
                "requests",
                "http",
                "asyncio",
                "threading",
                "multiprocessing",
            ]),
            export_calls: strings(&["exportStl", "export", "exportStep"]),
            reject_self_export: false,
            terminal_binding: "final_shape".to_string(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub host: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Extra attempts after the first failed request
    pub retries: u32,
    pub max_tokens_per_request: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            host: "http://127.0.0.1:11434".to_string(),
            model: "mistral".to_string(),
            timeout_secs: 180,
            retries: 2,
            max_tokens_per_request: 4096,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {path}"))?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding environment variables like ${FREECAD_PATH}.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cad.timeout_secs == 0 {
            bail!("cad.timeout_secs must be at least 1");
        }
        if self.llm.provider != "ollama" {
            bail!("Unsupported LLM provider: {}", self.llm.provider);
        }
        let url = url::Url::parse(&self.llm.host)
            .with_context(|| format!("Invalid llm.host: {}", self.llm.host))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("llm.host must be http(s) (got {}://)", url.scheme());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.cad.timeout_secs, 30);
        assert_eq!(config.cad.output_dir, PathBuf::from("outputs"));
        assert_eq!(config.cad.min_artifact_bytes, 100);
        assert_eq!(config.cad.retention(), Duration::from_secs(3600));
        assert!(config.cad.executable_path().is_none());
        assert_eq!(config.policy.max_lines, 2000);
        assert_eq!(config.policy.terminal_binding, "final_shape");
        assert!(config.policy.banned_modules.contains(&"subprocess".to_string()));
        assert_eq!(config.llm.model, "mistral");
        assert_eq!(config.llm.retries, 2);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = Config::parse(
            r#"
            log_level = "debug"

            [cad]
            executable = "/usr/bin/FreeCADCmd"
            timeout_secs = 10

            [policy]
            banned_modules = ["os"]
            reject_self_export = true
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level.as_str(), "debug");
        assert_eq!(
            config.cad.executable_path(),
            Some(PathBuf::from("/usr/bin/FreeCADCmd"))
        );
        assert_eq!(config.cad.timeout(), Duration::from_secs(10));
        assert_eq!(config.cad.retention_secs, 3600);
        assert_eq!(config.policy.banned_modules, vec!["os"]);
        assert!(config.policy.reject_self_export);
        assert_eq!(config.policy.max_lines, 2000);
    }

    #[test]
    fn test_executable_quotes_are_stripped() {
        let cad = CadConfig {
            executable: Some("\"C:/Program Files/FreeCAD/bin/FreeCADCmd.exe\"".to_string()),
            ..CadConfig::default()
        };
        assert_eq!(
            cad.executable_path(),
            Some(PathBuf::from("C:/Program Files/FreeCAD/bin/FreeCADCmd.exe"))
        );

        let blank = CadConfig {
            executable: Some("  ''  ".to_string()),
            ..CadConfig::default()
        };
        assert!(blank.executable_path().is_none());
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("CAD_COPILOT_TEST_EXE", "/opt/freecad/FreeCADCmd");
        let config = Config::parse("[cad]\nexecutable = \"${CAD_COPILOT_TEST_EXE}\"").unwrap();
        assert_eq!(
            config.cad.executable_path(),
            Some(PathBuf::from("/opt/freecad/FreeCADCmd"))
        );
    }

    #[test]
    fn test_rejects_zero_timeout() {
        assert!(Config::parse("[cad]\ntimeout_secs = 0").is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        assert!(Config::parse("[llm]\nprovider = \"openai\"").is_err());
    }

    #[test]
    fn test_rejects_bad_llm_host() {
        assert!(Config::parse("[llm]\nhost = \"not a url\"").is_err());
        assert!(Config::parse("[llm]\nhost = \"ftp://models.local\"").is_err());
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        assert!(Config::parse("log_level = \"loud\"").is_err());
    }

    #[test]
    fn test_shipped_sample_parses() {
        let config = Config::parse(include_str!("../config/copilot.toml")).unwrap();
        assert_eq!(config.policy.terminal_binding, "final_shape");
        assert_eq!(config.llm.provider, "ollama");
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = Config::load("/nonexistent/copilot.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/copilot.toml"));
    }
}
