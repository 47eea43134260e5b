use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::PolicyConfig;

/// Immutable allow/deny policy applied by the static validator.
///
/// Built once at startup from `[policy]` and shared read-only by every
/// validation call.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Callable names refused both as bare calls and as attribute calls.
    pub banned_calls: HashSet<String>,
    /// Module names refused by their top-level component.
    pub banned_modules: HashSet<String>,
    /// Attribute calls that write geometry to disk. Observed, and
    /// refused only when `reject_self_export` is set.
    pub export_calls: HashSet<String>,
    pub reject_self_export: bool,
    pub max_lines: usize,
    /// Name of the variable whose value the executor exports.
    pub terminal_binding: String,
}

impl ValidationPolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        if !is_identifier(&config.terminal_binding) {
            bail!(
                "policy.terminal_binding must be a plain identifier (got {:?})",
                config.terminal_binding
            );
        }
        if config.max_lines == 0 {
            bail!("policy.max_lines must be at least 1");
        }
        Ok(Self::build(config))
    }

    fn build(config: &PolicyConfig) -> Self {
        Self {
            banned_calls: config.banned_calls.iter().cloned().collect(),
            banned_modules: config.banned_modules.iter().cloned().collect(),
            export_calls: config.export_calls.iter().cloned().collect(),
            reject_self_export: config.reject_self_export,
            max_lines: config.max_lines,
            terminal_binding: config.terminal_binding.clone(),
        }
    }

    pub fn is_banned_module(&self, module: &str) -> bool {
        let top_level = module
            .trim_start_matches(|c: char| c == '.' || c.is_whitespace())
            .split('.')
            .next()
            .unwrap_or("");
        !top_level.is_empty() && self.banned_modules.contains(top_level)
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::build(&PolicyConfig::default())
    }
}

/// ASCII Python identifier check (no keywords list, only shape).
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
