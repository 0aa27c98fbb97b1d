//! Per-project configuration (`.lore.json`).
//!
//! Deserialized with `serde`; missing file or missing keys fall back to the
//! documented defaults. `Config::normalize` clamps every numeric field to its
//! documented range so a hand-edited file can never push the system into an
//! invalid budget or threshold.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors reading or parsing `.lore.json`.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but isn't valid JSON.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path to the offending file.
        path: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
    /// I/O error reading the file.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path to the offending file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Token-budget fractions of the `usable` window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "defaults::budget_distilled")]
    pub distilled: f64,
    #[serde(default = "defaults::budget_raw")]
    pub raw: f64,
    #[serde(default = "defaults::budget_output")]
    pub output: f64,
    #[serde(default = "defaults::budget_ltm")]
    pub ltm: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            distilled: defaults::budget_distilled(),
            raw: defaults::budget_raw(),
            output: defaults::budget_output(),
            ltm: defaults::budget_ltm(),
        }
    }
}

/// Distillation pipeline tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistillationConfig {
    #[serde(default = "defaults::min_messages")]
    pub min_messages: u32,
    #[serde(default = "defaults::max_segment")]
    pub max_segment: u32,
    #[serde(default = "defaults::meta_threshold")]
    pub meta_threshold: u32,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            min_messages: defaults::min_messages(),
            max_segment: defaults::max_segment(),
            meta_threshold: defaults::meta_threshold(),
        }
    }
}

/// Curator tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuratorConfig {
    #[serde(default = "defaults::curator_enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::curator_on_idle")]
    pub on_idle: bool,
    #[serde(default = "defaults::curator_after_turns")]
    pub after_turns: u32,
    #[serde(default = "defaults::curator_max_entries")]
    pub max_entries: u32,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::curator_enabled(),
            on_idle: defaults::curator_on_idle(),
            after_turns: defaults::curator_after_turns(),
            max_entries: defaults::curator_max_entries(),
        }
    }
}

/// Temporal-store pruning tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruningConfig {
    #[serde(default = "defaults::retention")]
    pub retention: u32,
    #[serde(default = "defaults::max_storage")]
    pub max_storage: u32,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            retention: defaults::retention(),
            max_storage: defaults::max_storage(),
        }
    }
}

/// Markdown round-trip tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsFileConfig {
    #[serde(default = "defaults::agents_file_enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::agents_file_path")]
    pub path: String,
}

impl Default for AgentsFileConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::agents_file_enabled(),
            path: defaults::agents_file_path(),
        }
    }
}

/// Root configuration, deserialized from `.lore.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Override model for worker sessions. Unset uses the host's default model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub distillation: DistillationConfig,
    #[serde(default)]
    pub curator: CuratorConfig,
    #[serde(default)]
    pub pruning: PruningConfig,
    #[serde(default = "defaults::cross_project")]
    pub cross_project: bool,
    #[serde(default)]
    pub agents_file: AgentsFileConfig,
}

impl Config {
    /// Load from `<project>/.lore.json`. A missing file yields all defaults.
    pub fn load(project_path: &Path) -> Result<Self> {
        let path = project_path.join(".lore.json");
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.normalize();
        Ok(config)
    }

    /// Clamp every field to its documented range.
    pub fn normalize(&mut self) {
        self.budget.distilled = self.budget.distilled.clamp(0.05, 0.5);
        self.budget.raw = self.budget.raw.clamp(0.1, 0.7);
        self.budget.output = self.budget.output.clamp(0.1, 0.5);
        self.budget.ltm = self.budget.ltm.clamp(0.02, 0.3);

        self.distillation.min_messages = self.distillation.min_messages.max(3);
        self.distillation.max_segment = self.distillation.max_segment.max(5);
        self.distillation.meta_threshold = self.distillation.meta_threshold.max(3);

        self.curator.after_turns = self.curator.after_turns.max(1);
        self.curator.max_entries = self.curator.max_entries.max(10);

        self.pruning.retention = self.pruning.retention.max(1);
        self.pruning.max_storage = self.pruning.max_storage.max(50);
    }
}

mod defaults {
    pub fn budget_distilled() -> f64 {
        0.25
    }
    pub fn budget_raw() -> f64 {
        0.40
    }
    pub fn budget_output() -> f64 {
        0.25
    }
    pub fn budget_ltm() -> f64 {
        0.10
    }
    pub fn min_messages() -> u32 {
        8
    }
    pub fn max_segment() -> u32 {
        50
    }
    pub fn meta_threshold() -> u32 {
        10
    }
    pub fn curator_enabled() -> bool {
        true
    }
    pub fn curator_on_idle() -> bool {
        true
    }
    pub fn curator_after_turns() -> u32 {
        10
    }
    pub fn curator_max_entries() -> u32 {
        25
    }
    pub fn retention() -> u32 {
        120
    }
    pub fn max_storage() -> u32 {
        1024
    }
    pub fn cross_project() -> bool {
        true
    }
    pub fn agents_file_enabled() -> bool {
        true
    }
    pub fn agents_file_path() -> String {
        "AGENTS.md".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.budget.distilled, 0.25);
        assert_eq!(config.agents_file.path, "AGENTS.md");
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".lore.json"),
            r#"{"budget": {"distilled": 0.9}, "distillation": {"minMessages": 1}}"#,
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.budget.distilled, 0.5);
        assert_eq!(config.distillation.min_messages, 3);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".lore.json"), r#"{"model": "claude"}"#).unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.model.as_deref(), Some("claude"));
        assert_eq!(config.curator.max_entries, 25);
    }
}
