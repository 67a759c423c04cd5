#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use intent_ledger_domain::{ensure_non_empty, hash_bytes, hash_json, DEFAULT_QUALITY_THRESHOLD, MAX_SCORE};
use intent_ledger_inference::{InferenceSettings, ProviderKind};
use intent_ledger_policy::{default_tiers, BudgetTier};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "intent-ledger.yaml";
pub const MAX_CONCURRENCY: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConflictSettings {
    /// Jaccard similarity at or above which two atoms overlap semantically.
    #[serde(default = "default_overlap_threshold")]
    pub semantic_overlap_threshold: f64,
    #[serde(default)]
    pub detect_on_completion: bool,
}

impl Default for ConflictSettings {
    fn default() -> Self {
        Self {
            semantic_overlap_threshold: default_overlap_threshold(),
            detect_on_completion: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u8,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_atoms")]
    pub max_atom_recommendations: usize,
    #[serde(default = "default_max_molecules")]
    pub max_molecule_recommendations: usize,
    #[serde(default = "default_tiers")]
    pub budget_tiers: Vec<BudgetTier>,
    #[serde(default)]
    pub inference: InferenceSettings,
    #[serde(default)]
    pub conflicts: ConflictSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_database_path() -> String {
    "intent-ledger.sqlite3".to_string()
}

fn default_quality_threshold() -> u8 {
    DEFAULT_QUALITY_THRESHOLD
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_atoms() -> usize {
    200
}

fn default_max_molecules() -> usize {
    100
}

fn default_overlap_threshold() -> f64 {
    0.8
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            quality_threshold: default_quality_threshold(),
            max_concurrency: default_max_concurrency(),
            max_atom_recommendations: default_max_atoms(),
            max_molecule_recommendations: default_max_molecules(),
            budget_tiers: default_tiers(),
            inference: InferenceSettings::default(),
            conflicts: ConflictSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// A validated configuration plus the hashes a run records for provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEnvelope {
    pub config: LedgerConfig,
    pub source_hash: String,
    pub normalized_hash: String,
}

impl ConfigEnvelope {
    /// Wrap an in-memory configuration, validating and normalizing it.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn from_config(mut config: LedgerConfig) -> Result<Self> {
        validate_config(&config)?;
        normalize_config(&mut config);
        let normalized_hash = hash_json(&serde_json::to_value(&config)?)?;
        Ok(Self {
            config,
            source_hash: normalized_hash.clone(),
            normalized_hash,
        })
    }
}

/// Load configuration YAML from disk.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_config_from_path(path: &Path) -> Result<ConfigEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    normalize_config_yaml(&content)
}

/// Load `path` when it exists, otherwise fall back to defaults.
///
/// # Errors
/// Returns an error when an existing file is invalid.
pub fn load_config_or_default(path: &Path) -> Result<ConfigEnvelope> {
    if path.exists() {
        load_config_from_path(path)
    } else {
        ConfigEnvelope::from_config(LedgerConfig::default())
    }
}

/// Parse, validate and normalize configuration YAML.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_config_yaml(yaml: &str) -> Result<ConfigEnvelope> {
    let source_hash = hash_bytes(yaml.as_bytes());
    let document = if yaml.trim().is_empty() { "{}" } else { yaml };
    let mut config: LedgerConfig = serde_yaml::from_str(document)
        .map_err(|err| anyhow!("invalid intent-ledger config: {err}"))?;

    normalize_config(&mut config);
    validate_config(&config)?;

    let normalized_hash = hash_json(&serde_json::to_value(&config)?)?;
    Ok(ConfigEnvelope {
        config,
        source_hash,
        normalized_hash,
    })
}

fn validate_config(config: &LedgerConfig) -> Result<()> {
    ensure_non_empty("database_path", &config.database_path)?;
    if config.quality_threshold > MAX_SCORE {
        return Err(anyhow!(
            "quality_threshold {} must be within 0..={MAX_SCORE}",
            config.quality_threshold
        ));
    }
    if !(1..=MAX_CONCURRENCY).contains(&config.max_concurrency) {
        return Err(anyhow!(
            "max_concurrency {} must be within 1..={MAX_CONCURRENCY}",
            config.max_concurrency
        ));
    }
    if config.max_atom_recommendations == 0 || config.max_molecule_recommendations == 0 {
        return Err(anyhow!("recommendation bounds must be positive"));
    }

    validate_tiers(&config.budget_tiers)?;

    ensure_non_empty("inference.model_id", &config.inference.model_id)?;
    if config.inference.provider == ProviderKind::HttpJson
        && config
            .inference
            .url
            .as_deref()
            .map_or(true, |url| url.trim().is_empty())
    {
        return Err(anyhow!("inference.url is required for provider http_json"));
    }
    if config.inference.timeout_ms == 0 {
        return Err(anyhow!("inference.timeout_ms must be positive"));
    }

    let overlap = config.conflicts.semantic_overlap_threshold;
    if !overlap.is_finite() || overlap <= 0.0 || overlap > 1.0 {
        return Err(anyhow!(
            "conflicts.semantic_overlap_threshold {overlap} must be within (0, 1]"
        ));
    }
    ensure_non_empty("logging.filter", &config.logging.filter)?;
    Ok(())
}

fn validate_tiers(tiers: &[BudgetTier]) -> Result<()> {
    if tiers.is_empty() {
        return Err(anyhow!("budget_tiers must not be empty"));
    }
    let mut names = BTreeSet::new();
    let mut unbounded = 0_usize;
    for tier in tiers {
        ensure_non_empty("budget_tiers.name", &tier.name)?;
        if !names.insert(tier.name.as_str()) {
            return Err(anyhow!("duplicate budget tier: {}", tier.name));
        }
        if tier.max_total_tokens == 0 || tier.max_duration_ms == 0 || tier.max_llm_calls == 0 {
            return Err(anyhow!("budget tier {} has a zero limit", tier.name));
        }
        if tier.max_tests.is_none() {
            unbounded += 1;
        }
    }
    if unbounded > 1 {
        return Err(anyhow!("at most one budget tier may omit max_tests"));
    }
    Ok(())
}

fn normalize_config(config: &mut LedgerConfig) {
    config.database_path = config.database_path.trim().to_string();
    config.logging.filter = config.logging.filter.trim().to_string();
    config.inference.model_id = config.inference.model_id.trim().to_string();
    config.inference.url = config
        .inference
        .url
        .take()
        .map(|url| url.trim().to_string());
    for tier in &mut config.budget_tiers {
        tier.name = tier.name.trim().to_string();
    }
    // Unbounded tier sorts last so tier selection can stop at the first fit.
    config.budget_tiers.sort_by(|lhs, rhs| {
        match (lhs.max_tests, rhs.max_tests) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| lhs.name.cmp(&rhs.name))
    });
}
