#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use intent_ledger_domain::{
    CoverageGap, ExportEvidence, RunId, SourceTestRef, TestEvidence,
};
use serde::{Deserialize, Serialize};

mod grounding;
mod http;
mod mock;

pub use grounding::{confidence_to_score, ground_candidate, validate_molecule, GroundedAtom};
pub use http::{HttpInferenceConfig, HttpJsonInference};
pub use mock::{MockInference, MockScript};

/// External capability that turns evidence into candidate atoms and groupings.
///
/// Implementations must be callable from several worker threads at once.
pub trait InferenceCapability: Send + Sync {
    fn provider_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn infer_atoms(&self, request: &AtomInferenceRequest) -> Result<AtomInferenceOutput>;

    #[allow(clippy::missing_errors_doc)]
    fn group_atoms(&self, request: &GroupingRequest) -> Result<GroupingOutput>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AtomInferenceRequest {
    pub run_id: RunId,
    pub commit_hash: Option<String>,
    pub test: TestEvidence,
    pub related_docs: Vec<String>,
    pub exports: Vec<ExportEvidence>,
    pub coverage_gaps: Vec<CoverageGap>,
}

/// A candidate atom as returned by the capability, before grounding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateAtom {
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Expected within 0..=100.
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    pub source_test: SourceTestRef,
    #[serde(default)]
    pub observable_outcomes: Vec<String>,
    #[serde(default)]
    pub related_docs: Vec<String>,
    #[serde(default)]
    pub ambiguity_reasons: Vec<String>,
}

fn default_category() -> String {
    "functional".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub latency_ms: u64,
}

impl InferenceUsage {
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtomInferenceOutput {
    pub atoms: Vec<CandidateAtom>,
    pub usage: InferenceUsage,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupingAtom {
    pub temp_id: String,
    pub description: String,
    pub category: String,
    pub source_test: SourceTestRef,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupingRequest {
    pub run_id: RunId,
    pub atoms: Vec<GroupingAtom>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateMolecule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub atom_temp_ids: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupingOutput {
    pub molecules: Vec<CandidateMolecule>,
    pub usage: InferenceUsage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Mock,
    HttpJson,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::HttpJson => "http_json",
        }
    }
}

/// Provider selection as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InferenceSettings {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
}

fn default_model_id() -> String {
    "mock-model".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Mock,
            model_id: default_model_id(),
            url: None,
            timeout_ms: default_timeout_ms(),
            headers: BTreeMap::new(),
            auth_bearer_env: None,
        }
    }
}

/// Build the configured capability.
///
/// # Errors
/// Returns an error if the HTTP adapter is selected without a URL or its
/// bearer-token environment variable is missing.
pub fn build_capability(settings: &InferenceSettings) -> Result<Box<dyn InferenceCapability>> {
    match settings.provider {
        ProviderKind::Mock => Ok(Box::new(MockInference::new(&settings.model_id))),
        ProviderKind::HttpJson => {
            let config = HttpInferenceConfig::from_settings(settings)?;
            Ok(Box::new(HttpJsonInference::new(config)))
        }
    }
}
