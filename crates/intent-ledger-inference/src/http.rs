use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    AtomInferenceOutput, AtomInferenceRequest, CandidateAtom, CandidateMolecule, GroupingOutput,
    GroupingRequest, InferenceCapability, InferenceSettings, InferenceUsage,
};

#[derive(Debug, Clone)]
pub struct HttpInferenceConfig {
    pub url: String,
    pub model_id: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub auth_bearer_token: Option<String>,
}

impl HttpInferenceConfig {
    /// Resolve settings, reading the bearer token from the environment.
    ///
    /// # Errors
    /// Returns an error when `url` is missing or the token variable is unset.
    pub fn from_settings(settings: &InferenceSettings) -> Result<Self> {
        let url = settings
            .url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("http_json inference requires inference.url"))?
            .to_string();

        let auth_bearer_token = match settings.auth_bearer_env.as_deref() {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by inference.auth_bearer_env")
            })?),
            None => None,
        };

        Ok(Self {
            url,
            model_id: settings.model_id.clone(),
            timeout_ms: settings.timeout_ms,
            headers: settings.headers.clone(),
            auth_bearer_token,
        })
    }
}

/// Posts evidence as JSON and expects `{atoms|molecules, usage}` back.
#[derive(Debug, Clone)]
pub struct HttpJsonInference {
    config: HttpInferenceConfig,
    adapter_version: String,
}

#[derive(Debug, Deserialize)]
struct AtomResponse {
    #[serde(default)]
    atoms: Vec<CandidateAtom>,
    #[serde(default)]
    usage: InferenceUsage,
}

#[derive(Debug, Deserialize)]
struct GroupingResponse {
    #[serde(default)]
    molecules: Vec<CandidateMolecule>,
    #[serde(default)]
    usage: InferenceUsage,
}

impl HttpJsonInference {
    #[must_use]
    pub fn new(config: HttpInferenceConfig) -> Self {
        Self {
            config,
            adapter_version: "http_json.v1".to_string(),
        }
    }

    fn post(&self, operation: &str, payload: Value) -> Result<(Value, u64)> {
        let outbound = json!({
            "adapter_version": self.adapter_version,
            "model_id": self.config.model_id,
            "operation": operation,
            "request": payload,
        });

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let started = Instant::now();
        let body = match req.send_json(&outbound) {
            Ok(response) => response
                .into_json::<Value>()
                .context("inference response is not JSON")?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("{operation} failed with http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure: {err}"));
            }
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(operation, latency_ms, "inference call finished");
        Ok((body, latency_ms))
    }
}

impl InferenceCapability for HttpJsonInference {
    fn provider_name(&self) -> &'static str {
        "http_json"
    }

    fn infer_atoms(&self, request: &AtomInferenceRequest) -> Result<AtomInferenceOutput> {
        let (body, latency_ms) = self.post("infer_atoms", serde_json::to_value(request)?)?;
        let mut parsed: AtomResponse =
            serde_json::from_value(body).context("malformed infer_atoms response")?;
        if parsed.usage.latency_ms == 0 {
            parsed.usage.latency_ms = latency_ms;
        }
        Ok(AtomInferenceOutput {
            atoms: parsed.atoms,
            usage: parsed.usage,
        })
    }

    fn group_atoms(&self, request: &GroupingRequest) -> Result<GroupingOutput> {
        let (body, latency_ms) = self.post("group_atoms", serde_json::to_value(request)?)?;
        let mut parsed: GroupingResponse =
            serde_json::from_value(body).context("malformed group_atoms response")?;
        if parsed.usage.latency_ms == 0 {
            parsed.usage.latency_ms = latency_ms;
        }
        Ok(GroupingOutput {
            molecules: parsed.molecules,
            usage: parsed.usage,
        })
    }
}
