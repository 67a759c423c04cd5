use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

use crate::{
    AtomInferenceOutput, AtomInferenceRequest, CandidateAtom, CandidateMolecule, GroupingOutput,
    GroupingRequest, InferenceCapability, InferenceUsage,
};

/// Scripted response for one test key (`file::name`).
#[derive(Debug, Clone, PartialEq)]
pub enum MockScript {
    Atoms(Vec<CandidateAtom>),
    Fail(String),
}

/// Deterministic capability: the same evidence always yields the same candidates.
#[derive(Debug)]
pub struct MockInference {
    model_id: String,
    adapter_version: String,
    scripts: BTreeMap<String, MockScript>,
    tokens_per_call: Option<u64>,
    atom_calls: AtomicU64,
    group_calls: AtomicU64,
}

impl Default for MockInference {
    fn default() -> Self {
        Self::new("mock-model")
    }
}

impl MockInference {
    #[must_use]
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            adapter_version: "mock.v1".to_string(),
            scripts: BTreeMap::new(),
            tokens_per_call: None,
            atom_calls: AtomicU64::new(0),
            group_calls: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_script(mut self, test_key: &str, script: MockScript) -> Self {
        self.scripts.insert(test_key.to_string(), script);
        self
    }

    /// Report a fixed token count for every call instead of the size-derived one.
    #[must_use]
    pub fn with_tokens_per_call(mut self, tokens: u64) -> Self {
        self.tokens_per_call = Some(tokens);
        self
    }

    #[must_use]
    pub fn atom_calls(&self) -> u64 {
        self.atom_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn group_calls(&self) -> u64 {
        self.group_calls.load(Ordering::SeqCst)
    }

    fn deterministic_token(&self, request: &AtomInferenceRequest) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(request.test.key().as_bytes());
        hasher.update(request.test.effective_content_hash().as_bytes());
        hasher.update(self.model_id.as_bytes());
        hasher.update(self.adapter_version.as_bytes());
        let digest = hasher.finalize();
        let mut token = [0_u8; 32];
        token.copy_from_slice(&digest);
        token
    }

    fn usage_for(&self, payload_len: usize) -> InferenceUsage {
        let payload = u64::try_from(payload_len).unwrap_or(u64::MAX);
        match self.tokens_per_call {
            Some(tokens) => InferenceUsage {
                input_tokens: tokens,
                output_tokens: 0,
                latency_ms: 5,
            },
            None => InferenceUsage {
                input_tokens: 64 + payload / 4,
                output_tokens: 48,
                latency_ms: 5 + payload % 17,
            },
        }
    }

    fn derived_atom(&self, request: &AtomInferenceRequest) -> CandidateAtom {
        let token = self.deterministic_token(request);
        let test = &request.test;
        let observable_outcomes = if test.assertions.is_empty() {
            test.body
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(|line| vec![line.to_string()])
                .unwrap_or_default()
        } else {
            test.assertions.clone()
        };

        CandidateAtom {
            description: sentence_case(&test.test_name),
            category: "functional".to_string(),
            confidence: f64::from(70 + token[0] % 30),
            reasoning: format!(
                "mock:{}:{}",
                test.key(),
                hex::encode(&token[..8])
            ),
            source_test: test.source_ref(),
            observable_outcomes,
            related_docs: request.related_docs.clone(),
            ambiguity_reasons: Vec::new(),
        }
    }
}

impl InferenceCapability for MockInference {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn infer_atoms(&self, request: &AtomInferenceRequest) -> Result<AtomInferenceOutput> {
        self.atom_calls.fetch_add(1, Ordering::SeqCst);
        let usage = self.usage_for(request.test.body.len());
        let atoms = match self.scripts.get(&request.test.key()) {
            Some(MockScript::Atoms(atoms)) => atoms.clone(),
            Some(MockScript::Fail(message)) => {
                return Err(anyhow!("mock inference failure: {message}"));
            }
            None => vec![self.derived_atom(request)],
        };
        Ok(AtomInferenceOutput { atoms, usage })
    }

    fn group_atoms(&self, request: &GroupingRequest) -> Result<GroupingOutput> {
        self.group_calls.fetch_add(1, Ordering::SeqCst);
        let mut by_file: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for atom in &request.atoms {
            by_file
                .entry(atom.source_test.file_path.as_str())
                .or_default()
                .push(atom.temp_id.clone());
        }

        let molecules = by_file
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(file_path, atom_temp_ids)| CandidateMolecule {
                name: sentence_case(&feature_name(file_path)),
                description: format!("Behaviors covered by {file_path}"),
                atom_temp_ids,
                confidence: 75.0,
                reasoning: format!("mock: atoms share source file {file_path}"),
            })
            .collect();

        Ok(GroupingOutput {
            molecules,
            usage: self.usage_for(request.atoms.len() * 32),
        })
    }
}

fn sentence_case(value: &str) -> String {
    let trimmed = value.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn feature_name(file_path: &str) -> String {
    let file_name = file_path.rsplit('/').next().unwrap_or(file_path);
    let stem = file_name.split('.').next().unwrap_or(file_name);
    stem.replace(['_', '-'], " ")
}

#[cfg(test)]
mod tests {
    use super::{MockInference, MockScript};
    use crate::{AtomInferenceRequest, GroupingAtom, GroupingRequest, InferenceCapability};
    use intent_ledger_domain::{RunId, TestEvidence};

    fn fixture_request(test_name: &str) -> AtomInferenceRequest {
        AtomInferenceRequest {
            run_id: RunId::new(),
            commit_hash: None,
            test: TestEvidence {
                file_path: "src/cart.test.ts".to_string(),
                test_name: test_name.to_string(),
                line_number: 9,
                body: "expect(cart.total()).toBe(10)".to_string(),
                content_hash: None,
                has_atom_annotation: false,
                assertions: Vec::new(),
            },
            related_docs: Vec::new(),
            exports: Vec::new(),
            coverage_gaps: Vec::new(),
        }
    }

    #[test]
    fn mock_output_is_stable_for_same_input() {
        let provider = MockInference::default();
        let request = fixture_request("computes total");

        let first = provider.infer_atoms(&request);
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        let second = provider.infer_atoms(&request);
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());

        assert_eq!(first, second);
        assert_eq!(first.atoms.len(), 1);
        assert_eq!(first.atoms[0].description, "Computes total");
        assert_eq!(
            first.atoms[0].observable_outcomes,
            vec!["expect(cart.total()).toBe(10)".to_string()]
        );
        assert!((70.0..100.0).contains(&first.atoms[0].confidence));
        assert_eq!(provider.atom_calls(), 2);
    }

    #[test]
    fn scripts_override_derived_output() {
        let provider = MockInference::default()
            .with_script("src/cart.test.ts::flaky", MockScript::Fail("timeout".to_string()))
            .with_script("src/cart.test.ts::silent", MockScript::Atoms(Vec::new()));

        assert!(provider.infer_atoms(&fixture_request("flaky")).is_err());
        let silent = provider.infer_atoms(&fixture_request("silent"));
        assert!(silent.is_ok());
        assert!(silent.unwrap_or_else(|_| unreachable!()).atoms.is_empty());
    }

    #[test]
    fn grouping_pairs_atoms_sharing_a_file() {
        let provider = MockInference::default();
        let atom = |temp_id: &str, file_path: &str| GroupingAtom {
            temp_id: temp_id.to_string(),
            description: "d".to_string(),
            category: "functional".to_string(),
            source_test: intent_ledger_domain::SourceTestRef {
                file_path: file_path.to_string(),
                test_name: temp_id.to_string(),
                line_number: 1,
            },
        };
        let request = GroupingRequest {
            run_id: RunId::new(),
            atoms: vec![
                atom("atom-1", "src/shopping_cart.test.ts"),
                atom("atom-2", "src/shopping_cart.test.ts"),
                atom("atom-3", "src/auth.test.ts"),
            ],
        };
        let output = provider.group_atoms(&request);
        assert!(output.is_ok());
        let output = output.unwrap_or_else(|_| unreachable!());
        assert_eq!(output.molecules.len(), 1);
        assert_eq!(output.molecules[0].name, "Shopping cart");
        assert_eq!(output.molecules[0].atom_temp_ids.len(), 2);
    }
}
