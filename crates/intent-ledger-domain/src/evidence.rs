use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{hash_bytes, SourceTestRef};

/// Inventory of a repository at one commit, produced by the external manifest step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EvidenceInventory {
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEvidence>,
    #[serde(default)]
    pub tests: Vec<TestEvidence>,
    #[serde(default)]
    pub exports: Vec<ExportEvidence>,
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpointEvidence>,
    #[serde(default)]
    pub docs: Vec<DocEvidence>,
    #[serde(default)]
    pub coverage_gaps: Vec<CoverageGap>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileEvidence {
    pub path: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TestEvidence {
    pub file_path: String,
    pub test_name: String,
    #[serde(default)]
    pub line_number: u32,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub has_atom_annotation: bool,
    #[serde(default)]
    pub assertions: Vec<String>,
}

impl TestEvidence {
    #[must_use]
    pub fn key(&self) -> String {
        test_key(&self.file_path, &self.test_name)
    }

    /// The producer's hash when supplied, otherwise SHA-256 of the test body.
    #[must_use]
    pub fn effective_content_hash(&self) -> String {
        match &self.content_hash {
            Some(hash) if !hash.trim().is_empty() => hash.clone(),
            _ => hash_bytes(self.body.as_bytes()),
        }
    }

    #[must_use]
    pub fn source_ref(&self) -> SourceTestRef {
        SourceTestRef {
            file_path: self.file_path.clone(),
            test_name: self.test_name.clone(),
            line_number: self.line_number,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExportEvidence {
    pub file_path: String,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApiEndpointEvidence {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub handler_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DocEvidence {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoverageGap {
    pub file_path: String,
    pub description: String,
}

impl EvidenceInventory {
    #[must_use]
    pub fn contains_test(&self, file_path: &str, test_name: &str) -> bool {
        self.tests
            .iter()
            .any(|test| test.file_path == file_path && test.test_name == test_name)
    }

    #[must_use]
    pub fn contains_doc(&self, path: &str) -> bool {
        self.docs.iter().any(|doc| doc.path == path)
    }

    #[must_use]
    pub fn find_test(&self, file_path: &str, test_name: &str) -> Option<&TestEvidence> {
        self.tests
            .iter()
            .find(|test| test.file_path == file_path && test.test_name == test_name)
    }

    /// Tests keyed by `file::name`; the first occurrence of a duplicate key wins.
    #[must_use]
    pub fn tests_by_key(&self) -> BTreeMap<String, &TestEvidence> {
        let mut out = BTreeMap::new();
        for test in &self.tests {
            out.entry(test.key()).or_insert(test);
        }
        out
    }

    /// Doc paths and files living next to the given test file.
    #[must_use]
    pub fn related_docs_for(&self, file_path: &str) -> Vec<String> {
        let dir = parent_dir(file_path);
        let mut out: BTreeSet<String> = BTreeSet::new();
        for doc in &self.docs {
            if parent_dir(&doc.path) == dir {
                out.insert(doc.path.clone());
            }
        }
        out.into_iter().collect()
    }
}

#[must_use]
pub fn test_key(file_path: &str, test_name: &str) -> String {
    format!("{file_path}::{test_name}")
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}
