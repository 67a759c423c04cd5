use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use intent_ledger_domain::EvidenceInventory;

/// Producer of the evidence inventory a run reconciles against.
pub trait EvidenceSource {
    /// Inventory of `root_directory`, optionally pinned to `commit_hash`.
    #[allow(clippy::missing_errors_doc)]
    fn inventory(
        &self,
        root_directory: &str,
        commit_hash: Option<&str>,
    ) -> Result<EvidenceInventory>;
}

/// In-memory inventories keyed by root directory.
#[derive(Debug, Clone, Default)]
pub struct StaticEvidenceSource {
    by_root: BTreeMap<String, EvidenceInventory>,
}

impl StaticEvidenceSource {
    #[must_use]
    pub fn new(root_directory: &str, inventory: EvidenceInventory) -> Self {
        let mut by_root = BTreeMap::new();
        by_root.insert(root_directory.to_string(), inventory);
        Self { by_root }
    }

    pub fn set(&mut self, root_directory: &str, inventory: EvidenceInventory) {
        self.by_root.insert(root_directory.to_string(), inventory);
    }
}

impl EvidenceSource for StaticEvidenceSource {
    fn inventory(
        &self,
        root_directory: &str,
        commit_hash: Option<&str>,
    ) -> Result<EvidenceInventory> {
        let inventory = self
            .by_root
            .get(root_directory)
            .ok_or_else(|| anyhow!("no evidence inventory registered for {root_directory}"))?;
        check_commit(inventory, commit_hash)?;
        Ok(inventory.clone())
    }
}

/// Reads the inventory JSON written by the manifest step.
///
/// A relative path is resolved against the run's root directory.
#[derive(Debug, Clone)]
pub struct JsonFileEvidenceSource {
    path: PathBuf,
}

impl JsonFileEvidenceSource {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn resolve(&self, root_directory: &str) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            Path::new(root_directory).join(&self.path)
        }
    }
}

impl EvidenceSource for JsonFileEvidenceSource {
    fn inventory(
        &self,
        root_directory: &str,
        commit_hash: Option<&str>,
    ) -> Result<EvidenceInventory> {
        let path = self.resolve(root_directory);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read evidence inventory {}", path.display()))?;
        let inventory: EvidenceInventory = serde_json::from_str(&raw)
            .with_context(|| format!("invalid evidence inventory {}", path.display()))?;
        check_commit(&inventory, commit_hash)?;
        Ok(inventory)
    }
}

fn check_commit(inventory: &EvidenceInventory, commit_hash: Option<&str>) -> Result<()> {
    match (commit_hash, inventory.commit_hash.as_deref()) {
        (Some(wanted), Some(actual)) if wanted != actual => Err(anyhow!(
            "evidence inventory is for commit {actual}, run requested {wanted}"
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{EvidenceSource, JsonFileEvidenceSource, StaticEvidenceSource};
    use intent_ledger_domain::EvidenceInventory;
    use ulid::Ulid;

    #[test]
    fn static_source_checks_commit() {
        let source = StaticEvidenceSource::new(
            "/repo",
            EvidenceInventory {
                commit_hash: Some("abc".to_string()),
                ..EvidenceInventory::default()
            },
        );
        assert!(source.inventory("/repo", Some("abc")).is_ok());
        assert!(source.inventory("/repo", None).is_ok());
        assert!(source.inventory("/repo", Some("def")).is_err());
        assert!(source.inventory("/other", None).is_err());
    }

    #[test]
    fn json_file_source_resolves_relative_paths() {
        let root = std::env::temp_dir().join(format!("intent-ledger-evidence-{}", Ulid::new()));
        assert!(std::fs::create_dir_all(&root).is_ok());
        let written = std::fs::write(
            root.join("inventory.json"),
            r#"{"commit_hash":"c1","tests":[{"file_path":"src/a.test.ts","test_name":"works"}]}"#,
        );
        assert!(written.is_ok());

        let source = JsonFileEvidenceSource::new(std::path::Path::new("inventory.json"));
        let root_text = root.to_string_lossy().to_string();
        let inventory = source.inventory(&root_text, Some("c1"));
        assert!(inventory.is_ok());
        let inventory = inventory.unwrap_or_else(|_| unreachable!());
        assert_eq!(inventory.tests.len(), 1);
        assert_eq!(inventory.tests[0].line_number, 0);
    }
}
