use std::collections::BTreeSet;

use intent_ledger_domain::{EvidenceInventory, LedgerError, LedgerResult, MAX_SCORE};

use crate::{CandidateAtom, CandidateMolecule};

#[derive(Debug, Clone, PartialEq)]
pub struct GroundedAtom {
    pub candidate: CandidateAtom,
    pub confidence: u8,
    /// Related-doc references stripped because the inventory does not contain them.
    pub dropped_docs: Vec<String>,
}

/// Round a capability confidence into a score.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for non-finite or out-of-range values.
pub fn confidence_to_score(confidence: f64) -> LedgerResult<u8> {
    if !confidence.is_finite() || !(0.0..=f64::from(MAX_SCORE)).contains(&confidence) {
        return Err(LedgerError::Validation(format!(
            "confidence {confidence} outside 0..=100"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rounded = confidence.round() as u8;
    Ok(rounded.min(MAX_SCORE))
}

/// Check a candidate against the inventory it was inferred from.
///
/// The cited test must exist in the inventory and must be the test the
/// inference was asked about (`inferred_key`, `file::name`). Its line number is
/// taken from the inventory. Unknown related docs are stripped rather than
/// rejected.
///
/// # Errors
/// Returns [`LedgerError::GroundingViolation`] when the source test is empty,
/// absent from the inventory or a different test, and
/// [`LedgerError::Validation`] for malformed fields.
pub fn ground_candidate(
    candidate: &CandidateAtom,
    inventory: &EvidenceInventory,
    inferred_key: &str,
) -> LedgerResult<GroundedAtom> {
    let source = &candidate.source_test;
    if source.is_empty() {
        return Err(LedgerError::GroundingViolation(
            "candidate cites an empty source test".to_string(),
        ));
    }
    let Some(evidence) = inventory.find_test(&source.file_path, &source.test_name) else {
        return Err(LedgerError::GroundingViolation(format!(
            "candidate cites {} which is not in the evidence inventory",
            source.key()
        )));
    };
    if source.key() != inferred_key {
        return Err(LedgerError::GroundingViolation(format!(
            "candidate inferred from {inferred_key} cites a different test {}",
            source.key()
        )));
    }
    if candidate.description.trim().is_empty() {
        return Err(LedgerError::Validation(format!(
            "candidate for {} has an empty description",
            source.key()
        )));
    }
    let confidence = confidence_to_score(candidate.confidence)?;

    let mut grounded = candidate.clone();
    grounded.source_test.line_number = evidence.line_number;
    let (kept, dropped): (Vec<String>, Vec<String>) = candidate
        .related_docs
        .iter()
        .cloned()
        .partition(|doc| inventory.contains_doc(doc));
    grounded.related_docs = kept;
    grounded.description = candidate.description.trim().to_string();

    Ok(GroundedAtom {
        candidate: grounded,
        confidence,
        dropped_docs: dropped,
    })
}

/// Validate a proposed grouping and return its distinct members in order.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when fewer than two distinct members
/// remain, a member is not among `known_temp_ids`, or the confidence is invalid.
pub fn validate_molecule(
    candidate: &CandidateMolecule,
    known_temp_ids: &BTreeSet<String>,
) -> LedgerResult<(Vec<String>, u8)> {
    if candidate.name.trim().is_empty() {
        return Err(LedgerError::Validation(
            "molecule candidate has an empty name".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    let mut members = Vec::new();
    for member in &candidate.atom_temp_ids {
        if !known_temp_ids.contains(member) {
            return Err(LedgerError::Validation(format!(
                "molecule '{}' references unknown atom {member}",
                candidate.name
            )));
        }
        if seen.insert(member.clone()) {
            members.push(member.clone());
        }
    }
    if members.len() < 2 {
        return Err(LedgerError::Validation(format!(
            "molecule '{}' needs at least two distinct atoms, got {}",
            candidate.name,
            members.len()
        )));
    }
    let confidence = confidence_to_score(candidate.confidence)?;
    Ok((members, confidence))
}
