//! Presentation context bookkeeping for one association.
//!
//! Once an association reaches the established state,
//! every DIMSE message travels under a presentation context:
//! a pairing of one abstract syntax (SOP class) UID
//! with one transfer syntax UID, identified by an odd number.
//! The [`ContextManager`] records the outcome of the negotiation
//! and is read-only for the rest of the association's lifetime.

use std::collections::BTreeMap;

use snafu::{ensure, OptionExt, Snafu};

use crate::pdu::{
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Duplicate presentation context ID {}", id))]
    DuplicateContextId { id: u8 },

    #[snafu(display("Invalid presentation context ID {} (must be odd)", id))]
    EvenContextId { id: u8 },

    #[snafu(display("Presentation context result for unknown ID {}", id))]
    UnknownContextId { id: u8 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One negotiated presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// the presentation context identifier
    pub id: u8,
    /// the abstract syntax (SOP class) UID
    pub abstract_syntax: String,
    /// the accorded transfer syntax UID
    pub transfer_syntax: String,
    /// whether the acceptor accepted this context
    pub accepted: bool,
}

/// The set of presentation contexts negotiated for one association.
///
/// Supports lookup by context ID and the inverse lookup
/// from an abstract syntax UID to an accepted context.
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    by_id: BTreeMap<u8, ContextEntry>,
}

impl ContextManager {
    /// Build the manager on the requestor side,
    /// by matching the acceptor's results against the proposed contexts.
    pub fn from_proposal(
        proposed: &[PresentationContextProposed],
        results: &[PresentationContextResult],
    ) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for result in results {
            let proposal = proposed
                .iter()
                .find(|pc| pc.id == result.id)
                .context(UnknownContextIdSnafu { id: result.id })?;
            insert_unique(
                &mut by_id,
                ContextEntry {
                    id: result.id,
                    abstract_syntax: proposal.abstract_syntax.clone(),
                    transfer_syntax: result.transfer_syntax.clone(),
                    accepted: result.reason == PresentationContextResultReason::Acceptance,
                },
            )?;
        }
        Ok(ContextManager { by_id })
    }

    /// Build the manager on the acceptor side,
    /// from the outcome of evaluating the association request.
    pub fn from_negotiated(contexts: &[PresentationContextNegotiated]) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for pc in contexts {
            insert_unique(
                &mut by_id,
                ContextEntry {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax: pc.transfer_syntax.clone(),
                    accepted: pc.reason == PresentationContextResultReason::Acceptance,
                },
            )?;
        }
        Ok(ContextManager { by_id })
    }

    /// Look up a context by its identifier.
    pub fn get(&self, id: u8) -> Option<&ContextEntry> {
        self.by_id.get(&id)
    }

    /// Look up an accepted context by its identifier.
    pub fn accepted_by_id(&self, id: u8) -> Option<&ContextEntry> {
        self.by_id.get(&id).filter(|entry| entry.accepted)
    }

    /// Find an accepted context for the given abstract syntax UID.
    pub fn find_abstract_syntax(&self, abstract_syntax_uid: &str) -> Option<&ContextEntry> {
        self.by_id
            .values()
            .find(|entry| entry.accepted && entry.abstract_syntax == abstract_syntax_uid)
    }

    /// Iterate over the accepted contexts, in ascending ID order.
    pub fn accepted(&self) -> impl Iterator<Item = &ContextEntry> {
        self.by_id.values().filter(|entry| entry.accepted)
    }

    /// Whether at least one context was accepted.
    pub fn has_accepted(&self) -> bool {
        self.accepted().next().is_some()
    }
}

fn insert_unique(by_id: &mut BTreeMap<u8, ContextEntry>, entry: ContextEntry) -> Result<()> {
    ensure!(entry.id % 2 == 1, EvenContextIdSnafu { id: entry.id });
    let id = entry.id;
    ensure!(
        by_id.insert(id, entry).is_none(),
        DuplicateContextIdSnafu { id }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PresentationContextResultReason as Reason;

    fn proposal(id: u8, abstract_syntax: &str) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }
    }

    fn result(id: u8, reason: Reason) -> PresentationContextResult {
        PresentationContextResult {
            id,
            reason,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
        }
    }

    #[test]
    fn matches_results_to_proposals() {
        let cm = ContextManager::from_proposal(
            &[proposal(1, "1.2.840.10008.1.1"), proposal(3, "1.2.3.4")],
            &[
                result(1, Reason::Acceptance),
                result(3, Reason::AbstractSyntaxNotSupported),
            ],
        )
        .unwrap();

        let entry = cm.accepted_by_id(1).unwrap();
        assert_eq!(entry.abstract_syntax, "1.2.840.10008.1.1");
        assert_eq!(entry.transfer_syntax, "1.2.840.10008.1.2");
        assert!(cm.accepted_by_id(3).is_none());
        assert!(cm.get(3).is_some());

        assert_eq!(
            cm.find_abstract_syntax("1.2.840.10008.1.1").map(|e| e.id),
            Some(1)
        );
        assert_eq!(cm.find_abstract_syntax("1.2.3.4"), None);
        assert_eq!(cm.accepted().count(), 1);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = ContextManager::from_proposal(
            &[proposal(1, "1.2.840.10008.1.1")],
            &[result(1, Reason::Acceptance), result(1, Reason::Acceptance)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateContextId { id: 1 }));
    }

    #[test]
    fn rejects_even_ids() {
        let err = ContextManager::from_proposal(
            &[proposal(2, "1.2.840.10008.1.1")],
            &[result(2, Reason::Acceptance)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::EvenContextId { id: 2 }));
    }

    #[test]
    fn unknown_result_id_is_an_error() {
        let err = ContextManager::from_proposal(
            &[proposal(1, "1.2.840.10008.1.1")],
            &[result(3, Reason::Acceptance)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownContextId { id: 3 }));
    }
}
