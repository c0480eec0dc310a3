//! Evaluation of association requests on the acceptor side.
//!
//! Given the acceptor's policy and the content of an A-ASSOCIATE-RQ,
//! this module decides between acceptance and rejection,
//! negotiates each proposed presentation context,
//! and builds the PDU to answer with.

use std::borrow::Cow;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::association::uid::trim_uid;
use crate::association::{NegotiatedOptions, RejectedSnafu};
use crate::pdu::{
    AssociationRjResult, AssociationRjServiceUserReason, AssociationRjSource, Pdu,
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU,
    DICOM_APPLICATION_CONTEXT_NAME,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Implicit VR Little Endian, the fallback transfer syntax
/// reported in rejected presentation contexts.
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// The acceptor side's negotiation policy.
#[derive(Debug, Clone)]
pub(crate) struct AcceptorPolicy {
    /// the AE title of this node
    pub ae_title: String,
    /// whether the called AE title must match `ae_title`
    pub require_called_ae_title: bool,
    /// the abstract syntaxes this node is willing to serve
    pub abstract_syntax_uids: Vec<Cow<'static, str>>,
    /// the transfer syntaxes this node admits;
    /// when empty, anything the transfer syntax registry can decode
    pub transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// whether to accept abstract syntaxes not on the list
    pub promiscuous: bool,
    /// the maximum PDU length this node is willing to receive
    pub max_pdu_length: u32,
}

/// The result of evaluating an association request:
/// the PDU to send back and, on acceptance, the negotiated options.
pub(crate) type Outcome =
    Result<(Pdu, NegotiatedOptions), (Pdu, crate::association::Error)>;

/// Evaluate an A-ASSOCIATE-RQ against the policy.
pub(crate) fn evaluate(
    policy: &AcceptorPolicy,
    protocol_version: u16,
    calling_ae_title: String,
    called_ae_title: String,
    application_context_name: String,
    presentation_contexts: Vec<PresentationContextProposed>,
    user_variables: Vec<UserVariableItem>,
) -> Outcome {
    // only bit 0 of the protocol version is meaningful
    if protocol_version & 0x0001 == 0 {
        return Err(reject(
            AssociationRjSource::ServiceProviderAcse(
                crate::pdu::AssociationRjServiceProviderAcseReason::ProtocolVersionNotSupported,
            ),
        ));
    }

    if application_context_name != DICOM_APPLICATION_CONTEXT_NAME {
        return Err(reject(AssociationRjSource::ServiceUser(
            AssociationRjServiceUserReason::ApplicationContextNameNotSupported,
        )));
    }

    if policy.require_called_ae_title && called_ae_title != policy.ae_title {
        return Err(reject(AssociationRjSource::ServiceUser(
            AssociationRjServiceUserReason::CalledAeTitleNotRecognized,
        )));
    }

    // the peer's maximum PDU length; 0 means practically unlimited
    let peer_max_pdu_length = user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU);
    let peer_max_pdu_length = if peer_max_pdu_length == 0 {
        u32::MAX
    } else {
        peer_max_pdu_length
    };

    let presentation_contexts_negotiated: Vec<_> = presentation_contexts
        .into_iter()
        .map(|pc| {
            let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax));
            if !policy.abstract_syntax_uids.contains(&abstract_syntax) && !policy.promiscuous {
                return PresentationContextNegotiated {
                    id: pc.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                    abstract_syntax: abstract_syntax.to_string(),
                };
            }

            let (transfer_syntax, reason) = choose_ts(policy, pc.transfer_syntaxes)
                .map(|ts| (ts, PresentationContextResultReason::Acceptance))
                .unwrap_or_else(|| {
                    (
                        IMPLICIT_VR_LE.to_string(),
                        PresentationContextResultReason::TransferSyntaxesNotSupported,
                    )
                });

            PresentationContextNegotiated {
                id: pc.id,
                reason,
                transfer_syntax,
                abstract_syntax: abstract_syntax.to_string(),
            }
        })
        .collect();

    // an association in which nothing can be exchanged is refused outright
    if !presentation_contexts_negotiated
        .iter()
        .any(|pc| pc.reason == PresentationContextResultReason::Acceptance)
    {
        return Err(reject(AssociationRjSource::ServiceUser(
            AssociationRjServiceUserReason::NoReasonGiven,
        )));
    }

    let pdu = Pdu::AssociationAc {
        protocol_version: 1,
        application_context_name,
        calling_ae_title: calling_ae_title.clone(),
        called_ae_title: called_ae_title.clone(),
        presentation_contexts: presentation_contexts_negotiated
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: pc.reason,
                transfer_syntax: pc.transfer_syntax.clone(),
            })
            .collect(),
        user_variables: vec![
            UserVariableItem::MaxLength(policy.max_pdu_length),
            UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ],
    };

    Ok((
        pdu,
        NegotiatedOptions {
            peer_max_pdu_length,
            presentation_contexts: presentation_contexts_negotiated,
            peer_ae_title: calling_ae_title,
            called_ae_title,
            user_variables,
        },
    ))
}

fn reject(source: AssociationRjSource) -> (Pdu, crate::association::Error) {
    let result = AssociationRjResult::Permanent;
    (
        Pdu::AssociationRj { result, source },
        RejectedSnafu { result, source }.build(),
    )
}

/// From the proposed transfer syntaxes,
/// choose the first one which is both on the policy's list
/// (any, if the list is empty) and supported by the registry.
fn choose_ts<I, T>(policy: &AcceptorPolicy, it: I) -> Option<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter()
        .map(|ts| trim_uid(Cow::from(ts.as_ref().to_string())).to_string())
        .find(|ts| {
            let admitted = policy.transfer_syntax_uids.is_empty()
                || policy.transfer_syntax_uids.contains(&Cow::from(ts.clone()));
            admitted && is_supported(ts)
        })
}

/// Check that the main transfer syntax registry supports
/// the given transfer syntax,
/// meaning that data sets in it can be parsed and decoded.
pub fn is_supported(ts_uid: &str) -> bool {
    TransferSyntaxRegistry
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn policy() -> AcceptorPolicy {
        AcceptorPolicy {
            ae_title: "THIS-SCP".to_string(),
            require_called_ae_title: false,
            abstract_syntax_uids: vec![Cow::from(VERIFICATION)],
            transfer_syntax_uids: vec![],
            promiscuous: false,
            max_pdu_length: DEFAULT_MAX_PDU,
        }
    }

    fn verification_rq() -> Vec<PresentationContextProposed> {
        vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string(), EXPLICIT_VR_LE.to_string()],
        }]
    }

    #[test]
    fn accepts_a_known_abstract_syntax() {
        let (pdu, options) = evaluate(
            &policy(),
            1,
            "SCU".to_string(),
            "THIS-SCP".to_string(),
            DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            verification_rq(),
            vec![UserVariableItem::MaxLength(32768)],
        )
        .unwrap();

        assert!(matches!(pdu, Pdu::AssociationAc { .. }));
        assert_eq!(options.peer_max_pdu_length, 32768);
        assert_eq!(options.peer_ae_title, "SCU");
        assert_eq!(options.presentation_contexts.len(), 1);
        assert_eq!(
            options.presentation_contexts[0].reason,
            PresentationContextResultReason::Acceptance
        );
        assert_eq!(
            options.presentation_contexts[0].transfer_syntax,
            IMPLICIT_VR_LE
        );
    }

    #[test]
    fn rejects_when_no_context_is_acceptable() {
        let (pdu, _err) = evaluate(
            &policy(),
            1,
            "SCU".to_string(),
            "THIS-SCP".to_string(),
            DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            }],
            vec![],
        )
        .unwrap_err();

        assert!(matches!(
            pdu,
            Pdu::AssociationRj {
                result: AssociationRjResult::Permanent,
                source: AssociationRjSource::ServiceUser(
                    AssociationRjServiceUserReason::NoReasonGiven
                ),
            }
        ));
    }

    #[test]
    fn rejects_wrong_application_context() {
        let (pdu, _err) = evaluate(
            &policy(),
            1,
            "SCU".to_string(),
            "THIS-SCP".to_string(),
            "1.2.3.4".to_string(),
            verification_rq(),
            vec![],
        )
        .unwrap_err();
        assert!(matches!(
            pdu,
            Pdu::AssociationRj {
                source: AssociationRjSource::ServiceUser(
                    AssociationRjServiceUserReason::ApplicationContextNameNotSupported
                ),
                ..
            }
        ));
    }

    #[test]
    fn rejects_wrong_called_ae_title_when_required() {
        let mut policy = policy();
        policy.require_called_ae_title = true;
        let (pdu, _err) = evaluate(
            &policy,
            1,
            "SCU".to_string(),
            "OTHER-SCP".to_string(),
            DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            verification_rq(),
            vec![],
        )
        .unwrap_err();
        assert!(matches!(
            pdu,
            Pdu::AssociationRj {
                source: AssociationRjSource::ServiceUser(
                    AssociationRjServiceUserReason::CalledAeTitleNotRecognized
                ),
                ..
            }
        ));
    }

    #[test]
    fn unknown_transfer_syntaxes_reject_the_context_only() {
        let contexts = vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: vec!["1.2.3.999".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            },
        ];
        let (_pdu, options) = evaluate(
            &policy(),
            1,
            "SCU".to_string(),
            "THIS-SCP".to_string(),
            DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            contexts,
            vec![],
        )
        .unwrap();

        assert_eq!(
            options.presentation_contexts[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
        assert_eq!(
            options.presentation_contexts[1].reason,
            PresentationContextResultReason::Acceptance
        );
    }
}
