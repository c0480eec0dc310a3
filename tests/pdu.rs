//! Round-trip and boundary tests for the PDU codec.

use dicom_dimse::pdu::reader::Error as ReadError;
use dicom_dimse::pdu::writer::Error as WriteError;
use dicom_dimse::pdu::{
    read_pdu, write_pdu, AbortRqServiceProviderReason, AbortRqSource, AssociationRjResult,
    AssociationRjServiceUserReason, AssociationRjSource, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem, DEFAULT_MAX_PDU,
};

fn roundtrip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).expect("encoding should succeed");
    read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU, true).expect("decoding should succeed")
}

#[test]
fn association_rq_roundtrip() {
    let pdu = Pdu::AssociationRq {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-PACS".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUid("1.2.3.4.5".to_string()),
            UserVariableItem::ImplementationVersionName("ENGINE-1.0".to_string()),
            UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked: 4,
                max_operations_performed: 2,
            },
            UserVariableItem::RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: true,
                scp_role: false,
            },
        ],
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn association_ac_roundtrip() {
    let pdu = Pdu::AssociationAc {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-PACS".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![UserVariableItem::MaxLength(32768)],
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn association_rj_roundtrip() {
    let pdu = Pdu::AssociationRj {
        result: AssociationRjResult::Permanent,
        source: AssociationRjSource::ServiceUser(AssociationRjServiceUserReason::NoReasonGiven),
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn p_data_roundtrip() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x10; 64],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x20; 256],
            },
        ],
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn release_and_abort_roundtrip() {
    assert_eq!(roundtrip(&Pdu::ReleaseRq), Pdu::ReleaseRq);
    assert_eq!(roundtrip(&Pdu::ReleaseRp), Pdu::ReleaseRp);

    let abort = Pdu::AbortRq {
        source: AbortRqSource::ServiceProvider(AbortRqServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(roundtrip(&abort), abort);

    let abort = Pdu::AbortRq {
        source: AbortRqSource::ServiceUser,
    };
    assert_eq!(roundtrip(&abort), abort);
}

#[test]
fn unknown_user_sub_items_are_preserved() {
    let pdu = Pdu::AssociationRq {
        protocol_version: 1,
        calling_ae_title: "A".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::Unknown(0x77, vec![1, 2, 3, 4])],
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn zero_length_release_decodes() {
    // a release PDU whose reserved bytes were omitted entirely
    let bytes = [0x05, 0x00, 0x00, 0x00, 0x00, 0x00];
    let pdu = read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(pdu, Pdu::ReleaseRq);
}

#[test]
fn zero_length_abort_is_an_error() {
    let bytes = [0x07, 0x00, 0x00, 0x00, 0x00, 0x00];
    assert!(read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU, true).is_err());
}

#[test]
fn empty_p_data_decodes_to_no_values() {
    let bytes = [0x04, 0x00, 0x00, 0x00, 0x00, 0x00];
    let pdu = read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(pdu, Pdu::PData { data: vec![] });
}

#[test]
fn unknown_pdu_type_is_preserved_on_read_and_refused_on_write() {
    let bytes = [0x09, 0x00, 0x00, 0x00, 0x00, 0x02, 0xAB, 0xCD];
    let pdu = read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(
        pdu,
        Pdu::Unknown {
            pdu_type: 0x09,
            data: vec![0xAB, 0xCD],
        }
    );

    let mut out = Vec::new();
    assert!(matches!(
        write_pdu(&mut out, &pdu),
        Err(WriteError::EncodeUnknownPdu { pdu_type: 0x09, .. })
    ));
}

#[test]
fn oversized_pdu_is_rejected_in_strict_mode() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 8000],
            }],
        },
    )
    .unwrap();

    let err = read_pdu(&mut &bytes[..], 4096, true).unwrap_err();
    assert!(matches!(err, ReadError::PduTooLarge { .. }));
}

#[test]
fn empty_ae_titles_are_rejected() {
    // encoding refuses an empty calling AE title
    let pdu = Pdu::AssociationRq {
        protocol_version: 1,
        calling_ae_title: "  ".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![],
    };
    let mut out = Vec::new();
    assert!(write_pdu(&mut out, &pdu).is_err());
}

#[test]
fn even_presentation_context_ids_are_rejected() {
    let pdu = Pdu::AssociationRq {
        protocol_version: 1,
        calling_ae_title: "A".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 2,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let err = read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(matches!(
        err,
        ReadError::EvenPresentationContextId { id: 2, .. }
    ));
}
