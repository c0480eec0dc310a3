//! Association-level scenarios:
//! rejection, malformed PDUs, and local aborts.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use dicom_dimse::association::Error as AssociationError;
use dicom_dimse::pdu::{
    AssociationRjResult, AssociationRjServiceUserReason, AssociationRjSource,
};
use dicom_dimse::service::user::Error as UserError;
use dicom_dimse::{CancelToken, ServiceProviderOptions, ServiceUserOptions, Status};

static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn spawn_echo_scp() -> (
    std::net::SocketAddr,
    CancelToken,
    std::thread::JoinHandle<()>,
) {
    let provider = ServiceProviderOptions::new()
        .ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .on_c_echo(|_connection| Status::success())
        .bind("127.0.0.1:0")
        .unwrap();
    let address = provider.local_addr().unwrap();
    let provider = Arc::new(provider);
    let cancel = CancelToken::new();
    let server = {
        let cancel = cancel.clone();
        std::thread::spawn(move || provider.run(&cancel).unwrap())
    };
    (address, cancel, server)
}

#[test]
fn association_is_rejected_when_nothing_is_acceptable() {
    let (address, cancel, server) = spawn_echo_scp();

    // the SCP only serves verification; propose CT storage only
    let err = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("ECHO-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .connect(address)
        .unwrap_err();

    match err {
        UserError::Establish {
            source: AssociationError::Rejected { result, source },
            ..
        } => {
            assert_eq!(result, AssociationRjResult::Permanent);
            assert_eq!(
                source,
                AssociationRjSource::ServiceUser(AssociationRjServiceUserReason::NoReasonGiven)
            );
        }
        other => panic!("expected a rejection, got {:?}", other),
    }

    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn called_ae_title_mismatch_is_rejected() {
    let provider = ServiceProviderOptions::new()
        .ae_title("STRICT-SCP")
        .accept_called_ae_title()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .bind("127.0.0.1:0")
        .unwrap();
    let address = provider.local_addr().unwrap();
    let provider = Arc::new(provider);
    let cancel = CancelToken::new();
    let server = {
        let cancel = cancel.clone();
        std::thread::spawn(move || provider.run(&cancel).unwrap())
    };

    let err = ServiceUserOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("SOMEONE-ELSE")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(address)
        .unwrap_err();

    match err {
        UserError::Establish {
            source: AssociationError::Rejected { source, .. },
            ..
        } => {
            assert_eq!(
                source,
                AssociationRjSource::ServiceUser(
                    AssociationRjServiceUserReason::CalledAeTitleNotRecognized
                )
            );
        }
        other => panic!("expected a rejection, got {:?}", other),
    }

    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn malformed_pdu_is_answered_with_abort() {
    let (address, cancel, server) = spawn_echo_scp();

    let mut stream = TcpStream::connect(address).unwrap();
    // PDU type 0x09 does not exist
    stream
        .write_all(&[0x09, 0x00, 0x00, 0x00, 0x00, 0x00])
        .unwrap();

    let mut answer = Vec::new();
    stream.read_to_end(&mut answer).unwrap();

    // an A-ABORT PDU (type 7, 4 payload bytes), then the socket closes
    assert!(answer.len() >= 10, "expected an A-ABORT, got {:?}", answer);
    assert_eq!(answer[0], 0x07);
    assert_eq!(&answer[2..6], &[0, 0, 0, 4]);

    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn local_abort_tears_the_association_down() {
    let (address, cancel, server) = spawn_echo_scp();

    let scu = ServiceUserOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(address)
        .unwrap();
    scu.abort().unwrap();

    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn connect_requires_an_abstract_syntax() {
    let (address, cancel, server) = spawn_echo_scp();

    let err = ServiceUserOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .connect(address)
        .unwrap_err();
    assert!(matches!(
        err,
        UserError::Establish {
            source: AssociationError::MissingAbstractSyntax { .. },
            ..
        }
    ));

    cancel.cancel();
    server.join().unwrap();
}
