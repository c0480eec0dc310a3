//! End-to-end C-ECHO over a loopback association.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dicom_dimse::{CancelToken, ServiceProviderOptions, ServiceUserOptions, Status};

static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

#[test]
fn echo_round_trip() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&handler_calls);

    let provider = ServiceProviderOptions::new()
        .ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .on_c_echo(move |_connection| {
            calls.fetch_add(1, Ordering::SeqCst);
            Status::success()
        })
        .bind("127.0.0.1:0")
        .unwrap();
    let address = provider.local_addr().unwrap();

    let provider = Arc::new(provider);
    let cancel = CancelToken::new();
    let server = {
        let provider = Arc::clone(&provider);
        let cancel = cancel.clone();
        std::thread::spawn(move || provider.run(&cancel).unwrap())
    };

    let scu = ServiceUserOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(address)
        .unwrap();

    assert_eq!(scu.peer_ae_title(), "ECHO-SCP");
    assert_eq!(scu.contexts().accepted().count(), 1);

    let status = scu.c_echo().unwrap();
    assert_eq!(status.code, 0x0000);
    assert!(status.is_success());

    scu.release().unwrap();
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn echo_without_a_server_side_handler_is_refused() {
    let provider = ServiceProviderOptions::new()
        .ae_title("MUTE-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .bind("127.0.0.1:0")
        .unwrap();
    let address = provider.local_addr().unwrap();

    let provider = Arc::new(provider);
    let cancel = CancelToken::new();
    let server = {
        let provider = Arc::clone(&provider);
        let cancel = cancel.clone();
        std::thread::spawn(move || provider.run(&cancel).unwrap())
    };

    let scu = ServiceUserOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("MUTE-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(address)
        .unwrap();

    let status = scu.c_echo().unwrap();
    // no registered handler answers with "unrecognized operation"
    assert_eq!(status.code, 0x0211);

    scu.release().unwrap();
    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn concurrent_echoes_are_correlated_by_message_id() {
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
        let provider = Arc::clone(&provider);
        let cancel = cancel.clone();
        std::thread::spawn(move || provider.run(&cancel).unwrap())
    };

    let scu = Arc::new(
        ServiceUserOptions::new()
            .calling_ae_title("ECHO-SCU")
            .called_ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION_SOP_CLASS)
            .connect(address)
            .unwrap(),
    );

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let scu = Arc::clone(&scu);
            std::thread::spawn(move || scu.c_echo().unwrap())
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap().is_success());
    }

    match Arc::try_unwrap(scu) {
        Ok(scu) => scu.release().unwrap(),
        Err(_) => panic!("association still shared"),
    }

    cancel.cancel();
    server.join().unwrap();
}
