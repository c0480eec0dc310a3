//! End-to-end C-MOVE and C-GET with their C-STORE sub-operations.

use std::sync::{Arc, Mutex};

use dicom_dimse::service::SubOperation;
use dicom_dimse::{CancelToken, Message, ServiceProviderOptions, ServiceUserOptions, Status};

static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static STUDY_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
static STUDY_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";

type StoredInstances = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

fn matched_instances() -> Vec<SubOperation> {
    (0..2u8)
        .map(|i| SubOperation {
            remaining: Some(1 - u16::from(i)),
            sop_class_uid: CT_IMAGE_STORAGE.to_string(),
            sop_instance_uid: format!("1.2.3.4.{}", i),
            data: vec![0xD0 + i; 4096],
        })
        .collect()
}

#[test]
fn move_performs_stores_on_the_destination() {
    // destination SCP, recording everything stored on it
    let stored: StoredInstances = Arc::new(Mutex::new(Vec::new()));
    let stored_in_handler = Arc::clone(&stored);
    let destination = ServiceProviderOptions::new()
        .ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .on_c_store(move |_connection, _cancel, request, data| {
            let mut data = match data {
                Some(data) => data,
                None => return Status::new(0xC000),
            };
            let bytes = match data.read_all() {
                Ok(bytes) => bytes,
                Err(_) => return Status::new(0xC000),
            };
            let _ = data.ack();
            stored_in_handler
                .lock()
                .unwrap()
                .push((request.sop_instance_uid.clone(), bytes));
            Status::success()
        })
        .bind("127.0.0.1:0")
        .unwrap();
    let destination_addr = destination.local_addr().unwrap();
    let destination = Arc::new(destination);
    let cancel = CancelToken::new();
    let destination_thread = {
        let destination = Arc::clone(&destination);
        let cancel = cancel.clone();
        std::thread::spawn(move || destination.run(&cancel).unwrap())
    };

    // the move SCP knows the destination by its AE title
    let mover = ServiceProviderOptions::new()
        .ae_title("MOVE-SCP")
        .with_abstract_syntax(STUDY_ROOT_QR_MOVE)
        .remote_ae("STORE-SCP", destination_addr.to_string())
        .on_c_move(|_connection, _cancel, _query, subs| {
            for sub in matched_instances() {
                if subs.send(Ok(sub)).is_err() {
                    return;
                }
            }
        })
        .bind("127.0.0.1:0")
        .unwrap();
    let mover_addr = mover.local_addr().unwrap();
    let mover = Arc::new(mover);
    let mover_thread = {
        let mover = Arc::clone(&mover);
        let cancel = cancel.clone();
        std::thread::spawn(move || mover.run(&cancel).unwrap())
    };

    let scu = ServiceUserOptions::new()
        .calling_ae_title("MOVE-SCU")
        .called_ae_title("MOVE-SCP")
        .with_abstract_syntax(STUDY_ROOT_QR_MOVE)
        .connect(mover_addr)
        .unwrap();

    let responses: Vec<_> = scu
        .c_move(STUDY_ROOT_QR_MOVE, "STORE-SCP", &[0x11; 16])
        .unwrap()
        .map(|item| item.unwrap())
        .collect();

    assert_eq!(responses.len(), 3);
    for (i, reply) in responses[..2].iter().enumerate() {
        match &reply.message {
            Message::CMoveRsp(rsp) => {
                assert!(rsp.status.is_pending());
                assert_eq!(rsp.completed, Some(i as u16 + 1));
                assert_eq!(rsp.failed, Some(0));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    match &responses[2].message {
        Message::CMoveRsp(rsp) => {
            assert!(rsp.status.is_success());
            assert_eq!(rsp.completed, Some(2));
            assert_eq!(rsp.failed, Some(0));
        }
        other => panic!("unexpected message {:?}", other),
    }

    let stored = stored.lock().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].0, "1.2.3.4.0");
    assert_eq!(stored[0].1, vec![0xD0; 4096]);
    assert_eq!(stored[1].0, "1.2.3.4.1");
    assert_eq!(stored[1].1, vec![0xD1; 4096]);
    drop(stored);

    scu.release().unwrap();
    cancel.cancel();
    mover_thread.join().unwrap();
    destination_thread.join().unwrap();
}

#[test]
fn move_to_an_unknown_destination_fails() {
    let mover = ServiceProviderOptions::new()
        .ae_title("MOVE-SCP")
        .with_abstract_syntax(STUDY_ROOT_QR_MOVE)
        .on_c_move(|_connection, _cancel, _query, _subs| {
            panic!("the handler must not run for an unknown destination");
        })
        .bind("127.0.0.1:0")
        .unwrap();
    let mover_addr = mover.local_addr().unwrap();
    let mover = Arc::new(mover);
    let cancel = CancelToken::new();
    let mover_thread = {
        let mover = Arc::clone(&mover);
        let cancel = cancel.clone();
        std::thread::spawn(move || mover.run(&cancel).unwrap())
    };

    let scu = ServiceUserOptions::new()
        .calling_ae_title("MOVE-SCU")
        .called_ae_title("MOVE-SCP")
        .with_abstract_syntax(STUDY_ROOT_QR_MOVE)
        .connect(mover_addr)
        .unwrap();

    let responses: Vec<_> = scu
        .c_move(STUDY_ROOT_QR_MOVE, "NOWHERE", &[0x11; 16])
        .unwrap()
        .map(|item| item.unwrap())
        .collect();

    assert_eq!(responses.len(), 1);
    let status = responses[0].message.status().unwrap();
    assert_eq!(status.code, 0xA801);

    scu.release().unwrap();
    cancel.cancel();
    mover_thread.join().unwrap();
}

#[test]
fn get_performs_stores_over_the_same_association() {
    let getter = ServiceProviderOptions::new()
        .ae_title("GET-SCP")
        .with_abstract_syntax(STUDY_ROOT_QR_GET)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .on_c_get(|_connection, _cancel, _query, subs| {
            for sub in matched_instances() {
                if subs.send(Ok(sub)).is_err() {
                    return;
                }
            }
        })
        .bind("127.0.0.1:0")
        .unwrap();
    let getter_addr = getter.local_addr().unwrap();
    let getter = Arc::new(getter);
    let cancel = CancelToken::new();
    let getter_thread = {
        let getter = Arc::clone(&getter);
        let cancel = cancel.clone();
        std::thread::spawn(move || getter.run(&cancel).unwrap())
    };

    let received: StoredInstances = Arc::new(Mutex::new(Vec::new()));
    let received_in_handler = Arc::clone(&received);

    let scu = ServiceUserOptions::new()
        .calling_ae_title("GET-SCU")
        .called_ae_title("GET-SCP")
        .with_abstract_syntax(STUDY_ROOT_QR_GET)
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .on_c_store(move |_connection, _cancel, request, data| {
            let mut data = match data {
                Some(data) => data,
                None => return Status::new(0xC000),
            };
            let bytes = match data.read_all() {
                Ok(bytes) => bytes,
                Err(_) => return Status::new(0xC000),
            };
            let _ = data.ack();
            received_in_handler
                .lock()
                .unwrap()
                .push((request.sop_instance_uid.clone(), bytes));
            Status::success()
        })
        .connect(getter_addr)
        .unwrap();

    let responses: Vec<_> = scu
        .c_get(STUDY_ROOT_QR_GET, &[0x33; 16])
        .unwrap()
        .map(|item| item.unwrap())
        .collect();

    assert_eq!(responses.len(), 3);
    match &responses[2].message {
        Message::CGetRsp(rsp) => {
            assert!(rsp.status.is_success());
            assert_eq!(rsp.completed, Some(2));
            assert_eq!(rsp.failed, Some(0));
        }
        other => panic!("unexpected message {:?}", other),
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].0, "1.2.3.4.0");
    assert_eq!(received[1].1, vec![0xD1; 4096]);
    drop(received);

    scu.release().unwrap();
    cancel.cancel();
    getter_thread.join().unwrap();
}
