//! End-to-end C-STORE over a loopback association,
//! including the spill-to-disk path for large data sets.

use std::sync::{Arc, Mutex};

use dicom_dimse::{CancelToken, ServiceProviderOptions, ServiceUserOptions, Status};

static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static SOP_INSTANCE_UID: &str = "1.2.3.4.5.6.789.0.123456";

#[derive(Debug, Default, Clone)]
struct SeenStore {
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax_uid: String,
    size: u64,
    spooled: bool,
    content_ok: bool,
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn spawn_store_scp(
    spool_threshold: usize,
    expected_len: usize,
) -> (
    Arc<dicom_dimse::ServiceProvider>,
    std::net::SocketAddr,
    CancelToken,
    std::thread::JoinHandle<()>,
    Arc<Mutex<Option<SeenStore>>>,
) {
    let seen = Arc::new(Mutex::new(None));
    let seen_in_handler = Arc::clone(&seen);

    let provider = ServiceProviderOptions::new()
        .ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .spool_threshold(spool_threshold)
        .on_c_store(move |_connection, _cancel, request, data| {
            let mut data = match data {
                Some(data) => data,
                None => return Status::new(0xC000),
            };
            let size = data.size();
            let spooled = data.is_spooled();
            let bytes = match data.read_all() {
                Ok(bytes) => bytes,
                Err(_) => return Status::new(0xC000),
            };
            let content_ok = bytes == payload(expected_len);
            if data.ack().is_err() {
                return Status::new(0xC000);
            }

            *seen_in_handler.lock().unwrap() = Some(SeenStore {
                sop_class_uid: request.sop_class_uid.clone(),
                sop_instance_uid: request.sop_instance_uid.clone(),
                transfer_syntax_uid: request.transfer_syntax_uid.clone(),
                size,
                spooled,
                content_ok,
            });
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
    (provider, address, cancel, server, seen)
}

#[test]
fn store_small_image() {
    let len = 50 * 1024;
    let (_provider, address, cancel, server, seen) = spawn_store_scp(100 * 1024 * 1024, len);

    let scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .connect(address)
        .unwrap();

    let data = payload(len);
    let status = scu
        .c_store(CT_IMAGE_STORAGE, SOP_INSTANCE_UID, &mut &data[..])
        .unwrap();
    assert_eq!(status.code, 0x0000);

    scu.release().unwrap();

    let seen = seen.lock().unwrap().clone().expect("handler not invoked");
    assert_eq!(seen.sop_class_uid, CT_IMAGE_STORAGE);
    assert_eq!(seen.sop_instance_uid, SOP_INSTANCE_UID);
    assert_eq!(seen.size, len as u64);
    assert!(!seen.spooled);
    assert!(seen.content_ok);
    assert!(!seen.transfer_syntax_uid.is_empty());

    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn store_large_image_spills_to_disk() {
    // a 1 MiB data set against a 64 KiB threshold
    // exercises the same spill path as a multi-gigabyte transfer
    let len = 1024 * 1024;
    let (_provider, address, cancel, server, seen) = spawn_store_scp(64 * 1024, len);

    let scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .connect(address)
        .unwrap();

    let data = payload(len);
    let status = scu
        .c_store(CT_IMAGE_STORAGE, SOP_INSTANCE_UID, &mut &data[..])
        .unwrap();
    assert_eq!(status.code, 0x0000);

    scu.release().unwrap();

    let seen = seen.lock().unwrap().clone().expect("handler not invoked");
    assert_eq!(seen.size, len as u64);
    assert!(seen.spooled);
    assert!(seen.content_ok);

    cancel.cancel();
    server.join().unwrap();
}

#[test]
fn store_status_is_returned_verbatim() {
    let provider = ServiceProviderOptions::new()
        .ae_title("FULL-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .on_c_store(move |_connection, _cancel, _request, data| {
            if let Some(data) = data {
                let _ = data.ack();
            }
            Status::with_comment(0xA700, "storage full")
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
        .calling_ae_title("STORE-SCU")
        .called_ae_title("FULL-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .connect(address)
        .unwrap();

    let data = payload(2048);
    let status = scu
        .c_store(CT_IMAGE_STORAGE, SOP_INSTANCE_UID, &mut &data[..])
        .unwrap();
    assert_eq!(status.code, 0xA700);
    assert_eq!(status.error_comment.as_deref(), Some("storage full"));

    scu.release().unwrap();
    cancel.cancel();
    server.join().unwrap();
}
