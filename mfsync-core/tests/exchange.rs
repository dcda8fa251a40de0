//! Protocol-level exchange: both ends of a session driven through the
//! codec and crypto layers only, with the store underneath, the way
//! the transfer sessions use them.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use mfsync_core::crypto::{self, Role, TAG_LEN};
use mfsync_core::protocol::{self, Message, Verdict};
use mfsync_core::{
    CryptoHandler, FileInfo, Keypair, ProgressRegistry, RequestedFile, Store,
};

fn handlers() -> (CryptoHandler, CryptoHandler) {
    (
        CryptoHandler::new(Arc::new(Keypair::generate())),
        CryptoHandler::new(Arc::new(Keypair::generate())),
    )
}

#[test]
fn file_info_from_disk_roundtrips_through_the_codec() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("document.txt");
    std::fs::write(&path, b"twelve bytes").unwrap();

    let info = FileInfo::from_path(&path, dir.path()).unwrap();
    assert_eq!(info.file_name, "document.txt");
    assert_eq!(info.size, 12);

    let payload = protocol::create_file_list_payload(std::slice::from_ref(&info), 8000);
    let parsed =
        protocol::parse_file_list_payload(&payload, IpAddr::V4(Ipv4Addr::LOCALHOST), "key")
            .unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].file_info, info);
}

#[test]
fn requested_file_encode_then_decode_is_identity() {
    let request = RequestedFile {
        file_info: FileInfo {
            file_name: "sub/data.bin".to_string(),
            size: 4096,
            sha256sum: Some("ab".repeat(32)),
        },
        offset: 1024,
        chunk_size: 1024,
    };
    let encoded = serde_json::to_string(&request).unwrap();
    // Wire field names are fixed by the protocol.
    assert!(encoded.contains("\"chunksize\":1024"));
    assert!(encoded.contains("\"file_info\""));
    let decoded: RequestedFile = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, request);
}

#[tokio::test]
async fn full_session_exchange_without_sockets() {
    let (client, server) = handlers();
    let client_pub = client.public_key_hex();
    let server_pub = server.public_key_hex();

    // Server side storage with one shared file.
    let server_dir = tempfile::tempdir().unwrap();
    std::fs::write(server_dir.path().join("shared.bin"), vec![7u8; 2500]).unwrap();
    let server_store = Store::new(
        server_dir.path().to_path_buf(),
        true,
        Arc::new(ProgressRegistry::new()),
    );
    server_store.init().await.unwrap();

    // Client side storage the file lands in.
    let client_dir = tempfile::tempdir().unwrap();
    let client_store = Store::new(
        client_dir.path().to_path_buf(),
        true,
        Arc::new(ProgressRegistry::new()),
    );

    // Handshake: the client derives with a fresh salt and sends the
    // opener; the server trusts and answers an encrypted verdict.
    let salt = crypto::encode(&crypto::generate_salt());
    let client_session = client.derive(&server_pub, &salt, Role::Initiator).unwrap();
    let opener = protocol::encode_message(&Message::Handshake {
        public_key: client_pub.clone(),
        salt: salt.clone(),
    });

    let Message::Handshake {
        public_key: seen_key,
        salt: seen_salt,
    } = protocol::decode_message(&opener).unwrap()
    else {
        panic!("expected a handshake opener");
    };
    server.trust(&seen_key, &seen_salt, Role::Responder).unwrap();
    let server_session = server.derive(&seen_key, &seen_salt, Role::Responder).unwrap();

    let verdict_plain = serde_json::to_vec(&Verdict::Accepted).unwrap();
    let verdict = server_session
        .encrypt(&seen_key, &verdict_plain, "")
        .unwrap();
    let verdict_wire =
        protocol::create_verdict_message(true, &server_session.public_key_hex(), &verdict);

    let Message::Accepted {
        message: verdict_message,
        ..
    } = protocol::decode_message(&verdict_wire).unwrap()
    else {
        panic!("expected an accepted envelope");
    };
    let received = protocol::parse_wrapper(&verdict_message).unwrap();
    let plain = client_session.decrypt(&server_pub, &received).unwrap();
    assert!(matches!(
        serde_json::from_slice::<Verdict>(&plain).unwrap(),
        Verdict::Accepted
    ));

    // List exchange: the envelope's open counter resyncs the receiver.
    let listed = server_store.stored_files_with_hashes().await;
    let payload = protocol::create_file_list_payload(&listed, 8000);
    let reply_wrapper = server_session
        .encrypt(&seen_key, payload.as_bytes(), "")
        .unwrap();
    let reply_wire =
        protocol::create_file_list_reply(&server_session.public_key_hex(), &reply_wrapper);

    let Message::FileList {
        count,
        message: Some(reply_message),
        ..
    } = protocol::decode_message(&reply_wire).unwrap()
    else {
        panic!("expected a file list reply envelope");
    };
    assert_eq!(count, Some(1));
    let reply = protocol::parse_wrapper(&reply_message).unwrap();

    let reply_plain = client_session.decrypt(&server_pub, &reply).unwrap();
    let availables = protocol::parse_file_list_payload(
        std::str::from_utf8(&reply_plain).unwrap(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        &server_pub,
    )
    .unwrap();
    client_store.add_available_files(availables.clone());
    assert!(client_store.is_available("shared.bin"));

    // File request: client locks the name, asks from its resume offset.
    let mut request = RequestedFile {
        file_info: availables[0].file_info.clone(),
        offset: 0,
        chunk_size: 1024,
    };
    let mut writer = client_store.create_file(&mut request).unwrap();
    let request_wrapper = client_session
        .encrypt(&server_pub, &serde_json::to_vec(&request).unwrap(), "")
        .unwrap();

    let request_plain = server_session.decrypt(&seen_key, &request_wrapper).unwrap();
    let served: RequestedFile = serde_json::from_slice(&request_plain).unwrap();
    assert!(server_store.is_stored(&served.file_info));

    // Stream: chunk frames advance lock-step, the last one is short.
    let bytes = std::fs::read(server_dir.path().join("shared.bin")).unwrap();
    let mut offset = served.offset as usize;
    while offset < bytes.len() {
        let end = (offset + served.chunk_size as usize).min(bytes.len());
        let frame = server_session
            .encrypt_chunk(&seen_key, &bytes[offset..end])
            .unwrap();
        assert_eq!(frame.len(), end - offset + TAG_LEN);

        let chunk = client_session.decrypt_chunk(&server_pub, &frame).unwrap();
        writer.write_chunk(&chunk).await.unwrap();
        offset = end;
    }
    writer.flush().await.unwrap();

    client_store.finalize_file(&request.file_info).await.unwrap();
    drop(writer);

    assert!(client_store.is_stored(&request.file_info));
    assert_eq!(
        std::fs::read(client_dir.path().join("shared.bin")).unwrap(),
        bytes
    );
}

#[tokio::test]
async fn tampered_chunk_aborts_before_finalize() {
    let (client, server) = handlers();
    let server_pub = server.public_key_hex();
    let client_pub = client.public_key_hex();

    let salt = crypto::encode(&crypto::generate_salt());
    let client_session = client.derive(&server_pub, &salt, Role::Initiator).unwrap();
    let server_session = server.derive(&client_pub, &salt, Role::Responder).unwrap();

    let client_dir = tempfile::tempdir().unwrap();
    let client_store = Store::new(
        client_dir.path().to_path_buf(),
        false,
        Arc::new(ProgressRegistry::new()),
    );

    let mut request = RequestedFile {
        file_info: FileInfo {
            file_name: "poisoned.bin".to_string(),
            size: 2048,
            sha256sum: None,
        },
        offset: 0,
        chunk_size: 1024,
    };
    let mut writer = client_store.create_file(&mut request).unwrap();

    let clean = server_session.encrypt_chunk(&client_pub, &[1u8; 1024]).unwrap();
    let chunk = client_session.decrypt_chunk(&server_pub, &clean).unwrap();
    writer.write_chunk(&chunk).await.unwrap();

    let mut tampered = server_session.encrypt_chunk(&client_pub, &[2u8; 1024]).unwrap();
    tampered[100] ^= 0x01;
    assert!(client_session
        .decrypt_chunk(&server_pub, &tampered)
        .is_err());

    // The session aborts: writer dropped, temp kept, nothing renamed.
    writer.flush().await.unwrap();
    drop(writer);
    assert!(client_dir.path().join("poisoned.bin.mfsync").exists());
    assert!(!client_dir.path().join("poisoned.bin").exists());
    assert!(!client_store.is_stored(&request.file_info));
}
