//! Protocol-level tests: id echo, ordering, concurrency, malformed and
//! version-mismatched requests.

use keyless_protocol::{
    ErrorCode, Opcode, TAG_OPCODE, TAG_PAYLOAD, VERSION_MAJOR,
};

use crate::harness::{item, read_response, request, send_frame, send_raw_frame, TestServer};

#[tokio::test]
async fn test_ping_echo_preserves_id() {
    let server = TestServer::start().await.unwrap();
    let mut conn = server.connect().await.unwrap();

    let ping = request(0xDEAD_BEEF, Opcode::Ping, None, Some(b"abcdef\x00"));
    send_frame(&mut conn, &ping).await.unwrap();

    let (header, items) = read_response(&mut conn).await.unwrap();
    assert_eq!(header.id, 0xDEAD_BEEF);
    assert_eq!(header.version_major, VERSION_MAJOR);
    assert_eq!(items.opcode, Some(Opcode::Response as u8));
    assert_eq!(items.payload.as_deref(), Some(b"abcdef\x00".as_slice()));
    assert_eq!(items.error, None);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let server = TestServer::start().await.unwrap();
    let mut conn = server.connect().await.unwrap();

    // Write all requests before reading a single response.
    for id in 0..10u32 {
        let payload = format!("payload-{id}");
        let ping = request(id, Opcode::Ping, None, Some(payload.as_bytes()));
        send_frame(&mut conn, &ping).await.unwrap();
    }

    for id in 0..10u32 {
        let (header, items) = read_response(&mut conn).await.unwrap();
        assert_eq!(header.id, id, "responses must arrive in request order");
        assert_eq!(
            items.payload.as_deref(),
            Some(format!("payload-{id}").as_bytes())
        );
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_connections_all_answered() {
    let server = TestServer::start().await.unwrap();

    let mut tasks = Vec::new();
    for conn_idx in 0..4u32 {
        let mut conn = server.connect().await.unwrap();
        tasks.push(tokio::spawn(async move {
            for req_idx in 0..5u32 {
                let id = conn_idx << 16 | req_idx;
                let payload = id.to_be_bytes();
                let ping = request(id, Opcode::Ping, None, Some(&payload));
                send_frame(&mut conn, &ping).await.unwrap();
                let (header, items) = read_response(&mut conn).await.unwrap();
                assert_eq!(header.id, id);
                assert_eq!(items.payload.as_deref(), Some(payload.as_slice()));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_version_mismatch_then_recovery() {
    let server = TestServer::start().await.unwrap();
    let mut conn = server.connect().await.unwrap();

    // A frame claiming major version 9, carrying a payload the server
    // must discard to stay frame-aligned.
    let mut body = item(TAG_OPCODE, &[Opcode::Ping as u8]);
    body.extend_from_slice(&item(TAG_PAYLOAD, b"stray"));
    send_raw_frame(&mut conn, 9, 0x0BAD, &body).await.unwrap();

    let (header, items) = read_response(&mut conn).await.unwrap();
    assert_eq!(header.id, 0x0BAD);
    assert_eq!(items.opcode, Some(Opcode::Error as u8));
    assert_eq!(items.error, Some(ErrorCode::VersionMismatch as u8));

    // The very next well-formed request must be served normally.
    let ping = request(0x600D, Opcode::Ping, None, Some(b"recovered"));
    send_frame(&mut conn, &ping).await.unwrap();
    let (header, items) = read_response(&mut conn).await.unwrap();
    assert_eq!(header.id, 0x600D);
    assert_eq!(items.opcode, Some(Opcode::Response as u8));
    assert_eq!(items.payload.as_deref(), Some(b"recovered".as_slice()));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_opcode_is_bad_opcode() {
    let server = TestServer::start().await.unwrap();
    let mut conn = server.connect().await.unwrap();

    let body = item(TAG_OPCODE, &[0x42]);
    send_raw_frame(&mut conn, VERSION_MAJOR, 7, &body).await.unwrap();

    let (header, items) = read_response(&mut conn).await.unwrap();
    assert_eq!(header.id, 7);
    assert_eq!(items.error, Some(ErrorCode::BadOpcode as u8));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_response_opcode_as_request_is_unexpected() {
    let server = TestServer::start().await.unwrap();
    let mut conn = server.connect().await.unwrap();

    let req = request(8, Opcode::Response, None, Some(b"nope"));
    send_frame(&mut conn, &req).await.unwrap();

    let (header, items) = read_response(&mut conn).await.unwrap();
    assert_eq!(header.id, 8);
    assert_eq!(items.error, Some(ErrorCode::UnexpectedOpcode as u8));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_truncated_item_is_format_error() {
    let server = TestServer::start().await.unwrap();
    let mut conn = server.connect().await.unwrap();

    // An item declaring far more data than the frame carries.
    let body = [TAG_PAYLOAD, 0xFF, 0xFF, 0x01];
    send_raw_frame(&mut conn, VERSION_MAJOR, 9, &body).await.unwrap();

    let (header, items) = read_response(&mut conn).await.unwrap();
    assert_eq!(header.id, 9);
    assert_eq!(items.error, Some(ErrorCode::Format as u8));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handshake_without_client_cert_rejected() {
    let server = TestServer::start().await.unwrap();

    // The TLS handshake may fail outright, or complete locally and die
    // on first use when the server's alert lands. Either way, no frame
    // exchange is possible.
    match server.connect_without_client_cert().await {
        Err(_) => {}
        Ok(mut conn) => {
            let ping = request(1, Opcode::Ping, None, Some(b"x"));
            let outcome = async {
                send_frame(&mut conn, &ping).await?;
                read_response(&mut conn).await
            };
            assert!(
                outcome.await.is_err(),
                "server must not serve a connection without a client certificate"
            );
        }
    }

    server.shutdown().await.unwrap();
}
