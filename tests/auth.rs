//! The nonce/digest authentication handshake against the mock server.

mod common;

use bson::doc;
use mongodb_legacy::{error::ErrorKind, Client};

use common::{is_handshake, ismaster_reply, reply, Action, MockServer};

// md5("f00dcafe" + "bob" + md5("bob:mongo:pwd123")), hex-encoded.
const EXPECTED_KEY: &str = "300fc1dc29384708569f80006fea45ca";

#[tokio::test]
async fn authenticates_with_the_nonce_digest() {
    let server = MockServer::start(|msg, request_id| {
        if is_handshake(msg) {
            return Action::Reply(ismaster_reply(request_id));
        }
        let command = msg.query_document().unwrap();
        if command.contains_key("getnonce") {
            return Action::Reply(reply(
                request_id,
                0,
                0,
                &[doc! { "nonce": "f00dcafe", "ok": 1.0 }],
            ));
        }
        if command.contains_key("authenticate") {
            assert_eq!(command.get_str("user").unwrap(), "bob");
            assert_eq!(command.get_str("nonce").unwrap(), "f00dcafe");
            assert_eq!(command.get_str("key").unwrap(), EXPECTED_KEY);
            return Action::Reply(reply(request_id, 0, 0, &[doc! { "ok": 1.0 }]));
        }
        panic!("unexpected command {:?}", command);
    })
    .await;

    let uri = format!("mongodb://bob:pwd123@{}/?authSource=admin", server.addr);
    let client = Client::with_uri_str(uri).unwrap();
    client.warm_up().await.unwrap();

    // Both auth commands were addressed to the auth source database.
    server
        .wait_for(|msg| {
            matches!(
                msg.query_document(),
                Some(doc) if doc.contains_key("authenticate")
            )
        })
        .await;
    for msg in server.received() {
        if let Some(command) = msg.query_document() {
            if command.contains_key("getnonce") || command.contains_key("authenticate") {
                match msg {
                    common::Received::Query { ref ns, .. } => assert_eq!(ns, "admin.$cmd"),
                    _ => unreachable!(),
                }
            }
        }
    }
}

#[tokio::test]
async fn rejected_credentials_fail_without_leaking_the_password() {
    let server = MockServer::start(|msg, request_id| {
        if is_handshake(msg) {
            return Action::Reply(ismaster_reply(request_id));
        }
        let command = msg.query_document().unwrap();
        if command.contains_key("getnonce") {
            return Action::Reply(reply(
                request_id,
                0,
                0,
                &[doc! { "nonce": "f00dcafe", "ok": 1.0 }],
            ));
        }
        Action::Reply(reply(
            request_id,
            0,
            0,
            &[doc! { "ok": 0.0, "errmsg": "auth fails" }],
        ))
    })
    .await;

    let uri = format!("mongodb://bob:hunter2@{}/", server.addr);
    let client = Client::with_uri_str(uri).unwrap();

    let error = client.warm_up().await.unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::Authentication { .. }
    ));
    assert!(!error.to_string().contains("hunter2"));
}

#[tokio::test]
async fn invalid_getnonce_reply_is_an_authentication_error() {
    let server = MockServer::start(|msg, request_id| {
        if is_handshake(msg) {
            return Action::Reply(ismaster_reply(request_id));
        }
        // A getnonce reply with no nonce field.
        Action::Reply(reply(request_id, 0, 0, &[doc! { "ok": 1.0 }]))
    })
    .await;

    let uri = format!("mongodb://bob:pwd123@{}/", server.addr);
    let client = Client::with_uri_str(uri).unwrap();

    let error = client.warm_up().await.unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::Authentication { .. }
    ));
}
