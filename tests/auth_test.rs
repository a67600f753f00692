mod common;

use common::*;
use std::time::SystemTime;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use windsock::auth::unix_seconds;

/// Connect with `token` and expect the policy close the gateway sends
/// instead of starting a session
async fn expect_refusal(address: &str, token: &str) -> String {
    let mut client = connect(address, token).await;
    match next_message(&mut client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            frame.reason.to_string()
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_valid_token_is_accepted() {
    init_test_logging();
    let gw = start_gateway(test_config()).await;

    let _client = connect(&gw.address, &token("u1", "sub.a", "pub.a")).await;
    wait_for_clients(&gw.gateway, 1).await;

    gw.gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_stale_token_is_refused() {
    init_test_logging();
    let gw = start_gateway(test_config()).await;

    let issued_at = unix_seconds(SystemTime::now()) - 61;
    let reason = expect_refusal(&gw.address, &token_at("u1", "sub.a", "pub.a", issued_at)).await;
    assert_eq!(reason, "stale token");
    assert_eq!(gw.gateway.stats().snapshot().clients_total, 0);

    gw.gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_tampered_token_is_refused() {
    init_test_logging();
    let gw = start_gateway(test_config()).await;

    // Widen the subscribe prefix without re-signing
    let forged = token("u1", "sub.a", "pub.a").replacen(":sub.a:", "::", 1);
    let reason = expect_refusal(&gw.address, &forged).await;
    assert_eq!(reason, "token HMAC doesn't match");

    gw.gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_tokens_are_refused() {
    init_test_logging();
    let gw = start_gateway(test_config()).await;

    assert_eq!(expect_refusal(&gw.address, "").await, "invalid token format");
    assert_eq!(
        expect_refusal(&gw.address, "a:b:c:d:e:f:g:h").await,
        "invalid token format"
    );
    assert_eq!(
        expect_refusal(&gw.address, "u1:s:p:yesterday:n:addr:00").await,
        "invalid timestamp in token"
    );
    assert_eq!(gw.gateway.stats().snapshot().clients_total, 0);

    gw.gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_token_is_refused() {
    init_test_logging();
    let gw = start_gateway(test_config()).await;

    let url = format!("ws://{}/socket/", gw.address);
    let (mut client, _) = timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .unwrap();
    match next_message(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close frame, got {other:?}"),
    }

    gw.gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_path_is_not_found() {
    init_test_logging();
    let gw = start_gateway(test_config()).await;

    let url = socket_url(&gw.address, "/elsewhere", &token("u1", "sub.a", "pub.a"));
    let result = timeout(WAIT, tokio_tungstenite::connect_async(url)).await.unwrap();
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade on the wrong path succeeded"),
    }
    assert_eq!(gw.gateway.stats().snapshot().clients_total, 0);

    gw.gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_path_subtree_matches() {
    init_test_logging();
    let gw = start_gateway(test_config()).await;

    let url = socket_url(&gw.address, "/socket/room/7", &token("u1", "sub.a", "pub.a"));
    let (_client, _) = timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .unwrap();
    wait_for_clients(&gw.gateway, 1).await;

    gw.gateway.stop().await.unwrap();
}
