//! Session create, use, evict and expire over a live agent


use integration_harness::{TestAgent, agent_config, remote};
use sigbox_protocol::ErrorCode;
use std::time::Duration;

/// Test: INIT then INFO succeeds; after EVICT the bid is unknown
#[tokio::test]
async fn test_evicted_session_is_gone() {
    let agent = TestAgent::start(agent_config()).await;
    let mut remote = remote(agent.endpoint()).await;

    let bid = remote.init().await.unwrap();
    assert!(agent.registry.contains(&bid));
    assert!(remote.info().await.unwrap().is_empty());

    remote.evict().await.unwrap();
    assert!(!agent.registry.contains(&bid));

    remote.set_bid(Some(bid));
    let err = remote.info().await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    // the connection survives ENOENT
    assert!(remote.init().await.is_ok());

    agent.kill().await;
}

/// Test: an idle session is swept and then unknown
#[tokio::test]
async fn test_idle_session_is_swept() {
    let mut config = agent_config();
    config.server.keep_alive = 0;
    let agent = TestAgent::start(config).await;
    let mut remote = remote(agent.endpoint()).await;

    let bid = remote.init().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    agent.registry.sweep();
    assert!(!agent.registry.contains(&bid));

    let err = remote.info().await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    agent.kill().await;
}

/// Test: without a default box, bid-less requests get ENOENT
#[tokio::test]
async fn test_no_default_box() {
    let agent = TestAgent::start(agent_config()).await;
    let mut remote = remote(agent.endpoint()).await;

    assert!(remote.certificates().is_empty());
    let err = remote.find_certs_cmp(vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    agent.kill().await;
}
