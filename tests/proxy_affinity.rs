//! Sessions stay on the agent that created them


use bytes::Bytes;
use integration_harness::{TestAgent, agent_config, remote, signing_key_pem, start_proxy};
use sigbox_protocol::PipeStep;

/// Test: two sessions land on two agents and are routed back by bid
#[tokio::test]
async fn test_bid_routes_to_owning_agent() {
    let a = TestAgent::start(agent_config()).await;
    let b = TestAgent::start(agent_config()).await;
    let proxy = start_proxy(&[&a, &b]).await;

    let mut first = remote(&proxy.endpoint).await;
    let bid1 = first.init().await.unwrap();
    first.add_key(vec![signing_key_pem(1)], None).await.unwrap();

    let mut second = remote(&proxy.endpoint).await;
    let bid2 = second.init().await.unwrap();
    second.add_key(vec![signing_key_pem(2)], None).await.unwrap();

    // round-robin put them on different agents
    assert!(a.registry.contains(&bid1) != a.registry.contains(&bid2));
    assert!(b.registry.contains(&bid1) != b.registry.contains(&bid2));

    // a third connection reaches both sessions by bid alone
    let mut third = remote(&proxy.endpoint).await;
    for bid in [&bid1, &bid2] {
        third.set_bid(Some(bid.clone()));
        assert_eq!(third.info().await.unwrap().len(), 1);
        let signed = third
            .pipe(Bytes::from_static(b"hello"), vec![PipeStep::sign()], None)
            .await
            .unwrap();
        assert!(signed.ends_with(b"hello"));
    }

    proxy.kill().await;
    a.kill().await;
    b.kill().await;
}
