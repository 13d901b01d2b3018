//! End-to-end broadcast fan-out across federated tabs.

use pl_test_utils::{BridgeFixture, drain};
use portlink::{BridgeOptions, CallArgs, CallContext, Payload, PeerHandle, Relay, Schema, bridge_connect};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A schema with `inc(n)` that counts its own invocations and writes the
/// shared `counter` key through the context peer.
fn inc_schema(invocations: &Arc<AtomicUsize>, seed_counter: bool) -> Schema {
    let invocations = Arc::clone(invocations);
    let mut schema = Schema::new().method("inc", move |args: CallArgs, ctx: CallContext| {
        let invocations = Arc::clone(&invocations);
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            ctx.peer.write("counter", args.get(0)).await?;
            Ok(Payload::new(Value::Null))
        }
    });
    if seed_counter {
        schema = schema.value("counter", json!(0));
    }
    schema
}

/// S3: three tabs on channel "c" share `counter: 0`.  Tab 1 broadcasts
/// `inc(5)`; after the loop drains every tab reads 5, tab 1 executed
/// locally exactly once, tabs 2 and 3 each received exactly one relay.
#[tokio::test]
async fn broadcast_converges_all_tabs_on_the_shared_counter() {
    let relay = Relay::spawn();
    let counts: Vec<Arc<AtomicUsize>> =
        (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let mut tabs = Vec::new();
    for (index, id) in ["one", "two", "three"].iter().enumerate() {
        let remote = bridge_connect(
            relay.connect(),
            inc_schema(&counts[index], index == 0),
            BridgeOptions {
                channel: Some("c".to_owned()),
                tab_id: Some((*id).to_owned()),
            },
        )
        .await
        .expect("tab join");
        tabs.push(remote);
    }

    tabs[0]
        .invoke("inc", vec![json!(5)])
        .await
        .expect("broadcast inc");
    drain().await;

    for tab in &tabs {
        assert_eq!(tab.get("counter"), Some(json!(5)));
    }
    assert_eq!(counts[0].load(Ordering::SeqCst), 1, "no self-echo");
    assert_eq!(counts[1].load(Ordering::SeqCst), 1);
    assert_eq!(counts[2].load(Ordering::SeqCst), 1);
}

/// Invariant 4: a broadcast on one channel is invisible on every other
/// channel.
#[tokio::test]
async fn broadcasts_never_cross_channels() {
    let fixture = BridgeFixture::join_all("main", &["a", "b"], &["ping"], None).await;
    let bystander_log = pl_test_utils::CallLog::new();
    let _bystander = bridge_connect(
        fixture.relay.connect(),
        pl_test_utils::logging_schema(&["ping"], &bystander_log),
        BridgeOptions {
            channel: Some("elsewhere".to_owned()),
            tab_id: Some("bystander".to_owned()),
        },
    )
    .await
    .expect("bystander join");

    fixture
        .remote(0)
        .invoke("ping", vec![json!("x")])
        .await
        .expect("broadcast");
    drain().await;

    assert_eq!(fixture.log(1).count(), 1);
    assert_eq!(bystander_log.count(), 0, "other channels observe nothing");
}

/// The relayed invocation context names the originating tab.
#[tokio::test]
async fn relayed_calls_carry_the_sender_identity() {
    let fixture = BridgeFixture::join_all("who", &["caller"], &["ping"], None).await;
    let second_log = pl_test_utils::CallLog::new();
    let _second = bridge_connect(
        fixture.relay.connect(),
        pl_test_utils::logging_schema(&["ping"], &second_log),
        BridgeOptions {
            channel: Some("who".to_owned()),
            tab_id: Some("listener".to_owned()),
        },
    )
    .await
    .expect("listener join");

    fixture
        .remote(0)
        .invoke("ping", vec![json!(1)])
        .await
        .expect("broadcast");
    drain().await;

    let entries = second_log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sender, Some("caller".to_owned()));
}
