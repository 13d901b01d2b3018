//! Shared-state convergence: writes fan out to every mirror in one
//! serialized order.

use pl_test_utils::{BridgeFixture, drain};
use portlink::{BridgeOptions, Relay, Schema, bridge_connect};
use serde_json::json;

/// Invariant 5: after any tab writes `(k, v)`, every tab on the channel
/// eventually reads `v`.
#[tokio::test]
async fn every_mirror_converges_after_a_write() {
    let fixture =
        BridgeFixture::join_all("s", &["a", "b", "c"], &[], Some(("progress", json!(0)))).await;

    fixture.remote(2).set("progress", json!(77)).expect("set");
    drain().await;

    for index in 0..3 {
        assert_eq!(fixture.remote(index).get("progress"), Some(json!(77)));
    }
}

/// Writes from a single tab arrive in send order, so its last write wins
/// everywhere.
#[tokio::test]
async fn a_single_writers_last_write_wins_on_every_mirror() {
    let fixture =
        BridgeFixture::join_all("seq", &["writer", "reader"], &[], Some(("slot", json!(null))))
            .await;

    for round in 0..10 {
        fixture.remote(0).set("slot", json!(round)).expect("set");
    }
    drain().await;

    assert_eq!(fixture.remote(0).get("slot"), Some(json!(9)));
    assert_eq!(fixture.remote(1).get("slot"), Some(json!(9)));
}

/// Updates are serialized by the relay: racing writers leave every mirror
/// with the same final value, whichever write won.
#[tokio::test]
async fn racing_writers_still_converge_identically() {
    let fixture =
        BridgeFixture::join_all("race", &["a", "b"], &[], Some(("slot", json!(null)))).await;

    for round in 0..10 {
        let writer = round % 2;
        fixture
            .remote(writer)
            .set("slot", json!(round))
            .expect("set");
    }
    drain().await;

    let final_a = fixture.remote(0).get("slot");
    let final_b = fixture.remote(1).get("slot");
    assert_eq!(final_a, final_b, "all mirrors observe the same last write");
    assert!(final_a.is_some());
}

/// The first tab seeds the dictionary; a later tab's own leaves are
/// discarded, and it inherits the existing snapshot instead.
#[tokio::test]
async fn later_joiners_inherit_the_first_seeding() {
    let relay = Relay::spawn();
    let first = bridge_connect(
        relay.connect(),
        Schema::new().value("theme", json!("dark")),
        BridgeOptions {
            channel: Some("seeded".to_owned()),
            tab_id: Some("first".to_owned()),
        },
    )
    .await
    .expect("first join");

    let second = bridge_connect(
        relay.connect(),
        Schema::new()
            .value("theme", json!("light"))
            .value("extra", json!(1)),
        BridgeOptions {
            channel: Some("seeded".to_owned()),
            tab_id: Some("second".to_owned()),
        },
    )
    .await
    .expect("second join");

    assert_eq!(second.get("theme"), Some(json!("dark")));
    assert_eq!(second.get("extra"), None, "late leaves are discarded");
    assert_eq!(first.get("theme"), Some(json!("dark")));
}

/// State on one channel is invisible from another.
#[tokio::test]
async fn state_is_scoped_to_its_channel() {
    let relay = Relay::spawn();
    let here = bridge_connect(
        relay.connect(),
        Schema::new().value("k", json!("here")),
        BridgeOptions {
            channel: Some("one".to_owned()),
            tab_id: Some("a".to_owned()),
        },
    )
    .await
    .expect("join one");
    let there = bridge_connect(
        relay.connect(),
        Schema::new().value("k", json!("there")),
        BridgeOptions {
            channel: Some("two".to_owned()),
            tab_id: Some("b".to_owned()),
        },
    )
    .await
    .expect("join two");

    here.set("k", json!("updated")).expect("set");
    drain().await;

    assert_eq!(here.get("k"), Some(json!("updated")));
    assert_eq!(there.get("k"), Some(json!("there")), "unaffected channel");
}

/// The writer itself also converges through the fan-out, not only through
/// its local cache write.
#[tokio::test]
async fn the_writer_receives_its_own_update() {
    let fixture = BridgeFixture::join_all("echoes", &["solo"], &[], Some(("n", json!(0)))).await;
    fixture.remote(0).set("n", json!(5)).expect("set");
    drain().await;
    assert_eq!(fixture.remote(0).get("n"), Some(json!(5)));
}
