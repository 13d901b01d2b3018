//! Direct messages, roster queries, and duplicate-tab eviction through
//! the client layer.

use pl_test_utils::{BridgeFixture, CallLog, drain, logging_schema};
use portlink::{BridgeOptions, Relay, bridge_connect};
use serde_json::json;

/// S4: A, B, C on channel "m".  `remote.to("B").ping("hi")` runs B's
/// local `ping` on relay delivery; C observes no relay at all.
#[tokio::test]
async fn direct_message_runs_only_on_the_target_tab() {
    let fixture = BridgeFixture::join_all("m", &["A", "B", "C"], &["ping"], None).await;

    fixture
        .remote(0)
        .to("B")
        .invoke("ping", vec![json!("hi")])
        .await
        .expect("direct invoke");
    drain().await;

    assert_eq!(fixture.log(0).count(), 1, "sender ran its local ping once");
    assert_eq!(fixture.log(1).count(), 1, "target received one relay");
    assert_eq!(fixture.log(2).count(), 0, "bystander received nothing");
    assert_eq!(
        fixture.log(1).entries()[0].args,
        vec![json!("hi")],
        "original arguments only"
    );
}

/// A direct message to an absent tab is dropped without an error on the
/// sender.
#[tokio::test]
async fn direct_message_to_an_unknown_tab_is_dropped_silently() {
    let fixture = BridgeFixture::join_all("m", &["A", "B"], &["ping"], None).await;

    let result = fixture
        .remote(0)
        .to("ghost")
        .invoke("ping", vec![json!(1)])
        .await;
    assert!(result.is_ok(), "sender still gets its local result");
    drain().await;
    assert_eq!(fixture.log(1).count(), 0);
}

/// `connected_tabs` reports the roster, senders included, in join order.
#[tokio::test]
async fn connected_tabs_lists_the_full_roster() {
    let fixture = BridgeFixture::join_all("r", &["first", "second", "third"], &[], None).await;
    let tabs = fixture
        .remote(1)
        .connected_tabs()
        .await
        .expect("roster query");
    assert_eq!(
        tabs,
        vec!["first".to_owned(), "second".to_owned(), "third".to_owned()]
    );
}

/// S5: a second client registering an existing tab id evicts the holder;
/// the evicted client's port is closed and the new client proceeds.
#[tokio::test]
async fn duplicate_tab_id_eviction_end_to_end() {
    let relay = Relay::spawn();
    let log = CallLog::new();
    let old = bridge_connect(
        relay.connect(),
        logging_schema(&["ping"], &log),
        BridgeOptions {
            channel: Some("c".to_owned()),
            tab_id: Some("x".to_owned()),
        },
    )
    .await
    .expect("first registration");

    let new = bridge_connect(
        relay.connect(),
        logging_schema(&["ping"], &log),
        BridgeOptions {
            channel: Some("c".to_owned()),
            tab_id: Some("x".to_owned()),
        },
    )
    .await
    .expect("second registration proceeds normally");

    drain().await;
    assert!(old.is_closed(), "old holder observed the eviction");
    assert!(!new.is_closed());

    let tabs = new.connected_tabs().await.expect("roster query");
    assert_eq!(tabs, vec!["x".to_owned()], "exactly one holder remains");
}

/// Close emits the disconnect and leaves the remaining tabs intact.
#[tokio::test]
async fn closing_one_tab_leaves_the_channel_to_the_rest() {
    let fixture = BridgeFixture::join_all("q", &["stay", "go"], &["ping"], None).await;
    fixture.remote(1).close();
    drain().await;

    let tabs = fixture
        .remote(0)
        .connected_tabs()
        .await
        .expect("roster query");
    assert_eq!(tabs, vec!["stay".to_owned()]);

    // Broadcasts now reach nobody else, and the closed tab logs nothing.
    fixture
        .remote(0)
        .invoke("ping", vec![json!(1)])
        .await
        .expect("broadcast");
    drain().await;
    assert_eq!(fixture.log(1).count(), 0);
}

/// Joining with no explicit channel lands every defaulted client in the
/// same federation.
#[tokio::test]
async fn defaulted_channels_federate_together() {
    let relay = Relay::spawn();
    let log_a = CallLog::new();
    let log_b = CallLog::new();
    let a = bridge_connect(
        relay.connect(),
        logging_schema(&["ping"], &log_a),
        BridgeOptions {
            tab_id: Some("a".to_owned()),
            ..Default::default()
        },
    )
    .await
    .expect("a join");
    let _b = bridge_connect(
        relay.connect(),
        logging_schema(&["ping"], &log_b),
        BridgeOptions {
            tab_id: Some("b".to_owned()),
            ..Default::default()
        },
    )
    .await
    .expect("b join");

    a.invoke("ping", vec![]).await.expect("broadcast");
    drain().await;
    assert_eq!(log_b.count(), 1);
}
