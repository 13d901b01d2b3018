//! End-to-end RPC over a spawned worker: simple calls, error propagation,
//! echo round-trip, bidirectional calls through the context peer.

use portlink::{
    CallArgs, CallContext, ConnectOptions, HostOptions, Payload, PeerHandle, RpcError, Schema,
    ThrownError, connect, host_connect, spawn_worker,
};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::oneshot;

/// S1: host advertises `add`; the guest worker calls it and gets 5.
#[tokio::test]
async fn guest_worker_calls_host_add() {
    let (done_tx, done_rx) = oneshot::channel();
    let host_view = spawn_worker(move |ctx| async move {
        let conn = connect(
            Schema::new(),
            ConnectOptions {
                guest: Some(ctx),
                ..Default::default()
            },
        )
        .await
        .expect("guest connect");
        let result = conn
            .remote()
            .invoke("add", vec![json!(2), json!(3)])
            .await
            .expect("add resolves");
        let _ = done_tx.send(result);
    });

    let schema = Schema::new().method("add", |args: CallArgs, _ctx| async move {
        let a = args.get(0).as_i64().unwrap_or(0);
        let b = args.get(1).as_i64().unwrap_or(0);
        Ok(Payload::new(json!(a + b)))
    });
    let _host = host_connect(&host_view, schema, HostOptions::default())
        .await
        .expect("host connect");

    let result = tokio::time::timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("guest finished")
        .expect("guest sent result");
    assert_eq!(result, json!(5));
}

/// S2: a throwing host method rejects on the guest with the exact message
/// and a non-empty stack.
#[tokio::test]
async fn host_throw_propagates_to_the_guest() {
    let (done_tx, done_rx) = oneshot::channel();
    let host_view = spawn_worker(move |ctx| async move {
        let conn = connect(
            Schema::new(),
            ConnectOptions {
                guest: Some(ctx),
                ..Default::default()
            },
        )
        .await
        .expect("guest connect");
        let outcome = conn.remote().invoke("fail", vec![]).await;
        let _ = done_tx.send(match outcome {
            Err(RpcError::Remote(thrown)) => (thrown.message, thrown.stack),
            other => panic!("expected remote rejection, got {other:?}"),
        });
    });

    let schema = Schema::new().method("fail", |_args, _ctx| async move {
        Err::<Payload, _>(ThrownError::new("nope"))
    });
    let _host = host_connect(&host_view, schema, HostOptions::default())
        .await
        .expect("host connect");

    let (message, stack) = tokio::time::timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("guest finished")
        .expect("guest sent outcome");
    assert_eq!(message, "nope");
    assert!(!stack.is_empty(), "stack must be a non-empty string");
}

/// Echo round-trip: any JSON-cloneable value deep-equals itself after the
/// wire.
#[tokio::test]
async fn echo_round_trips_json_cloneable_values() {
    let (done_tx, done_rx) = oneshot::channel();
    let samples = vec![
        json!(null),
        json!(true),
        json!(-42),
        json!(13.5),
        json!("text with ünicode"),
        json!([1, [2, [3]], { "k": "v" }]),
        json!({ "nested": { "deep": [null, false, 0.25] } }),
    ];
    let expected = samples.clone();

    let host_view = spawn_worker(move |ctx| async move {
        let conn = connect(
            Schema::new(),
            ConnectOptions {
                guest: Some(ctx),
                ..Default::default()
            },
        )
        .await
        .expect("guest connect");
        let mut echoed = Vec::new();
        for sample in samples {
            let back = conn
                .remote()
                .invoke("echo", vec![sample])
                .await
                .expect("echo resolves");
            echoed.push(back);
        }
        let _ = done_tx.send(echoed);
    });

    let schema = Schema::new().method("echo", |args: CallArgs, _ctx| async move {
        Ok(Payload::new(args.get(0)))
    });
    let _host = host_connect(&host_view, schema, HostOptions::default())
        .await
        .expect("host connect");

    let echoed = tokio::time::timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("guest finished")
        .expect("guest sent echoes");
    assert_eq!(echoed, expected);
}

/// Bidirectional round-trip: host `double(n)` calls back into the guest's
/// `inc` while serving the guest's call.
#[tokio::test]
async fn host_method_calls_back_into_the_guest() {
    let (done_tx, done_rx) = oneshot::channel();
    let host_view = spawn_worker(move |ctx| async move {
        let guest_schema = Schema::new().method("inc", |args: CallArgs, _ctx| async move {
            let n = args.get(0).as_i64().unwrap_or(0);
            Ok(Payload::new(json!(n + 1)))
        });
        let conn = connect(
            guest_schema,
            ConnectOptions {
                guest: Some(ctx),
                ..Default::default()
            },
        )
        .await
        .expect("guest connect");
        let result = conn
            .remote()
            .invoke("double", vec![json!(4)])
            .await
            .expect("double resolves");
        let _ = done_tx.send(result);
    });

    let host_schema = Schema::new().method(
        "double",
        |args: CallArgs, ctx: CallContext| async move {
            let inced = ctx.peer.call("inc", vec![args.get(0)]).await?;
            let doubled = inced.as_i64().map(|v| v * 2).unwrap_or_default();
            Ok(Payload::new(json!(doubled)))
        },
    );
    let _host = host_connect(&host_view, host_schema, HostOptions::default())
        .await
        .expect("host connect");

    let result = tokio::time::timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("guest finished")
        .expect("guest sent result");
    assert_eq!(result, json!(10));
}

/// The guest sees the host's data leaves on the remote; functions never
/// appear among them.
#[tokio::test]
async fn advertised_data_leaves_survive_extraction() {
    let (done_tx, done_rx) = oneshot::channel();
    let host_view = spawn_worker(move |ctx| async move {
        let conn = connect(
            Schema::new(),
            ConnectOptions {
                guest: Some(ctx),
                ..Default::default()
            },
        )
        .await
        .expect("guest connect");
        let remote = conn.remote();
        let _ = done_tx.send((
            remote.value("title"),
            remote.value("limits.max"),
            remote.methods(),
        ));
    });

    let schema = Schema::new()
        .value("title", json!("portlink"))
        .nested("limits", Schema::new().value("max", json!(16)))
        .method("noop", |_args, _ctx| async move {
            Ok(Payload::new(Value::Null))
        });
    let _host = host_connect(&host_view, schema, HostOptions::default())
        .await
        .expect("host connect");

    let (title, max, methods) = tokio::time::timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("guest finished")
        .expect("guest sent views");
    assert_eq!(title, Some(json!("portlink")));
    assert_eq!(max, Some(json!(16)));
    assert_eq!(methods, vec!["noop".to_owned()]);
}
