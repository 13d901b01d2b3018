//! Transferable round-trips: buffers move by ownership, byte lengths
//! survive, and the envelope markers resolve on both sides.

use portlink::{
    CallArgs, ConnectOptions, HostOptions, Schema, connect, host_connect, port_pair,
    with_transfers,
};
use serde_json::json;

/// The peer's `ping(buf)` returns the same bytes inside a transfer
/// envelope; the initial byte length is preserved end to end.  The
/// sender's buffer was moved into the call: detachment by ownership,
/// nothing left to observe on the sending side.
#[tokio::test]
async fn ping_round_trips_a_transferred_buffer() {
    let (host_port, guest_port) = port_pair();
    let schema = Schema::new().method("ping", |mut args: CallArgs, _ctx| async move {
        let buf = args.claim_arg(0).expect("argument buffer transferred");
        Ok(with_transfers(|t| json!({ "buf": t.transfer(buf) })))
    });
    let host = tokio::spawn(async move {
        host_connect(&host_port, schema, HostOptions::default()).await
    });
    let guest = connect(
        Schema::new(),
        ConnectOptions {
            host: Some(guest_port),
            ..Default::default()
        },
    )
    .await
    .expect("guest connect");
    let _host = host.await.expect("join").expect("host connect");

    let mut args = CallArgs::from_values(vec![]);
    let marker = args.transfer(vec![0xA5u8; 4096]);
    args.push(marker);

    let mut reply = guest
        .remote()
        .invoke_args("ping", args)
        .await
        .expect("ping resolves");
    let reply_marker = reply.value()["buf"].clone();
    let buf = reply.claim(&reply_marker).expect("reply buffer present");
    assert_eq!(buf.len(), 4096);
    assert_eq!(buf.as_slice()[0], 0xA5);
    assert!(
        reply.claim(&reply_marker).is_none(),
        "a transferred buffer is claimable once"
    );
}

/// Several buffers spliced into arbitrary positions of one return shape
/// keep their identities.
#[tokio::test]
async fn markers_resolve_inside_nested_return_shapes() {
    let (host_port, guest_port) = port_pair();
    let schema = Schema::new().method("split", |mut args: CallArgs, _ctx| async move {
        let buf = args.claim_arg(0).expect("argument buffer");
        let bytes = buf.into_vec();
        let (head, tail) = bytes.split_at(2);
        let (head, tail) = (head.to_vec(), tail.to_vec());
        Ok(with_transfers(move |t| {
            json!({
                "parts": [
                    { "label": "head", "data": t.transfer(head) },
                    { "label": "tail", "data": t.transfer(tail) },
                ]
            })
        }))
    });
    let host = tokio::spawn(async move {
        host_connect(&host_port, schema, HostOptions::default()).await
    });
    let guest = connect(
        Schema::new(),
        ConnectOptions {
            host: Some(guest_port),
            ..Default::default()
        },
    )
    .await
    .expect("guest connect");
    let _host = host.await.expect("join").expect("host connect");

    let mut args = CallArgs::from_values(vec![]);
    let marker = args.transfer(vec![1u8, 2, 3, 4, 5]);
    args.push(marker);

    let mut reply = guest
        .remote()
        .invoke_args("split", args)
        .await
        .expect("split resolves");
    let head_marker = reply.value()["parts"][0]["data"].clone();
    let tail_marker = reply.value()["parts"][1]["data"].clone();
    let head = reply.claim(&head_marker).expect("head buffer");
    let tail = reply.claim(&tail_marker).expect("tail buffer");
    assert_eq!(head.as_slice(), &[1, 2]);
    assert_eq!(tail.as_slice(), &[3, 4, 5]);
}

/// A call with no transfer envelope carries no buffers at all.
#[tokio::test]
async fn plain_calls_carry_no_buffers() {
    let (host_port, guest_port) = port_pair();
    let schema = Schema::new().method("plain", |_args, _ctx| async move {
        Ok(portlink::Payload::new(json!("ok")))
    });
    let host = tokio::spawn(async move {
        host_connect(&host_port, schema, HostOptions::default()).await
    });
    let guest = connect(
        Schema::new(),
        ConnectOptions {
            host: Some(guest_port),
            ..Default::default()
        },
    )
    .await
    .expect("guest connect");
    let _host = host.await.expect("join").expect("host connect");

    let reply = guest
        .remote()
        .invoke_args("plain", CallArgs::from_values(vec![]))
        .await
        .expect("plain resolves");
    assert_eq!(reply.value(), &json!("ok"));
    assert_eq!(reply.transfer_count(), 0);
}
