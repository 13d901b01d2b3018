// pl-test-utils: Shared harness for the integration suites.
//
// Provides invocation logs, canned schemas, and a relay-with-tabs fixture
// so the end-to-end scenarios read as scenarios, not plumbing.

use pl_client::{BridgeOptions, BridgeRemote};
use pl_relay::{Relay, RelayHandle};
use pl_rpc::{CallArgs, Payload, Schema, ThrownError};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Install the logging subscriber for a test binary.  `RUST_LOG` filters
/// as usual; repeat calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// One recorded invocation: method, arguments, and the relayed sender (if
/// any).
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCall {
    pub method: String,
    pub args: Vec<Value>,
    pub sender: Option<String>,
}

/// A shared invocation log handed to [`logging_schema`] handlers.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<LoggedCall>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: &str, args: Vec<Value>, sender: Option<String>) {
        self.entries
            .lock()
            .expect("call log lock")
            .push(LoggedCall {
                method: method.to_owned(),
                args,
                sender,
            });
    }

    pub fn entries(&self) -> Vec<LoggedCall> {
        self.entries.lock().expect("call log lock").clone()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().expect("call log lock").len()
    }

    pub fn count_for(&self, method: &str) -> usize {
        self.entries
            .lock()
            .expect("call log lock")
            .iter()
            .filter(|e| e.method == method)
            .count()
    }
}

/// A schema whose listed methods record every invocation into `log` and
/// resolve to null.
pub fn logging_schema(methods: &[&str], log: &CallLog) -> Schema {
    let mut schema = Schema::new();
    for name in methods {
        let log = log.clone();
        let method_name = (*name).to_owned();
        schema = schema.method(name, move |args: CallArgs, ctx| {
            let log = log.clone();
            let method_name = method_name.clone();
            async move {
                log.record(&method_name, args.values().to_vec(), ctx.sender.clone());
                Ok(Payload::new(Value::Null))
            }
        });
    }
    schema
}

/// `echo(x) = x`.
pub fn echo_schema() -> Schema {
    Schema::new().method("echo", |args: CallArgs, _ctx| async move {
        Ok(Payload::new(args.get(0)))
    })
}

/// `add(a, b) = a + b`.
pub fn adder_schema() -> Schema {
    Schema::new().method("add", |args: CallArgs, _ctx| async move {
        let a = args.get(0).as_i64().unwrap_or(0);
        let b = args.get(1).as_i64().unwrap_or(0);
        Ok(Payload::new(json!(a + b)))
    })
}

/// `fail() = throw "nope"`.
pub fn failing_schema() -> Schema {
    Schema::new().method("fail", |_args, _ctx| async move {
        Err::<Payload, _>(ThrownError::new("nope"))
    })
}

/// `slow(n)`: waits `n` milliseconds, then resolves to `n`.
pub fn slow_schema() -> Schema {
    Schema::new().method("slow", |args: CallArgs, _ctx| async move {
        let n = args.get(0).as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(n)).await;
        Ok(Payload::new(json!(n)))
    })
}

/// Let fire-and-forget fan-out settle.
pub async fn drain() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// A relay plus tabs joined to one channel, each with its own call log.
pub struct BridgeFixture {
    pub relay: RelayHandle,
    pub channel: String,
    pub tabs: Vec<(BridgeRemote, CallLog)>,
}

impl BridgeFixture {
    /// Join `tab_ids` to `channel`, every tab advertising the same logged
    /// method names; the first tab additionally seeds `seed` as shared
    /// state.
    pub async fn join_all(
        channel: &str,
        tab_ids: &[&str],
        methods: &[&str],
        seed: Option<(&str, Value)>,
    ) -> Self {
        init_tracing();
        let relay = Relay::spawn();
        let mut tabs = Vec::new();
        for (index, tab_id) in tab_ids.iter().enumerate() {
            let log = CallLog::new();
            let mut schema = logging_schema(methods, &log);
            if index == 0 {
                if let Some((key, value)) = &seed {
                    schema = schema.value(key, value.clone());
                }
            }
            let remote = pl_client::connect(
                relay.connect(),
                schema,
                BridgeOptions {
                    channel: Some(channel.to_owned()),
                    tab_id: Some((*tab_id).to_owned()),
                },
            )
            .await
            .expect("tab join");
            tabs.push((remote, log));
        }
        BridgeFixture {
            relay,
            channel: channel.to_owned(),
            tabs,
        }
    }

    pub fn remote(&self, index: usize) -> &BridgeRemote {
        &self.tabs[index].0
    }

    pub fn log(&self, index: usize) -> &CallLog {
        &self.tabs[index].1
    }
}
