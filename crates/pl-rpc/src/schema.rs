//! Schemas: the tree of callables and data leaves one side declares.
//!
//! Nesting joins names with "."; the flattened method map uses the dotted
//! paths as keys.  Extraction happens exactly once: functions are removed
//! into the method map, non-function leaves remain as the advertised data
//! tree.

use crate::context::CallContext;
use crate::error::ThrownError;
use crate::payload::{Payload, TRANSFER_SLOT_KEY, slot_index};
use futures::future::BoxFuture;
use pl_transport::Buffer;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Call arguments
// ---------------------------------------------------------------------------

/// Positional arguments of one invocation, plus any buffers transferred
/// with them.
#[derive(Debug)]
pub struct CallArgs {
    values: Vec<Value>,
    buffers: Vec<Option<Buffer>>,
}

impl CallArgs {
    pub fn from_values(values: Vec<Value>) -> Self {
        CallArgs {
            values,
            buffers: Vec::new(),
        }
    }

    pub(crate) fn from_wire(values: Vec<Value>, buffers: Vec<Buffer>) -> Self {
        CallArgs {
            values,
            buffers: buffers.into_iter().map(Some).collect(),
        }
    }

    /// Attach a buffer; returns the slot marker to place inside an
    /// argument value.
    pub fn transfer(&mut self, buf: impl Into<Buffer>) -> Value {
        let index = self.buffers.len();
        self.buffers.push(Some(buf.into()));
        serde_json::json!({ TRANSFER_SLOT_KEY: index })
    }

    /// Append a positional argument (often a marker from `transfer`).
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Argument at position `i`, `Null` when absent.
    pub fn get(&self, i: usize) -> Value {
        self.values.get(i).cloned().unwrap_or(Value::Null)
    }

    /// Resolve a slot marker among the arguments to its buffer.
    pub fn claim(&mut self, marker: &Value) -> Option<Buffer> {
        let index = slot_index(marker)?;
        self.buffers.get_mut(index)?.take()
    }

    /// Claim the buffer referenced by argument `i`.
    pub fn claim_arg(&mut self, i: usize) -> Option<Buffer> {
        let marker = self.get(i);
        self.claim(&marker)
    }

    pub(crate) fn into_parts(self) -> (Vec<Value>, Vec<Buffer>) {
        let buffers = self
            .buffers
            .into_iter()
            .map(|b| b.unwrap_or_else(|| Buffer::new(Vec::new())))
            .collect();
        (self.values, buffers)
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(values: Vec<Value>) -> Self {
        CallArgs::from_values(values)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub type HandlerFuture = BoxFuture<'static, Result<Payload, ThrownError>>;
pub type HandlerFn = dyn Fn(CallArgs, CallContext) -> HandlerFuture + Send + Sync;

/// A registered method body.
#[derive(Clone)]
pub struct Method(Arc<HandlerFn>);

impl Method {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CallArgs, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, ThrownError>> + Send + 'static,
    {
        Method(Arc::new(move |args, ctx| Box::pin(f(args, ctx))))
    }

    pub fn invoke(&self, args: CallArgs, ctx: CallContext) -> HandlerFuture {
        (self.0)(args, ctx)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Method(..)")
    }
}

// ---------------------------------------------------------------------------
// Schema tree
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SchemaNode {
    Branch(Schema),
    Method(Method),
    Value(Value),
}

/// A labeled tree whose leaves are callables or data values.
#[derive(Debug, Default)]
pub struct Schema {
    entries: BTreeMap<String, SchemaNode>,
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    /// Register a callable leaf.
    pub fn method<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallArgs, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, ThrownError>> + Send + 'static,
    {
        self.entries
            .insert(name.to_owned(), SchemaNode::Method(Method::new(f)));
        self
    }

    /// Register a data leaf.
    pub fn value(mut self, name: &str, v: Value) -> Self {
        self.entries.insert(name.to_owned(), SchemaNode::Value(v));
        self
    }

    /// Register a nested subtree; its leaves flatten to `name.<leaf>`.
    pub fn nested(mut self, name: &str, schema: Schema) -> Self {
        self.entries
            .insert(name.to_owned(), SchemaNode::Branch(schema));
        self
    }

    /// The one-time extraction: functions out into the dotted method map,
    /// data leaves retained as the advertised value tree.
    pub fn extract(self) -> FlatSchema {
        let mut methods = BTreeMap::new();
        let mut values = serde_json::Map::new();
        flatten(self, &mut methods, &mut values, String::new());
        FlatSchema {
            methods,
            values: Value::Object(values),
        }
    }
}

fn flatten(
    schema: Schema,
    methods: &mut BTreeMap<String, Method>,
    values: &mut serde_json::Map<String, Value>,
    prefix: String,
) {
    for (name, node) in schema.entries {
        let dotted = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match node {
            SchemaNode::Method(m) => {
                methods.insert(dotted, m);
            }
            SchemaNode::Value(v) => {
                values.insert(name, v);
            }
            SchemaNode::Branch(sub) => {
                let mut sub_values = serde_json::Map::new();
                flatten(sub, methods, &mut sub_values, dotted);
                values.insert(name, Value::Object(sub_values));
            }
        }
    }
}

/// A schema after extraction.
#[derive(Debug, Clone, Default)]
pub struct FlatSchema {
    /// Dotted method name -> body.
    pub methods: BTreeMap<String, Method>,
    /// The schema with functions stripped (data leaves only).
    pub values: Value,
}

impl FlatSchema {
    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }
}

/// Walk a dotted path through a value tree.
pub fn value_at<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = tree;
    for part in path.split('.') {
        node = node.as_object()?.get(part)?;
    }
    Some(node)
}
