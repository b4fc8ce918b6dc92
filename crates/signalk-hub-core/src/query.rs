//! One-shot GET and LIST queries against the model.
//!
//! Both run on the safe projection, so private branches never leave the hub.
//! Query paths are relative to the request context and may use `*`
//! wildcards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::path::{Path, PathPattern};
use crate::store::SignalKModel;

/// `{"context": "vessels.self", "get": ["navigation.position", "environment.*"]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    pub context: String,
    #[serde(default)]
    pub get: Vec<String>,
}

/// `{"context": "vessels.self", "list": ["navigation.*"]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRequest {
    pub context: String,
    #[serde(default)]
    pub list: Vec<String>,
}

/// Answer to a [`ListRequest`]: full dotted paths of the matching leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub context: String,
    pub pathlist: Vec<String>,
}

/// Answer a GET request.
///
/// The result is shaped like the canonical document and contains only the
/// requested subtrees, each at its full location. An empty `get` list
/// returns the whole context subtree. Unknown paths contribute nothing.
pub fn get(model: &SignalKModel, request: &GetRequest) -> Value {
    let safe = model.safe();
    let context = safe.resolver().resolve(&request.context);
    let mut out = Value::Object(Map::new());

    let Some(context_node) = safe.node_at(context.as_str()) else {
        return out;
    };

    if request.get.is_empty() {
        insert_at(&mut out, context.segments(), safe.to_json(context_node));
        return out;
    }

    for wanted in &request.get {
        if wanted.contains('*') {
            let Ok(pattern) = PathPattern::new(wanted) else {
                continue;
            };
            for (rel, leaf) in safe.leaves(context_node) {
                if pattern.matches(&rel) {
                    let full = context.join(&rel);
                    insert_at(&mut out, full.segments(), leaf.to_json());
                }
            }
        } else {
            let full = context.join(wanted);
            if let Some(node) = safe.node_at(full.as_str()) {
                insert_at(&mut out, full.segments(), safe.to_json(node));
            }
        }
    }
    out
}

/// Answer a LIST request with the paths of every matching leaf.
///
/// An empty `list` lists every leaf of the context.
pub fn list(model: &SignalKModel, request: &ListRequest) -> ListResponse {
    let safe = model.safe();
    let context = safe.resolver().resolve(&request.context);
    let patterns: Vec<PathPattern> = request
        .list
        .iter()
        .filter_map(|p| PathPattern::new(p).ok())
        .collect();

    let pathlist = match safe.node_at(context.as_str()) {
        Some(node) => safe
            .leaves(node)
            .into_iter()
            .map(|(rel, _)| rel)
            .filter(|rel| patterns.is_empty() || patterns.iter().any(|p| p.covers(rel)))
            .map(|rel| context.join(&rel).to_string())
            .collect(),
        None => Vec::new(),
    };

    ListResponse {
        context: request.context.clone(),
        pathlist,
    }
}

/// Place `value` in `out` at `segments`, creating intermediate objects.
pub fn insert_at(out: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *out = value;
        return;
    };
    let mut current = out;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}
