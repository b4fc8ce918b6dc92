//! Applying inbound deltas to the canonical model.
//!
//! A [`DeltaMerger`] takes one decoded inbound message and writes it into a
//! [`SignalKModel`]. Two shapes are accepted:
//! - whole documents starting at `vessels`, which are merged as-is
//! - deltas with a `context`, in the flat `values` form or the 1.x `updates` form
//!
//! Every value of a delta is applied on its own: a value whose timestamp does
//! not parse is skipped and counted, the remaining values still land.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{parse_timestamp, Delta, PathValue, SourceDescriptor, CONTEXT, VESSELS};
use crate::path::{validate, Path, PathResolver};
use crate::store::{NodeId, SignalKModel};

/// Provenance recorded when a delta names no source at all.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Errors that reject a whole inbound message.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("message has neither a context nor a vessels document")]
    NotADelta,

    #[error("malformed delta: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Outcome of applying one message.
///
/// Values that carry no timestamp (neither their own nor their source's) are
/// stamped with the time they are applied. Repeating such a value with the
/// same source keeps the stored timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Values written to the model.
    pub applied: usize,
    /// Values skipped because they could not be applied.
    pub rejected: usize,
    /// The message was a whole document.
    pub document: bool,
}

/// Writes deltas into the canonical model.
#[derive(Debug, Clone)]
pub struct DeltaMerger {
    resolver: PathResolver,
}

impl DeltaMerger {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Apply one inbound message.
    ///
    /// The caller holds the model's write lock for the duration of the call,
    /// so readers never observe a half-applied delta.
    pub fn apply(&self, model: &mut SignalKModel, message: &Value) -> Result<MergeReport, DeltaError> {
        if message.get(VESSELS).is_some() {
            model.merge(message);
            return Ok(MergeReport {
                document: true,
                ..MergeReport::default()
            });
        }

        if message.get(CONTEXT).is_none() {
            warn!("Rejected message without context");
            return Err(DeltaError::NotADelta);
        }

        let delta: Delta = serde_json::from_value(message.clone()).map_err(|e| {
            warn!("Rejected malformed delta: {}", e);
            DeltaError::Malformed(e)
        })?;

        Ok(self.apply_delta(model, &delta))
    }

    /// Apply an already decoded delta.
    pub fn apply_delta(&self, model: &mut SignalKModel, delta: &Delta) -> MergeReport {
        let context = self.resolver.resolve(&delta.context);
        let mut report = MergeReport::default();

        if !delta.values.is_empty() {
            let (source, timestamp) = describe(delta.source.as_ref(), None);
            self.apply_values(model, &context, &source, timestamp, &delta.values, &mut report);
        }

        for update in &delta.updates {
            let descriptor = update.source.as_ref().or(delta.source.as_ref());
            let (mut source, mut timestamp) = describe(descriptor, update.timestamp.as_deref());
            if update.source.is_none() {
                if let Some(label) = &update.source_ref {
                    source = label.clone();
                }
            }
            if timestamp.is_none() {
                timestamp = delta.source.as_ref().and_then(|s| s.timestamp.as_deref());
            }
            self.apply_values(model, &context, &source, timestamp, &update.values, &mut report);
        }

        debug!(
            "Applied delta for {}: {} values, {} rejected",
            context, report.applied, report.rejected
        );
        report
    }

    fn apply_values(
        &self,
        model: &mut SignalKModel,
        context: &Path,
        source: &str,
        default_timestamp: Option<&str>,
        values: &[PathValue],
        report: &mut MergeReport,
    ) {
        let root = model.root();
        let Some(context_node) = model.add_node(root, context.as_str()) else {
            report.rejected += values.len();
            return;
        };

        for pv in values {
            let path = Path::new(&pv.path);
            let Some(key) = path.last() else {
                warn!("Skipping value with empty path in {}", context);
                report.rejected += 1;
                continue;
            };

            let stamped = match pv.timestamp.as_deref().or(default_timestamp).map(parse_timestamp) {
                None => None,
                Some(Ok(ts)) => Some(ts),
                Some(Err(e)) => {
                    warn!("Skipping {}.{}: bad timestamp: {}", context, pv.path, e);
                    report.rejected += 1;
                    continue;
                }
            };

            let full = context.join(path.as_str());
            if let Err(e) = validate(full.as_str()) {
                debug!("Non-conforming path {}: {}", full, e);
            }

            let Some(node) = model.add_node(context_node, path.parent().as_str()) else {
                report.rejected += 1;
                continue;
            };
            let timestamp = stamped
                .or_else(|| unchanged_since(model, node, key, &pv.value, source))
                .unwrap_or_else(Utc::now);
            match model.put_with(node, key, pv.value.clone(), source, timestamp) {
                Some(_) => report.applied += 1,
                None => report.rejected += 1,
            }
        }
    }
}

/// Provenance string and raw timestamp of a source descriptor.
fn describe<'a>(source: Option<&'a SourceDescriptor>, timestamp: Option<&'a str>) -> (String, Option<&'a str>) {
    match source {
        Some(s) => (s.provenance(), timestamp.or(s.timestamp.as_deref())),
        None => (UNKNOWN_SOURCE.to_string(), timestamp),
    }
}

/// Timestamp of the existing leaf `key` under `node` when it already holds
/// `value` from `source`. Values without a timestamp of their own are stamped
/// with the receive time, except when they repeat the stored leaf exactly, so
/// re-applying the same delta leaves the model unchanged.
fn unchanged_since(
    model: &SignalKModel,
    node: NodeId,
    key: &str,
    value: &Value,
    source: &str,
) -> Option<DateTime<Utc>> {
    let leaf = model.leaf(model.child(node, key)?)?;
    if leaf.value == *value && leaf.source.as_deref() == Some(source) {
        leaf.timestamp
    } else {
        None
    }
}
