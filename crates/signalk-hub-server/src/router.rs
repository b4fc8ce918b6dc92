//! Subscription-driven distribution.
//!
//! The router runs one scheduled job per active subscription. On every tick
//! the job:
//! 1. takes a read lock on the model just long enough to `duplicate()` it
//! 2. projects the copy to its safe form
//! 3. shapes the payload (full document or delta of changed leaves)
//! 4. hands it to [`Delivery`] for the subscription's session, or for every
//!    session when the subscription is a broadcast
//!
//! The model lock is never held while delivering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use signalk_hub_core::query::insert_at;
use signalk_hub_core::{
    Delta, Leaf, NodeKind, Path, PathPattern, PathValue, SignalKModel, Update, VESSELS,
};
use signalk_hub_protocol::SubscriptionFormat;

use crate::delivery::{Delivery, Target};
use crate::scheduler::{JobHandle, JobToken, Scheduler, Task};
use crate::subscription::SessionSubscription;

/// The single model instance, shared by the ingestion worker and all jobs.
pub type SharedModel = Arc<RwLock<SignalKModel>>;

/// Jobs are keyed by session and filter, never by the formatted route id.
type RouteKey = (String, String);

struct RouteJob {
    route_id: String,
    handle: JobHandle,
}

/// Runs delivery jobs for subscriptions.
pub struct DistributionRouter {
    model: SharedModel,
    delivery: Arc<dyn Delivery>,
    scheduler: Arc<dyn Scheduler>,
    jobs: Mutex<HashMap<RouteKey, RouteJob>>,
}

impl DistributionRouter {
    pub fn new(model: SharedModel, delivery: Arc<dyn Delivery>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            model,
            delivery,
            scheduler,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the job serving `sub`.
    pub fn start(&self, sub: &SessionSubscription) {
        let model = self.model.clone();
        let delivery = self.delivery.clone();
        let tracker = Arc::new(Mutex::new(DeltaTracker::default()));
        let job_sub = sub.clone();

        let task: Task = Box::new(move |token: JobToken| {
            let model = model.clone();
            let delivery = delivery.clone();
            let tracker = tracker.clone();
            let sub = job_sub.clone();
            async move { run_tick(&model, &sub, &tracker, delivery.as_ref(), &token).await }.boxed()
        });

        let handle = self.scheduler.schedule(sub.period, task);
        let previous = self.lock_jobs().insert(
            (sub.session_id.clone(), sub.path_filter.clone()),
            RouteJob {
                route_id: sub.route_id.clone(),
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.cancel();
        }
        info!("Route {} started every {:?}", sub.route_id, sub.period);
    }

    /// Stop the job serving `path_filter` for `session_id`. Returns whether
    /// it existed.
    pub fn stop(&self, session_id: &str, path_filter: &str) -> bool {
        let key = (session_id.to_string(), path_filter.to_string());
        let removed = self.lock_jobs().remove(&key);
        match removed {
            Some(job) => {
                job.handle.cancel();
                info!("Route {} stopped", job.route_id);
                true
            }
            None => false,
        }
    }

    /// Stop every job of a session. Returns how many were stopped.
    pub fn stop_session(&self, session_id: &str) -> usize {
        let removed: Vec<RouteJob> = {
            let mut jobs = self.lock_jobs();
            let keys: Vec<RouteKey> = jobs.keys().filter(|(session, _)| session == session_id).cloned().collect();
            keys.iter().filter_map(|key| jobs.remove(key)).collect()
        };
        for job in &removed {
            job.handle.cancel();
            debug!("Route {} stopped", job.route_id);
        }
        removed.len()
    }

    /// Stop everything.
    pub fn stop_all(&self) {
        let jobs: Vec<RouteJob> = self.lock_jobs().drain().map(|(_, job)| job).collect();
        for job in &jobs {
            job.handle.cancel();
        }
    }

    /// Route ids of running jobs, sorted.
    pub fn active_routes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_jobs().values().map(|job| job.route_id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_jobs().is_empty()
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<RouteKey, RouteJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_tick(
    model: &SharedModel,
    sub: &SessionSubscription,
    tracker: &Mutex<DeltaTracker>,
    delivery: &dyn Delivery,
    token: &JobToken,
) {
    if token.is_cancelled() {
        return;
    }
    let snapshot = model.read().await.duplicate();
    let safe = snapshot.safe();

    let payloads = match sub.format {
        SubscriptionFormat::Full => render_full(&safe, &sub.context, sub.pattern()).into_iter().collect(),
        SubscriptionFormat::Delta => {
            let mut tracker = tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tracker.render(&safe, &sub.context, sub.pattern())
        }
    };
    if payloads.is_empty() {
        return;
    }

    let target = if sub.is_broadcast() {
        Target::Broadcast
    } else {
        Target::Session(sub.session_id.clone())
    };

    let Some(_guard) = token.enter() else {
        return;
    };
    for payload in &payloads {
        if let Err(e) = delivery.deliver(payload, &target) {
            // the job stays alive, the next tick tries again
            debug!("Route {}: delivery skipped: {}", sub.route_id, e);
        }
    }
}

/// Vessel contexts a subscription context names. `self` is resolved; a
/// context with `*` expands to every matching vessel in the model.
pub fn expand_contexts(model: &SignalKModel, context: &str) -> Vec<Path> {
    let resolved = model.resolver().resolve(context);
    if !context.contains('*') {
        return vec![resolved];
    }
    let Ok(pattern) = PathPattern::new(resolved.as_str()) else {
        return Vec::new();
    };
    let Some(vessels) = model.node_at(VESSELS) else {
        return Vec::new();
    };
    match model.kind(vessels) {
        Some(NodeKind::Object(children)) => children
            .keys()
            .map(|id| Path::from_segments(&[VESSELS, id.as_str()]))
            .filter(|path| pattern.matches(path.as_str()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Leaves under each context that the filter covers, with full paths.
fn covered_leaves<'a>(model: &'a SignalKModel, context: &str, pattern: &PathPattern) -> Vec<(Path, Path, &'a Leaf)> {
    let mut out = Vec::new();
    for ctx in expand_contexts(model, context) {
        let Some(node) = model.node_at(ctx.as_str()) else {
            continue;
        };
        for (rel, leaf) in model.leaves(node) {
            if pattern.covers(&rel) {
                out.push((ctx.clone(), Path::new(&rel), leaf));
            }
        }
    }
    out
}

/// The covered leaves as a document shaped like the canonical model, or
/// `None` when nothing matches.
pub fn render_full(model: &SignalKModel, context: &str, pattern: &PathPattern) -> Option<Value> {
    let leaves = covered_leaves(model, context, pattern);
    if leaves.is_empty() {
        return None;
    }
    let mut doc = Value::Object(Map::new());
    for (ctx, rel, leaf) in leaves {
        insert_at(&mut doc, ctx.join(rel.as_str()).segments(), leaf.to_json());
    }
    Some(doc)
}

/// Remembers what a delta job last sent, so each tick only carries changes.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last: HashMap<String, Leaf>,
}

impl DeltaTracker {
    /// One delta per context with the covered leaves that changed since the
    /// previous call. Values are grouped into updates by source and
    /// timestamp. Empty when nothing changed.
    pub fn render(&mut self, model: &SignalKModel, context: &str, pattern: &PathPattern) -> Vec<Value> {
        let mut current = HashMap::new();
        let mut by_context: Vec<(Path, Vec<Update>)> = Vec::new();

        for (ctx, rel, leaf) in covered_leaves(model, context, pattern) {
            let full = ctx.join(rel.as_str()).to_string();
            let changed = self.last.get(&full) != Some(leaf);
            current.insert(full, leaf.clone());
            if !changed {
                continue;
            }

            let index = match by_context.iter().position(|(c, _)| *c == ctx) {
                Some(index) => index,
                None => {
                    by_context.push((ctx.clone(), Vec::new()));
                    by_context.len() - 1
                }
            };
            let updates = &mut by_context[index].1;

            let timestamp = leaf.timestamp_str();
            let value = PathValue::new(rel.as_str(), leaf.value.clone());
            match updates
                .iter_mut()
                .find(|u| u.source_ref == leaf.source && u.timestamp == timestamp)
            {
                Some(update) => update.values.push(value),
                None => updates.push(Update {
                    source_ref: leaf.source.clone(),
                    source: None,
                    timestamp,
                    values: vec![value],
                }),
            }
        }
        self.last = current;

        by_context
            .into_iter()
            .filter_map(|(ctx, updates)| {
                let delta = Delta {
                    context: ctx.to_string(),
                    source: None,
                    values: Vec::new(),
                    updates,
                };
                serde_json::to_value(&delta)
                    .map_err(|e| warn!("Failed to encode delta for {}: {}", ctx, e))
                    .ok()
            })
            .collect()
    }
}
