//! Subscription bookkeeping.
//!
//! The registry maps each session to its ordered list of subscriptions.
//! A subscription is identified by (session, path filter): subscribing the
//! same filter again replaces the previous entry, so a client can change the
//! period or format of a stream without unsubscribing first.
//!
//! The registry only records intent. Starting and stopping delivery jobs is
//! the router's business; the hub keeps the two in step.

use std::collections::BTreeMap;
use std::time::Duration;

use signalk_hub_core::{PathPattern, PatternError};
use signalk_hub_protocol::{Subscription, SubscriptionFormat};

/// Session id under which broadcast subscriptions are registered.
pub const BROADCAST_SESSION: &str = "*";

/// How requested periods are turned into job periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodPolicy {
    /// Used when a subscription names no period.
    pub default_period: Duration,
    /// Requested periods below this are raised to it.
    pub min_period: Duration,
}

impl PeriodPolicy {
    pub fn from_millis(default_period_ms: u64, min_period_ms: u64) -> Self {
        Self {
            default_period: Duration::from_millis(default_period_ms),
            min_period: Duration::from_millis(min_period_ms),
        }
    }

    pub fn period(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) => Duration::from_millis(ms).max(self.min_period),
            None => self.default_period,
        }
    }
}

impl Default for PeriodPolicy {
    fn default() -> Self {
        Self::from_millis(1000, 100)
    }
}

/// One active subscription of one session.
#[derive(Debug, Clone)]
pub struct SessionSubscription {
    pub session_id: String,
    /// Context as requested (may still contain `self` or `*`).
    pub context: String,
    pub path_filter: String,
    pub period: Duration,
    pub format: SubscriptionFormat,
    pub route_id: String,
    pattern: PathPattern,
}

impl SessionSubscription {
    pub fn new(
        session_id: &str,
        context: &str,
        path_filter: &str,
        period: Duration,
        format: SubscriptionFormat,
    ) -> Result<Self, PatternError> {
        Ok(Self {
            session_id: session_id.to_string(),
            context: context.to_string(),
            path_filter: path_filter.to_string(),
            period,
            format,
            route_id: route_id(session_id, path_filter),
            pattern: PathPattern::new(path_filter)?,
        })
    }

    /// Build from a protocol subscription, applying the period policy.
    pub fn from_protocol(
        session_id: &str,
        context: &str,
        sub: &Subscription,
        policy: &PeriodPolicy,
    ) -> Result<Self, PatternError> {
        Self::new(
            session_id,
            context,
            &sub.path,
            policy.period(sub.period),
            sub.format.unwrap_or_default(),
        )
    }

    /// Compiled path filter.
    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn is_broadcast(&self) -> bool {
        self.session_id == BROADCAST_SESSION
    }
}

/// Display name of the delivery job serving a subscription. Not unique on
/// its own; the router keys jobs by session and filter.
pub fn route_id(session_id: &str, path_filter: &str) -> String {
    format!("sub_{}_{}", session_id, path_filter)
}

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone)]
pub enum SubscribeOutcome {
    Added,
    /// An entry with the same filter existed and was replaced.
    Replaced(SessionSubscription),
}

/// All subscriptions of all sessions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    sessions: BTreeMap<String, Vec<SessionSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription, replacing one with the same (session, filter).
    /// A replaced entry keeps its position in the session's list.
    pub fn subscribe(&mut self, sub: SessionSubscription) -> SubscribeOutcome {
        let subs = self.sessions.entry(sub.session_id.clone()).or_default();
        match subs.iter_mut().find(|s| s.path_filter == sub.path_filter) {
            Some(existing) => SubscribeOutcome::Replaced(std::mem::replace(existing, sub)),
            None => {
                subs.push(sub);
                SubscribeOutcome::Added
            }
        }
    }

    /// Remove one subscription (`Some(filter)`) or all of them (`None`)
    /// for a session. Returns what was removed.
    pub fn unsubscribe(&mut self, session_id: &str, path_filter: Option<&str>) -> Vec<SessionSubscription> {
        let Some(subs) = self.sessions.get_mut(session_id) else {
            return Vec::new();
        };

        let removed = match path_filter {
            None => std::mem::take(subs),
            Some(filter) => {
                let (gone, kept): (Vec<_>, Vec<_>) =
                    std::mem::take(subs).into_iter().partition(|s| s.path_filter == filter);
                *subs = kept;
                gone
            }
        };

        if subs.is_empty() {
            self.sessions.remove(session_id);
        }
        removed
    }

    /// Every active subscription, sessions in sorted order, each session's
    /// entries in subscription order.
    pub fn list_active(&self) -> Vec<SessionSubscription> {
        self.sessions.values().flatten().cloned().collect()
    }

    pub fn for_session(&self, session_id: &str) -> &[SessionSubscription] {
        self.sessions.get(session_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sessions holding at least one subscription.
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.sessions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
