//! # signalk-hub-server
//!
//! The running hub: shared model, subscriptions, scheduled distribution and
//! the reference transports.
//!
//! - [`hub::Hub`] - context object owning the model and everything around it
//! - [`pipeline`] - ordered ingestion worker (decode, classify, dispatch)
//! - [`subscription`] - per-session subscription registry
//! - [`scheduler`] - periodic jobs with synchronous cancellation
//! - [`router`] - one delivery job per subscription
//! - [`delivery`] - the delivery seam and the session hub behind it
//! - [`ws`], [`tcp`] - WebSocket and line-delimited TCP transports

pub mod delivery;
pub mod hub;
pub mod pipeline;
pub mod router;
pub mod scheduler;
pub mod subscription;
pub mod tcp;
pub mod ws;

pub use delivery::{Delivery, DeliveryError, SessionHub, Target};
pub use hub::{Hub, HubError};
pub use pipeline::{Inbound, IngestHandle};
pub use router::{DistributionRouter, SharedModel};
pub use scheduler::{JobHandle, JobToken, Scheduler, TokioScheduler};
pub use subscription::{SessionSubscription, SubscribeOutcome, SubscriptionRegistry, BROADCAST_SESSION};

pub use signalk_hub_core::{HubConfig, SignalKModel};
