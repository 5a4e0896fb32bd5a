//! # Shared Bus - In-Process Event Bus
//!
//! Decouples components that change state (node manager, status monitor,
//! snapshot manager, worker manager) from the consumers of those changes
//! (the presentation layer bridge, other components).
//!
//! ## Delivery Model
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │ Node Manager │                    │  UI bridge   │
//! │              │    publish()       │              │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐           │
//!                  │  Event Bus   │ ──────────┘
//!                  └──────────────┘  subscribe(filter)
//! ```
//!
//! - Topics are plain strings (`node.stateChanged`, `status.updated`, ...)
//! - `publish` never blocks; each subscriber has its own bounded buffer
//! - At-most-once, no replay: a subscriber only sees events published after
//!   it subscribed, and a lagging subscriber loses the oldest events

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod events;
pub mod publisher;
pub mod subscriber;

pub use events::{topics, EventFilter, SupervisorEvent, WireEvent};
pub use publisher::{EventPublisher, InMemoryEventBus};
pub use subscriber::{EventBus, EventStream, EventSubscriber, Subscription, SubscriptionError};

/// Maximum events buffered per subscriber before it starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
