//! Intercom Broker - topic pub/sub with priority queues and TTL expiry
//!
//! Each topic owns a bounded priority queue and one delivery worker. `publish`
//! enqueues and returns immediately; the worker drains the queue in
//! `(priority desc, publish order asc)` order and fans every live message out
//! to the topic's current subscribers. Subscriber failures are isolated,
//! logged and counted; nothing is ever reported back to the publisher.

pub mod broker;
pub mod queue;
pub mod stats;
pub mod subscriber;
mod worker;

pub use broker::{MessageBroker, PublishOptions, SubscriptionHandle};
pub use queue::{PushOutcome, TopicQueue};
pub use stats::{BrokerStats, StatsSnapshot};
pub use subscriber::{subscriber_fn, CallbackResult, FnSubscriber, Subscriber};
