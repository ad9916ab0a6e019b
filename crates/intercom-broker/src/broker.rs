//! The broker front-end: publish, subscribe, unsubscribe.

use crate::queue::{PushOutcome, TopicQueue};
use crate::stats::StatsSnapshot;
use crate::subscriber::Subscriber;
use crate::worker::{run_topic_worker, Shared, TopicEntry, TopicMap, TopicState};
use intercom_core::{BrokerConfig, Clock, Message, MessageId, Priority, SystemClock, Topic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Optional fields of a published message.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    pub sender_id: Option<String>,
    pub ttl: Option<Duration>,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Returned by [`MessageBroker::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

pub struct MessageBroker {
    shared: Arc<Shared>,
    config: BrokerConfig,
    runtime: Handle,
    next_message_id: AtomicU64,
    next_subscription_id: AtomicU64,
    cancel: CancellationToken,
}

impl MessageBroker {
    /// Create a broker whose topic workers run on the current Tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_runtime(config, Arc::new(SystemClock), Handle::current())
    }

    pub fn with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_runtime(config, clock, Handle::current())
    }

    pub fn with_runtime(config: BrokerConfig, clock: Arc<dyn Clock>, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscriptions: RwLock::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                stats: Default::default(),
                clock,
                callback_timeout: config.callback_timeout(),
                wake_coalesce: config.wake_coalesce(),
            }),
            config,
            runtime,
            next_message_id: AtomicU64::new(1),
            next_subscription_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Enqueue a message and return its id. Never blocks and never fails; a full
    /// queue applies the configured overflow policy and counts the drop.
    pub fn publish(
        &self,
        topic: impl Into<Topic>,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> MessageId {
        let topic = topic.into();
        let id = MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed));
        let message = Message {
            id,
            topic: topic.clone(),
            payload,
            priority: options.priority,
            timestamp: self.shared.clock.now(),
            sender_id: options.sender_id,
            ttl: options.ttl,
            headers: options.headers,
        };
        self.shared.stats.record_published();

        // Queue under the topic map lock so an idle worker cannot retire
        // between lookup and push.
        let outcome = {
            let mut topics = self.shared.lock_topics();
            let state = self.ensure_topic(&mut topics, &topic);
            let outcome = state.lock_queue().push(message);
            state.notify.notify_one();
            outcome
        };
        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::Evicted(old) => {
                self.shared.stats.record_evicted();
                debug!("Topic '{}' full: evicted {} ({})", topic, old.id, old.priority);
            }
            PushOutcome::Rejected(new) => {
                self.shared.stats.record_evicted();
                debug!("Topic '{}' full: dropped {} ({})", topic, new.id, new.priority);
            }
        }
        id
    }

    /// Register a subscriber on a topic. Messages already queued may or may not
    /// reach it; nothing is replayed.
    pub fn subscribe(
        &self,
        topic: impl Into<Topic>,
        subscriber: impl Subscriber + 'static,
    ) -> SubscriptionHandle {
        self.subscribe_arc(topic, Arc::new(subscriber))
    }

    pub fn subscribe_arc(
        &self,
        topic: impl Into<Topic>,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriptionHandle {
        let topic = topic.into();
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        debug!("Subscriber '{}' (#{}) on '{}'", subscriber.name(), id, topic);
        self.shared
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_default()
            .push((id, subscriber));
        self.ensure_topic(&mut self.shared.lock_topics(), &topic);
        SubscriptionHandle { id, topic }
    }

    /// Remove a subscription. Unknown or already-removed handles are ignored.
    /// A topic left with no subscribers and an empty queue is retired.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let emptied = {
            let mut subscriptions = self
                .shared
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match subscriptions.get_mut(&handle.topic) {
                Some(list) => {
                    list.retain(|(id, _)| *id != handle.id);
                    let emptied = list.is_empty();
                    if emptied {
                        subscriptions.remove(&handle.topic);
                    }
                    emptied
                }
                None => false,
            }
        };
        if emptied {
            // Wake the worker so it notices it is idle.
            if let Some(entry) = self.shared.lock_topics().get(&handle.topic) {
                entry.state.notify.notify_one();
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Topic::new(topic))
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Messages waiting on a topic (not counting one being delivered).
    pub fn queue_depth(&self, topic: &str) -> usize {
        self.shared
            .lock_topics()
            .get(&Topic::new(topic))
            .map(|entry| entry.state.lock_queue().len())
            .unwrap_or(0)
    }

    /// Live topics, sorted. A topic is live while it has subscribers or queued
    /// messages.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.shared.lock_topics().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Stop every topic worker and wait for them to exit. Queued messages are
    /// abandoned.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = self
            .shared
            .lock_topics()
            .values_mut()
            .filter_map(|entry| entry.worker.take())
            .collect();
        let count = workers.len();
        for worker in workers {
            let _ = worker.await;
        }
        info!("Broker shut down ({} topic worker(s))", count);
    }

    /// The topic's queue, spawning its worker on first use or after retirement.
    fn ensure_topic(&self, topics: &mut TopicMap, topic: &Topic) -> Arc<TopicState> {
        if let Some(entry) = topics.get(topic) {
            return entry.state.clone();
        }

        let state = Arc::new(TopicState::new(TopicQueue::new(
            self.config.queue_capacity,
            self.config.overflow,
        )));
        let worker = self.runtime.spawn(run_topic_worker(
            topic.clone(),
            state.clone(),
            self.shared.clone(),
            self.cancel.child_token(),
        ));
        debug!("Topic '{}' created", topic);
        topics.insert(
            topic.clone(),
            TopicEntry {
                state: state.clone(),
                worker: Some(worker),
            },
        );
        state
    }
}

impl Drop for MessageBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
