//! Per-topic delivery worker.

use crate::queue::TopicQueue;
use crate::stats::BrokerStats;
use crate::subscriber::Subscriber;
use futures::FutureExt;
use intercom_core::{Clock, Message, MessageId, Topic};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type SubscriberList = Vec<(u64, Arc<dyn Subscriber>)>;

/// A live topic: its queue and the worker draining it.
pub(crate) struct TopicEntry {
    pub state: Arc<TopicState>,
    pub worker: Option<JoinHandle<()>>,
}

pub(crate) type TopicMap = HashMap<Topic, TopicEntry>;

/// State shared by the broker front-end and every topic worker.
///
/// Lock order: `topics`, then a topic queue, then `subscriptions`.
pub(crate) struct Shared {
    pub subscriptions: RwLock<HashMap<Topic, SubscriberList>>,
    pub topics: Mutex<TopicMap>,
    pub stats: BrokerStats,
    pub clock: Arc<dyn Clock>,
    pub callback_timeout: Duration,
    pub wake_coalesce: Duration,
}

impl Shared {
    pub fn lock_topics(&self) -> MutexGuard<'_, TopicMap> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers_for(&self, topic: &Topic) -> SubscriberList {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn has_subscribers(&self, topic: &Topic) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .is_some_and(|list| !list.is_empty())
    }

    /// Remove the topic if `state` still owns it, nothing is queued and nobody
    /// is subscribed. Returns true when the worker for `state` should exit.
    fn retire_if_idle(&self, topic: &Topic, state: &Arc<TopicState>) -> bool {
        let mut topics = self.lock_topics();
        let owned = topics
            .get(topic)
            .is_some_and(|entry| Arc::ptr_eq(&entry.state, state));
        if !owned {
            return true;
        }
        if !state.lock_queue().is_empty() || self.has_subscribers(topic) {
            return false;
        }
        topics.remove(topic);
        true
    }
}

/// One topic's queue and its wake-up signal.
pub(crate) struct TopicState {
    pub queue: Mutex<TopicQueue>,
    pub notify: Notify,
}

impl TopicState {
    pub fn new(queue: TopicQueue) -> Self {
        Self {
            queue: Mutex::new(queue),
            notify: Notify::new(),
        }
    }

    pub fn lock_queue(&self) -> MutexGuard<'_, TopicQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why a message did not reach a subscriber. Never surfaced to publishers.
#[derive(Debug, Error)]
pub(crate) enum DeliveryError {
    #[error("{id} on '{topic}' expired before delivery")]
    Expired { topic: Topic, id: MessageId },

    #[error("subscriber '{subscriber}' failed on {id}: {message}")]
    Callback {
        subscriber: String,
        id: MessageId,
        message: String,
    },

    #[error("subscriber '{subscriber}' panicked on {id}: {message}")]
    Panicked {
        subscriber: String,
        id: MessageId,
        message: String,
    },

    #[error("subscriber '{subscriber}' timed out on {id} after {timeout:?}")]
    TimedOut {
        subscriber: String,
        id: MessageId,
        timeout: Duration,
    },
}

/// Drain `state` until cancelled or until the topic goes idle with no
/// subscribers. Publishers and subscribers re-create a retired topic.
///
/// After each wake-up the worker waits `wake_coalesce` before dequeuing, so a
/// burst published into an idle topic is delivered in priority order.
pub(crate) async fn run_topic_worker(
    topic: Topic,
    state: Arc<TopicState>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    debug!("Worker for topic '{}' started", topic);
    let mut woke = true;
    loop {
        if woke && !shared.wake_coalesce.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(shared.wake_coalesce) => {}
                _ = cancel.cancelled() => break,
            }
        }
        woke = false;
        if cancel.is_cancelled() {
            break;
        }

        let next = state.lock_queue().pop();
        match next {
            Some(message) => deliver(&topic, message, &shared).await,
            None => {
                if shared.retire_if_idle(&topic, &state) {
                    debug!("Worker for topic '{}' retired", topic);
                    return;
                }
                tokio::select! {
                    _ = state.notify.notified() => woke = true,
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
    info!("Worker for topic '{}' stopped", topic);
}

async fn deliver(topic: &Topic, message: Message, shared: &Shared) {
    if message.is_expired_at(shared.clock.now()) {
        shared.stats.record_expired();
        debug!(
            "{}",
            DeliveryError::Expired {
                topic: topic.clone(),
                id: message.id,
            }
        );
        return;
    }

    let subscribers = shared.subscribers_for(topic);
    if subscribers.is_empty() {
        debug!("{} on '{}' had no subscribers", message.id, topic);
        return;
    }

    let message = Arc::new(message);
    for (_, subscriber) in subscribers {
        match invoke(subscriber.as_ref(), message.clone(), shared.callback_timeout).await {
            Ok(()) => shared.stats.record_delivery(),
            Err(e) => {
                shared.stats.record_callback_failure();
                warn!("{}", e);
            }
        }
    }
}

async fn invoke(
    subscriber: &dyn Subscriber,
    message: Arc<Message>,
    timeout: Duration,
) -> Result<(), DeliveryError> {
    let id = message.id;
    let call = AssertUnwindSafe(subscriber.on_message(message)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(DeliveryError::Callback {
            subscriber: subscriber.name().to_string(),
            id,
            message: e.to_string(),
        }),
        Ok(Err(panic)) => Err(DeliveryError::Panicked {
            subscriber: subscriber.name().to_string(),
            id,
            message: panic_message(panic.as_ref()),
        }),
        Err(_) => Err(DeliveryError::TimedOut {
            subscriber: subscriber.name().to_string(),
            id,
            timeout,
        }),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
