//! Subscriber trait and closure adapter.

use intercom_core::Message;
use std::sync::Arc;

/// Outcome of one callback invocation.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives messages published to a topic.
///
/// Callbacks for one topic run one at a time on that topic's worker, so a slow
/// subscriber delays every later message on the topic. The broker bounds each
/// call with `callback_timeout`; errors, panics and timeouts are logged and
/// counted, never propagated.
///
/// The timeout can only fire at an `.await`, so implementations must not block
/// the thread. Wrap blocking code with [`subscriber_fn`].
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "subscriber"
    }

    async fn on_message(&self, message: Arc<Message>) -> CallbackResult;
}

/// A [`Subscriber`] backed by a plain closure.
///
/// The closure runs on Tokio's blocking pool, so a slow or blocking body is cut
/// off by `callback_timeout` like any async subscriber. A body that overruns
/// keeps its blocking thread until it returns; only the topic moves on.
pub struct FnSubscriber<F> {
    name: String,
    f: Arc<F>,
}

/// Wrap a synchronous closure as a subscriber.
pub fn subscriber_fn<F>(name: impl Into<String>, f: F) -> FnSubscriber<F>
where
    F: Fn(Arc<Message>) -> CallbackResult + Send + Sync + 'static,
{
    FnSubscriber {
        name: name.into(),
        f: Arc::new(f),
    }
}

#[async_trait::async_trait]
impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(Arc<Message>) -> CallbackResult + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&self, message: Arc<Message>) -> CallbackResult {
        let f = self.f.clone();
        match tokio::task::spawn_blocking(move || f(message)).await {
            Ok(result) => result,
            // Re-raise so the worker reports it as a panic.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(e.into()),
        }
    }
}
