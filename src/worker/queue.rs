//! Parent-side handles to a worker's two queues.
//!
//! Both queues are unbounded: audio producers never block and never drop
//! data, at the cost of memory growth when decoding falls behind.
//!
//! The output side has a single dispatcher, the [`OutputRouter`] owned by the
//! worker's reader task. It hands every result to the [`Subscription`] of its
//! session, in the order the worker produced them, so any number of
//! connections can share one worker without stealing each other's results.

use crate::error::{LivescribeError, Result};
use crate::worker::protocol::{WorkerInput, WorkerResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

/// Sending half of a worker's input queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InputQueue {
    model: &'static str,
    tx: mpsc::UnboundedSender<WorkerInput>,
}

impl InputQueue {
    pub fn new(model: &'static str) -> (Self, mpsc::UnboundedReceiver<WorkerInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { model, tx }, rx)
    }

    /// Enqueue without waiting.
    pub fn put_nowait(&self, item: WorkerInput) -> Result<()> {
        self.tx.send(item).map_err(|_| LivescribeError::QueueClosed {
            model: self.model.to_string(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn model(&self) -> &'static str {
        self.model
    }
}

#[derive(Debug)]
struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<WorkerResult>,
}

#[derive(Debug, Default)]
struct Routes {
    closed: bool,
    next_id: u64,
    sessions: HashMap<String, Route>,
}

#[derive(Debug, Default)]
struct Shared {
    routes: Mutex<Routes>,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Receiving side of a worker's output queue. Cheap to clone.
///
/// Results go to the subscription of their session. Results of sessions
/// nobody subscribed to, and untagged results while there are no
/// subscriptions, land on the shared queue read by [`recv`](Self::recv).
#[derive(Debug, Clone)]
pub struct OutputQueue {
    shared: Arc<Shared>,
    unrouted: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkerResult>>>,
}

impl OutputQueue {
    pub fn new() -> (Self, OutputRouter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
                unrouted: Arc::new(tokio::sync::Mutex::new(rx)),
            },
            OutputRouter {
                shared,
                unrouted: tx,
            },
        )
    }

    /// Receive every result tagged with `session_id` from now on.
    ///
    /// A later subscription for the same session replaces this one. Once the
    /// worker is gone the subscription drains and then yields `None`.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.shared.routes();
        routes.next_id += 1;
        let id = routes.next_id;
        if !routes.closed {
            routes
                .sessions
                .insert(session_id.to_string(), Route { id, tx });
        }
        Subscription {
            shared: Arc::clone(&self.shared),
            session_id: session_id.to_string(),
            id,
            rx,
        }
    }

    /// Next unrouted result; `None` once the worker is gone and the queue is
    /// drained.
    pub async fn recv(&self) -> Option<WorkerResult> {
        self.unrouted.lock().await.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<WorkerResult> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }
}

/// The single dispatcher of a worker's results.
///
/// Dropping it closes every subscription and the unrouted queue.
#[derive(Debug)]
pub struct OutputRouter {
    shared: Arc<Shared>,
    unrouted: mpsc::UnboundedSender<WorkerResult>,
}

impl OutputRouter {
    /// Deliver one result. Returns `false` if nobody could take it.
    pub fn dispatch(&self, mut result: WorkerResult) -> bool {
        let routes = self.shared.routes();
        let target = result.session_id.clone();

        match target.as_deref() {
            Some(id) => {
                let route = routes.sessions.get(id).map(|r| r.tx.clone());
                if let Some(tx) = route {
                    match tx.send(result) {
                        Ok(()) => return true,
                        Err(SendError(returned)) => result = returned,
                    }
                }
            }
            None if !routes.sessions.is_empty() => {
                let mut delivered = false;
                for route in routes.sessions.values() {
                    delivered |= route.tx.send(result.clone()).is_ok();
                }
                return delivered;
            }
            None => {}
        }
        drop(routes);
        self.unrouted.send(result).is_ok()
    }
}

impl Drop for OutputRouter {
    fn drop(&mut self) {
        let mut routes = self.shared.routes();
        routes.closed = true;
        routes.sessions.clear();
    }
}

/// Results of one session, in worker order.
#[derive(Debug)]
pub struct Subscription {
    shared: Arc<Shared>,
    session_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<WorkerResult>,
}

impl Subscription {
    /// Next result; `None` once the worker is gone and everything routed
    /// here has been received.
    pub async fn recv(&mut self) -> Option<WorkerResult> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut routes = self.shared.routes();
        if routes
            .sessions
            .get(&self.session_id)
            .is_some_and(|route| route.id == self.id)
        {
            routes.sessions.remove(&self.session_id);
        }
    }
}

/// The (input, output) pair of one running worker.
#[derive(Debug, Clone)]
pub struct WorkerQueues {
    pub input: InputQueue,
    pub output: OutputQueue,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(text: &str, session: &str) -> WorkerResult {
        WorkerResult::transcript("m", text, false).with_session(Some(session.to_string()))
    }

    #[tokio::test]
    async fn test_put_after_receiver_dropped_fails() {
        let (queue, rx) = InputQueue::new("m");
        drop(rx);
        assert!(queue.is_closed());
        let err = queue.put_nowait(WorkerInput::Reset).unwrap_err();
        assert!(matches!(err, LivescribeError::QueueClosed { model } if model == "m"));
    }

    #[tokio::test]
    async fn test_input_preserves_order() {
        let (queue, mut rx) = InputQueue::new("m");
        queue.put_nowait(WorkerInput::Reset).unwrap();
        queue
            .put_nowait(WorkerInput::Flush { session_id: None })
            .unwrap();
        queue.put_nowait(WorkerInput::Stop).unwrap();

        assert_eq!(rx.recv().await, Some(WorkerInput::Reset));
        assert_eq!(rx.recv().await, Some(WorkerInput::Flush { session_id: None }));
        assert_eq!(rx.recv().await, Some(WorkerInput::Stop));
    }

    #[tokio::test]
    async fn test_output_drains_then_closes() {
        let (queue, router) = OutputQueue::new();
        assert!(router.dispatch(WorkerResult::transcript("m", "a", false)));
        assert!(router.dispatch(WorkerResult::transcript("m", "b", true)));
        drop(router);

        assert_eq!(queue.recv().await.map(|r| r.text), Some("a".to_string()));
        assert_eq!(queue.clone().recv().await.map(|r| r.text), Some("b".to_string()));
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_timeout_on_idle_queue() {
        let (queue, _router) = OutputQueue::new();
        assert!(
            queue
                .recv_timeout(Duration::from_millis(20))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_interleaved_sessions_each_get_all_their_results() {
        let (queue, router) = OutputQueue::new();
        let mut a = queue.subscribe("a");
        let mut b = queue.subscribe("b");

        for i in 0..4 {
            router.dispatch(tagged(&format!("a{i}"), "a"));
            if i % 2 == 0 {
                router.dispatch(tagged(&format!("b{i}"), "b"));
            }
        }
        drop(router);

        let mut seen_a = Vec::new();
        while let Some(result) = a.recv().await {
            seen_a.push(result.text);
        }
        let mut seen_b = Vec::new();
        while let Some(result) = b.recv().await {
            seen_b.push(result.text);
        }
        assert_eq!(seen_a, vec!["a0", "a1", "a2", "a3"]);
        assert_eq!(seen_b, vec!["b0", "b2"]);
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribed_session_goes_to_shared_queue() {
        let (queue, router) = OutputQueue::new();
        let sub = queue.subscribe("a");
        drop(sub);

        assert!(router.dispatch(tagged("late", "a")));
        assert_eq!(queue.recv().await.map(|r| r.text), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_untagged_result_reaches_every_subscriber() {
        let (queue, router) = OutputQueue::new();
        let mut a = queue.subscribe("a");
        let mut b = queue.subscribe("b");

        assert!(router.dispatch(WorkerResult::failure("m", "boom")));
        assert!(a.recv().await.unwrap().is_error());
        assert!(b.recv().await.unwrap().is_error());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous_route() {
        let (queue, router) = OutputQueue::new();
        let old = queue.subscribe("a");
        let mut new = queue.subscribe("a");
        drop(old);

        assert!(router.dispatch(tagged("x", "a")));
        assert_eq!(new.recv().await.map(|r| r.text), Some("x".to_string()));
    }

    #[tokio::test]
    async fn test_subscribe_after_worker_gone_yields_none() {
        let (queue, router) = OutputQueue::new();
        drop(router);
        let mut sub = queue.subscribe("a");
        assert!(sub.recv().await.is_none());
    }
}
