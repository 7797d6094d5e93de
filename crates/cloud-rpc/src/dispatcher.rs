//! RPC Dispatcher (C5): models the in-process mailbox shape the
//! controller depends on without owning a real message broker or wire
//! transport. `cast` is fire-and-forget delivery to a topic or
//! `topic.host`; `call` is request/response keyed by a generated
//! `msg_id` with a per-call deadline.
//!
//! Workers register an mpsc sender under the topics they consume.
//! Fan-out is a single hop — pick one registered worker per topic —
//! rather than a broadcast to every subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cloud_core::error::{CloudError, Result};
use cloud_core::protocol::{Destination, Envelope, Reply, RequestContext};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// A worker's inbound mailbox: the dispatcher pushes envelopes, the
/// worker task drains them and, for `call`s, eventually replies via
/// `Dispatcher::reply`.
pub type Mailbox = mpsc::UnboundedSender<Envelope>;

struct TopicRegistration {
    /// Workers registered directly under `topic.host` (exact address).
    hosts: HashMap<String, Mailbox>,
    /// Workers registered under the bare `topic` (fan-out eligible).
    /// Round-robined so no single worker starves under load.
    fanout: Vec<Mailbox>,
    next: usize,
}

impl Default for TopicRegistration {
    fn default() -> Self {
        TopicRegistration {
            hosts: HashMap::new(),
            fanout: Vec::new(),
            next: 0,
        }
    }
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, TopicRegistration>,
    pending: HashMap<String, oneshot::Sender<Reply>>,
}

/// Dispatches `cast`/`call` envelopes to registered worker mailboxes.
/// One dispatcher instance is shared (via `Arc`) by every verb handler
/// in a process; workers hold their own clone to register and reply.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Mutex<Inner>>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        Dispatcher {
            inner: Arc::new(Mutex::new(Inner::default())),
            default_timeout,
        }
    }

    /// Registers `mailbox` to receive envelopes sent to `destination`.
    /// A `TopicHost` registration only receives directly-addressed
    /// traffic; a bare `Topic` registration is additionally eligible
    /// for fan-out `cast`/`call`s sent to that topic.
    pub async fn register(&self, destination: Destination, mailbox: Mailbox) {
        let mut inner = self.inner.lock().await;
        let reg = inner.topics.entry(destination.topic().to_string()).or_default();
        match destination {
            Destination::Topic(_) => reg.fanout.push(mailbox),
            Destination::TopicHost(_, host) => {
                reg.hosts.insert(host, mailbox);
            }
        }
    }

    /// Fire-and-forget delivery. At-least-once: the caller does not
    /// learn whether the worker acted on it. Workers must be
    /// idempotent on `terminate_instance`/`delete_volume`.
    pub async fn cast(&self, destination: &Destination, envelope: Envelope) -> Result<()> {
        let mailbox = self.resolve(destination).await?;
        mailbox
            .send(envelope)
            .map_err(|_| CloudError::ServiceUnavailable(destination.to_string()))
    }

    /// Request/response: sends `envelope` with a fresh `msg_id`,
    /// registers a reply slot, and waits up to `timeout` (or the
    /// dispatcher default). Expired calls fail with `RpcTimeout` and
    /// never mutate caller-side state beyond what the caller itself
    /// does on error.
    pub async fn call(
        &self,
        destination: &Destination,
        method: impl Into<String>,
        args: HashMap<String, serde_json::Value>,
        context: RequestContext,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.pending.insert(msg_id.clone(), tx);
        }

        let envelope = Envelope {
            method: method.into(),
            args,
            msg_id: Some(msg_id.clone()),
            reply_to: None,
            context,
        };
        let mailbox = match self.resolve(destination).await {
            Ok(m) => m,
            Err(e) => {
                self.inner.lock().await.pending.remove(&msg_id);
                return Err(e);
            }
        };
        if mailbox.send(envelope).is_err() {
            self.inner.lock().await.pending.remove(&msg_id);
            return Err(CloudError::ServiceUnavailable(destination.to_string()));
        }

        let deadline = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply.result.map_err(CloudError::ServiceUnavailable),
            Ok(Err(_)) => Err(CloudError::Internal(format!(
                "reply channel dropped for {msg_id}"
            ))),
            Err(_) => {
                self.inner.lock().await.pending.remove(&msg_id);
                warn!(msg_id, destination = %destination, "rpc call timed out");
                Err(CloudError::RpcTimeout(deadline))
            }
        }
    }

    /// Delivers a worker's reply to the caller awaiting `msg_id`.
    /// A reply with no matching pending call (already timed out, or a
    /// duplicate at-least-once delivery) is dropped silently.
    pub async fn reply(&self, reply: Reply) {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = inner.pending.remove(&reply.msg_id) {
            let _ = tx.send(reply);
        } else {
            debug!(msg_id = %reply.msg_id, "reply for unknown or expired call");
        }
    }

    /// Cancels a pending call as if it had timed out, releasing the
    /// reply slot. Used when a handler's own deadline/cancellation
    /// fires before the dispatcher's internal timeout would.
    pub async fn cancel(&self, msg_id: &str) {
        self.inner.lock().await.pending.remove(msg_id);
    }

    async fn resolve(&self, destination: &Destination) -> Result<Mailbox> {
        let mut inner = self.inner.lock().await;
        let reg = inner
            .topics
            .get_mut(destination.topic())
            .ok_or_else(|| CloudError::ServiceUnavailable(destination.to_string()))?;
        match destination {
            Destination::TopicHost(_, host) => reg
                .hosts
                .get(host)
                .cloned()
                .ok_or_else(|| CloudError::ServiceUnavailable(destination.to_string())),
            Destination::Topic(_) => {
                if reg.fanout.is_empty() {
                    return Err(CloudError::ServiceUnavailable(destination.to_string()));
                }
                let idx = reg.next % reg.fanout.len();
                reg.next = reg.next.wrapping_add(1);
                Ok(reg.fanout[idx].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            request_id: "req-1".into(),
            user_id: "bob".into(),
            project_id: "acme".into(),
            is_admin: false,
            roles: vec!["developer".into()],
            remote_address: None,
            read_deleted: false,
        }
    }

    #[tokio::test]
    async fn cast_delivers_to_topic_host() {
        let d = Dispatcher::new(Duration::from_millis(200));
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.register(Destination::parse("compute.host1"), tx).await;

        d.cast(
            &Destination::parse("compute.host1"),
            Envelope {
                method: "run_instance".into(),
                args: HashMap::from([("instance_id".to_string(), serde_json::json!("i-1"))]),
                msg_id: None,
                reply_to: None,
                context: ctx(),
            },
        )
        .await
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.method, "run_instance");
    }

    #[tokio::test]
    async fn cast_to_unregistered_destination_fails() {
        let d = Dispatcher::new(Duration::from_millis(200));
        let result = d
            .cast(
                &Destination::parse("compute"),
                Envelope {
                    method: "run_instance".into(),
                    args: HashMap::new(),
                    msg_id: None,
                    reply_to: None,
                    context: ctx(),
                },
            )
            .await;
        assert!(matches!(result, Err(CloudError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn call_round_trips_through_reply() {
        let d = Dispatcher::new(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.register(Destination::parse("volume.hostA"), tx).await;

        let dispatcher = d.clone();
        tokio::spawn(async move {
            let env = rx.recv().await.unwrap();
            dispatcher
                .reply(Reply {
                    msg_id: env.msg_id.unwrap(),
                    result: Ok(serde_json::json!({"status": "ok"})),
                })
                .await;
        });

        let result = d
            .call(
                &Destination::parse("volume.hostA"),
                "create_volume",
                HashMap::new(),
                ctx(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn call_times_out_when_worker_never_replies() {
        let d = Dispatcher::new(Duration::from_millis(50));
        let (tx, _rx) = mpsc::unbounded_channel();
        d.register(Destination::parse("volume.hostA"), tx).await;

        let result = d
            .call(
                &Destination::parse("volume.hostA"),
                "create_volume",
                HashMap::new(),
                ctx(),
                None,
            )
            .await;
        assert!(matches!(result, Err(CloudError::RpcTimeout(_))));
    }

    #[tokio::test]
    async fn fanout_round_robins_across_registered_workers() {
        let d = Dispatcher::new(Duration::from_millis(200));
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        d.register(Destination::parse("scheduler"), tx1).await;
        d.register(Destination::parse("scheduler"), tx2).await;

        for _ in 0..2 {
            d.cast(
                &Destination::parse("scheduler"),
                Envelope {
                    method: "ping".into(),
                    args: HashMap::new(),
                    msg_id: None,
                    reply_to: None,
                    context: ctx(),
                },
            )
            .await
            .unwrap();
        }

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn reply_for_unknown_msg_id_is_dropped_without_panic() {
        let d = Dispatcher::new(Duration::from_millis(200));
        d.reply(Reply {
            msg_id: "nonexistent".into(),
            result: Ok(serde_json::json!(null)),
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_releases_pending_slot() {
        let d = Dispatcher::new(Duration::from_secs(5));
        // cancel on an id that was never inserted is a no-op
        d.cancel("ghost-id").await;
    }
}
