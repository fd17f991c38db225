use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::timeout;

use crate::bus::{MessageBus, QueryAck, QueryResponse};
use crate::config::LocalBusConfig;
use crate::error::Result;

const MAILBOX_CAPACITY: usize = 64;

/// A query delivered to a registered agent. Dropping it without answering
/// counts as a nack once the query times out.
#[derive(Debug)]
pub struct IncomingQuery {
    pub topic: String,
    pub payload: Vec<u8>,
    reply: oneshot::Sender<QueryAck>,
}

impl IncomingQuery {
    pub fn ack(self) {
        let _ = self.reply.send(QueryAck::Ack);
    }

    pub fn nack(self, reason: impl Into<String>) {
        let _ = self.reply.send(QueryAck::Nack(reason.into()));
    }
}

struct Inner {
    config: LocalBusConfig,
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    members: RwLock<HashMap<String, mpsc::Sender<IncomingQuery>>>,
}

/// In-process message bus.
///
/// Topics are broadcast channels shared by every subscriber. Queries are
/// routed to member mailboxes registered with [`LocalBus::join`]; targets
/// without a mailbox are answered with a nack straight away.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(LocalBusConfig::default())
    }
}

impl LocalBus {
    pub fn new(config: LocalBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: Mutex::new(HashMap::new()),
                members: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.config.event_capacity).0)
            .clone()
    }

    /// Register `name` as a bus member and return its query mailbox.
    /// Joining again replaces the previous mailbox.
    pub async fn join(&self, name: &str) -> mpsc::Receiver<IncomingQuery> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.inner
            .members
            .write()
            .await
            .insert(name.to_string(), tx);
        tracing::debug!(node = name, "Member joined local bus");
        rx
    }

    pub async fn leave(&self, name: &str) {
        if self.inner.members.write().await.remove(name).is_some() {
            tracing::debug!(node = name, "Member left local bus");
        }
    }

    pub async fn members(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.members.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn ask(
        mailbox: Option<mpsc::Sender<IncomingQuery>>,
        topic: String,
        payload: Vec<u8>,
        wait: std::time::Duration,
    ) -> QueryAck {
        let Some(mailbox) = mailbox else {
            return QueryAck::Nack("node unreachable".to_string());
        };

        let (reply, answer) = oneshot::channel();
        let query = IncomingQuery {
            topic,
            payload,
            reply,
        };

        let exchange = async {
            mailbox
                .send(query)
                .await
                .map_err(|_| "node unreachable".to_string())?;
            answer
                .await
                .map_err(|_| "node dropped query".to_string())
        };

        match timeout(wait, exchange).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(reason)) => QueryAck::Nack(reason),
            Err(_) => QueryAck::Nack("no response".to_string()),
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // No subscribers is not an error, same as a gossip event nobody reads.
        let delivered = self.sender(topic).send(payload).unwrap_or(0);
        tracing::trace!(topic, delivered, "Published event");
        Ok(())
    }

    async fn query(
        &self,
        topic: &str,
        payload: Vec<u8>,
        targets: &[String],
    ) -> Result<mpsc::Receiver<QueryResponse>> {
        let (tx, rx) = mpsc::channel(targets.len().max(1));

        // Resolve mailboxes up front so no lock is held while waiting on nodes
        let mailboxes: Vec<(String, Option<mpsc::Sender<IncomingQuery>>)> = {
            let members = self.inner.members.read().await;
            targets
                .iter()
                .map(|node| (node.clone(), members.get(node).cloned()))
                .collect()
        };

        for (node, mailbox) in mailboxes {
            let tx = tx.clone();
            let topic = topic.to_string();
            let payload = payload.clone();
            let wait = self.inner.config.query_timeout;
            tokio::spawn(async move {
                let ack = Self::ask(mailbox, topic, payload, wait).await;
                let _ = tx.send(QueryResponse { node, ack }).await;
            });
        }

        Ok(rx)
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_bus() -> LocalBus {
        LocalBus::new(LocalBusConfig {
            event_capacity: 16,
            query_timeout: Duration::from_millis(100),
        })
    }

    async fn collect(mut rx: mpsc::Receiver<QueryResponse>) -> HashMap<String, QueryAck> {
        let mut out = HashMap::new();
        while let Some(resp) = rx.recv().await {
            out.insert(resp.node, resp.ack);
        }
        out
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = quick_bus();
        let mut rx = bus.subscribe("topic");
        bus.publish("topic", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = quick_bus();
        assert!(bus.publish("nobody", b"x".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn query_collects_one_answer_per_target() {
        let bus = quick_bus();
        let mut web1 = bus.join("web1").await;
        let mut web2 = bus.join("web2").await;

        tokio::spawn(async move {
            web1.recv().await.unwrap().ack();
        });
        tokio::spawn(async move {
            web2.recv().await.unwrap().nack("not allowed");
        });

        let targets = vec!["web1".to_string(), "web2".to_string(), "web3".to_string()];
        let answers = collect(bus.query("job", b"run".to_vec(), &targets).await.unwrap()).await;

        assert_eq!(answers.len(), 3);
        assert_eq!(answers["web1"], QueryAck::Ack);
        assert_eq!(answers["web2"], QueryAck::Nack("not allowed".to_string()));
        assert_eq!(
            answers["web3"],
            QueryAck::Nack("node unreachable".to_string())
        );
    }

    #[tokio::test]
    async fn silent_member_times_out_as_nack() {
        let bus = quick_bus();
        let _mailbox = bus.join("slow").await;

        let answers = collect(
            bus.query("job", b"run".to_vec(), &["slow".to_string()])
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(answers["slow"], QueryAck::Nack("no response".to_string()));
    }

    #[tokio::test]
    async fn leave_makes_member_unreachable() {
        let bus = quick_bus();
        let _mailbox = bus.join("db1").await;
        assert_eq!(bus.members().await, vec!["db1".to_string()]);
        bus.leave("db1").await;
        assert!(bus.members().await.is_empty());

        let answers = collect(
            bus.query("job", b"run".to_vec(), &["db1".to_string()])
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(answers["db1"], QueryAck::Nack(_)));
    }
}
