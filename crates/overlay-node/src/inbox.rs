use crate::correlator::Correlator;
use crate::node::OverlayNode;
use crate::node::Subscription;
use crate::node::TopicMessage;
use crate::storage::InboxRecord;
use crate::storage::InboxStore;
use crate::wire;
use crate::wire::InboxAck;
use crate::wire::InboxMessage;
use crate::INBOX_ACK_PROTOCOL;
use crate::INBOX_TOPIC;
use anyhow::Context;
use anyhow::Result;
use futures::future::RemoteHandle;
use futures::FutureExt;
use futures::StreamExt;
use libp2p_stream::IncomingStreams;
use prost::Message;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

/// How long a sender waits for the destination node's acknowledgement.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Observable outcome of a send.
///
/// `Undelivered` covers both a negative acknowledgement and a timeout; in
/// the timeout case the message may still have been persisted remotely.
/// There is deliberately no retry here; upstream layers decide what to do
/// with an undelivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Undelivered,
}

/// Best-effort addressed messaging over the `inbox` broadcast topic.
///
/// A send publishes the message with a fresh random identifier and waits for
/// the destination node to confirm persistence over a direct `inbox-ack`
/// stream. The receive loop does the mirror image for messages addressed to
/// users of this node.
pub struct InboxTransport {
    node: Arc<OverlayNode>,
    acks: Correlator<bool>,
    timeout: Duration,
    _receive_loop_handle: RemoteHandle<()>,
    _ack_loop_handle: RemoteHandle<()>,
}

impl InboxTransport {
    pub async fn spawn<S: InboxStore>(node: Arc<OverlayNode>, store: Arc<S>) -> Result<Self> {
        Self::spawn_with_timeout(node, store, MESSAGE_TIMEOUT).await
    }

    pub async fn spawn_with_timeout<S: InboxStore>(
        node: Arc<OverlayNode>,
        store: Arc<S>,
        timeout: Duration,
    ) -> Result<Self> {
        let subscription = node
            .join(INBOX_TOPIC)
            .await
            .context("Failed to join inbox topic")?;
        let incoming = node
            .accept(INBOX_ACK_PROTOCOL)
            .context("Failed to register inbox-ack handler")?;

        let acks = Correlator::new();

        let (receive_loop, receive_loop_handle) =
            receive_loop(node.clone(), store, subscription).remote_handle();
        tokio::spawn(receive_loop);

        let (ack_loop, ack_loop_handle) = ack_loop(incoming, acks.clone()).remote_handle();
        tokio::spawn(ack_loop);

        Ok(Self {
            node,
            acks,
            timeout,
            _receive_loop_handle: receive_loop_handle,
            _ack_loop_handle: ack_loop_handle,
        })
    }

    /// Publishes a message for `user` and waits for the destination node's
    /// acknowledgement.
    pub async fn send(&self, user: &str, sender: &str, message: &str) -> Result<DeliveryStatus> {
        let message_id = new_message_id();

        let payload = InboxMessage {
            user: user.to_string(),
            sender: sender.to_string(),
            message: message.to_string(),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            message_id: message_id.clone(),
        };

        let waiter = self.acks.register(&message_id);

        if let Err(e) = self
            .node
            .publish(INBOX_TOPIC, payload.encode_to_vec())
            .await
        {
            tracing::debug!(user, "Failed to publish inbox message: {e:#}");
        }

        let status = match waiter.wait(self.timeout).await {
            Some(true) => DeliveryStatus::Delivered,
            Some(false) | None => DeliveryStatus::Undelivered,
        };

        tracing::debug!(user, %message_id, ?status, "Inbox send finished");

        Ok(status)
    }
}

fn new_message_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Persists broadcast messages addressed to users of this node and
/// acknowledges them to the publisher.
async fn receive_loop<S: InboxStore>(
    node: Arc<OverlayNode>,
    store: Arc<S>,
    mut subscription: Subscription,
) {
    while let Some(message) = subscription.recv().await {
        if let Err(e) = receive_one(&node, &store, message).await {
            tracing::warn!("Failed to handle inbox message: {e:#}");
        }
    }

    tracing::debug!("inbox subscription ended");
}

async fn receive_one<S: InboxStore>(
    node: &Arc<OverlayNode>,
    store: &Arc<S>,
    message: TopicMessage,
) -> Result<()> {
    let inbox_message =
        InboxMessage::decode(message.data.as_slice()).context("Failed to decode inbox message")?;

    let lookup_store = store.clone();
    let user = inbox_message.user.clone();
    let known = spawn_blocking(move || lookup_store.recipient_known(&user))
        .await
        .context("Lookup task failed")??;

    if !known {
        // Not addressed to a user of this node.
        return Ok(());
    }

    let persist_store = store.clone();
    let record = InboxRecord {
        user: inbox_message.user.clone(),
        sender: inbox_message.sender.clone(),
        message: inbox_message.message.clone(),
        timestamp: inbox_message.timestamp,
    };
    let persisted = spawn_blocking(move || persist_store.persist(&record))
        .await
        .context("Persist task failed")?;

    let received = match persisted {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                user = %inbox_message.user,
                "Failed to persist inbox message: {e:#}"
            );
            false
        }
    };

    let ack = InboxAck {
        received,
        message_id: inbox_message.message_id.clone(),
    };

    let mut stream = node.open_stream(message.source, INBOX_ACK_PROTOCOL).await?;
    wire::write_message(&mut stream, &ack).await?;

    tracing::debug!(
        user = %inbox_message.user,
        message_id = %inbox_message.message_id,
        received,
        "Acknowledged inbox message"
    );

    Ok(())
}

/// Completes pending sends with the acknowledged outcome.
async fn ack_loop(mut incoming: IncomingStreams, acks: Correlator<bool>) {
    while let Some((peer, mut stream)) = incoming.next().await {
        let acks = acks.clone();
        tokio::spawn(async move {
            match wire::read_message::<InboxAck, _>(&mut stream, wire::MAX_TRANSFER_BYTES).await {
                Ok(ack) => {
                    acks.deliver(&ack.message_id, ack.received);
                }
                Err(e) => {
                    tracing::warn!(%peer, "Dropping bad inbox-ack stream: {e:#}");
                }
            }
        });
    }
}
