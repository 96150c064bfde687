use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use futures::future::RemoteHandle;
use futures::FutureExt;
use futures::StreamExt;
use libp2p::gossipsub;
use libp2p::gossipsub::IdentTopic;
use libp2p::gossipsub::MessageAuthenticity;
use libp2p::gossipsub::ValidationMode;
use libp2p::identify;
use libp2p::kad;
use libp2p::kad::store::MemoryStore;
use libp2p::multiaddr::Protocol;
use libp2p::noise;
use libp2p::swarm::NetworkBehaviour;
use libp2p::swarm::SwarmEvent;
use libp2p::tcp;
use libp2p::yamux;
use libp2p::Multiaddr;
use libp2p::PeerId;
use libp2p::StreamProtocol;
use libp2p::Swarm;
use libp2p::SwarmBuilder;
use libp2p_stream as stream;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// Buffered topic messages per subscription before the subscriber loop has
/// to catch up. Overflowing messages are dropped.
const TOPIC_CHANNEL_CAPACITY: usize = 64;

/// How long to wait at startup for the listeners to come up.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// TCP listen port.
    pub tcp_port: u16,
    /// UDP listen port for QUIC.
    pub udp_port: u16,
    /// Bootstrap peer to dial. `None` makes this a seed node.
    pub bootstrap: Option<Multiaddr>,
}

/// A message received on a joined topic.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    /// The peer that published the message.
    pub source: PeerId,
    pub data: Vec<u8>,
}

/// Receiving end of a joined topic.
pub struct Subscription {
    rx: mpsc::Receiver<TopicMessage>,
}

impl Subscription {
    /// Next message on the topic. `None` once the node has shut down.
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }
}

#[derive(NetworkBehaviour)]
struct OverlayBehaviour {
    gossipsub: gossipsub::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    stream: stream::Behaviour,
}

enum Command {
    Join {
        topic: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<TopicMessage>>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// The node's connection to the peer overlay.
///
/// Owns the libp2p host: peer identity, TCP and QUIC listeners, Kademlia
/// discovery, the gossipsub engine and the stream-protocol registry. The
/// swarm runs on a single background task; [`join`](OverlayNode::join) and
/// [`publish`](OverlayNode::publish) enter it through a command channel,
/// while streams are opened and accepted directly through
/// [`libp2p_stream::Control`] without touching the event loop.
///
/// Dropping the node stops the event loop and with it all subscriptions.
pub struct OverlayNode {
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    control: stream::Control,
    _event_loop_handle: RemoteHandle<()>,
}

impl OverlayNode {
    /// Starts the overlay node and waits until its listeners are up.
    pub async fn spawn(config: OverlayConfig) -> Result<Self> {
        let mut swarm = build_swarm()?;
        let peer_id = *swarm.local_peer_id();

        swarm
            .listen_on(
                format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.udp_port)
                    .parse()
                    .expect("valid multiaddr"),
            )
            .context("Failed to listen on QUIC")?;
        swarm
            .listen_on(
                format!("/ip4/0.0.0.0/tcp/{}", config.tcp_port)
                    .parse()
                    .expect("valid multiaddr"),
            )
            .context("Failed to listen on TCP")?;

        if let Some(bootstrap) = &config.bootstrap {
            dial_bootstrap(&mut swarm, bootstrap)?;
        }

        let control = swarm.behaviour_mut().stream.new_control();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_loop, event_loop_handle) = event_loop(swarm, cmd_rx).remote_handle();
        tokio::spawn(event_loop);

        let node = Self {
            peer_id,
            cmd_tx,
            control,
            _event_loop_handle: event_loop_handle,
        };

        node.wait_for_listen_addrs().await?;

        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Subscribes to `topic`. Joining an already joined topic is fine; every
    /// subscription receives its own copy of each message.
    pub async fn join(&self, topic: &str) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Join {
                topic: topic.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("Overlay node is gone"))?;

        let rx = rx.await.map_err(|_| anyhow!("Overlay node is gone"))??;

        Ok(Subscription { rx })
    }

    /// Publishes `data` on `topic`.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| anyhow!("Overlay node is gone"))?;

        rx.await.map_err(|_| anyhow!("Overlay node is gone"))?
    }

    /// Opens an outbound stream to `peer` speaking `protocol`.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<libp2p::Stream> {
        let stream = self
            .control
            .clone()
            .open_stream(peer, protocol)
            .await
            .map_err(|e| anyhow!("Failed to open stream to {peer}: {e}"))?;

        Ok(stream)
    }

    /// Registers this node as a handler for inbound `protocol` streams.
    ///
    /// Can only be called once per protocol.
    pub fn accept(&self, protocol: StreamProtocol) -> Result<stream::IncomingStreams> {
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| anyhow!("Protocol {protocol} already registered"))?;

        Ok(incoming)
    }

    /// The addresses the node is listening on.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ListenAddrs { reply })
            .await
            .map_err(|_| anyhow!("Overlay node is gone"))?;

        rx.await.map_err(|_| anyhow!("Overlay node is gone"))
    }

    async fn wait_for_listen_addrs(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + LISTEN_TIMEOUT;
        loop {
            if !self.listen_addrs().await?.is_empty() {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                bail!("Timed out waiting for listen addresses");
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn build_swarm() -> Result<Swarm<OverlayBehaviour>> {
    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| anyhow!("Failed to set up TCP transport: {e}"))?
        .with_quic()
        .with_behaviour(|key| {
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .validation_mode(ValidationMode::Strict)
                .build()
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )?;

            let peer_id = key.public().to_peer_id();
            let mut kademlia =
                kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify = identify::Behaviour::new(identify::Config::new(
                "/haven/1.0.0".to_string(),
                key.public(),
            ));

            Ok(OverlayBehaviour {
                gossipsub,
                kademlia,
                identify,
                stream: stream::Behaviour::new(),
            })
        })
        .map_err(|e| anyhow!("Failed to set up behaviour: {e}"))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

fn dial_bootstrap(swarm: &mut Swarm<OverlayBehaviour>, addr: &Multiaddr) -> Result<()> {
    let peer_id = addr
        .iter()
        .find_map(|protocol| match protocol {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .context("Bootstrap address is missing the /p2p/<peer-id> suffix")?;

    swarm
        .behaviour_mut()
        .kademlia
        .add_address(&peer_id, addr.clone());
    swarm
        .dial(addr.clone())
        .context("Failed to dial bootstrap peer")?;

    if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
        tracing::warn!("Could not start DHT bootstrap: {e}");
    }

    tracing::info!(%addr, "Dialed bootstrap peer");

    Ok(())
}

struct Topic {
    subscribers: Vec<mpsc::Sender<TopicMessage>>,
}

async fn event_loop(mut swarm: Swarm<OverlayBehaviour>, mut cmd_rx: mpsc::Receiver<Command>) {
    let local_peer_id = *swarm.local_peer_id();
    let mut topics: HashMap<gossipsub::TopicHash, Topic> = HashMap::new();
    let mut listen_addrs: Vec<Multiaddr> = Vec::new();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else {
                    tracing::debug!("Overlay node handle dropped, stopping event loop");
                    break;
                };

                handle_command(&mut swarm, &mut topics, &listen_addrs, command);
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(&mut swarm, &mut topics, &mut listen_addrs, local_peer_id, event);
            }
        }
    }
}

fn handle_command(
    swarm: &mut Swarm<OverlayBehaviour>,
    topics: &mut HashMap<gossipsub::TopicHash, Topic>,
    listen_addrs: &[Multiaddr],
    command: Command,
) {
    match command {
        Command::Join { topic, reply } => {
            let ident_topic = IdentTopic::new(topic.as_str());
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&ident_topic)
                .map_err(|e| anyhow!("Failed to subscribe to {topic}: {e}"))
                .map(|_| {
                    let (tx, rx) = mpsc::channel(TOPIC_CHANNEL_CAPACITY);
                    topics
                        .entry(ident_topic.hash())
                        .or_insert_with(|| Topic {
                            subscribers: Vec::new(),
                        })
                        .subscribers
                        .push(tx);
                    rx
                });

            let _ = reply.send(result);
        }
        Command::Publish { topic, data, reply } => {
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .publish(IdentTopic::new(topic.as_str()), data)
                .map(|_| ())
                .map_err(|e| anyhow!("Failed to publish on {topic}: {e}"));

            let _ = reply.send(result);
        }
        Command::ListenAddrs { reply } => {
            let _ = reply.send(listen_addrs.to_vec());
        }
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<OverlayBehaviour>,
    topics: &mut HashMap<gossipsub::TopicHash, Topic>,
    listen_addrs: &mut Vec<Multiaddr>,
    local_peer_id: PeerId,
    event: SwarmEvent<OverlayBehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!(%address, "Listening on new address");
            listen_addrs.push(address);
        }
        SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => {
            // Strict validation mode guarantees a signed source.
            let Some(source) = message.source else {
                return;
            };
            if source == local_peer_id {
                return;
            }

            let Some(topic) = topics.get_mut(&message.topic) else {
                return;
            };

            topic.subscribers.retain(|tx| {
                match tx.try_send(TopicMessage {
                    source,
                    data: message.data.clone(),
                }) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(topic = %message.topic, "Subscriber lagging, dropping message");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
        SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            // Feed identified listen addresses into the DHT so the peer
            // becomes routable.
            for addr in info.listen_addrs {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
            }
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            tracing::debug!(%peer_id, "Connection established");
        }
        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
            tracing::debug!(%peer_id, ?cause, "Connection closed");
        }
        _ => {}
    }
}
