//! Cluster bus networking.
//!
//! A single owner task holds the [`ClusterState`]. Connection tasks feed it
//! [`BusEvent`]s over a channel; it calls into the core and carries out the
//! [`Action`]s that come back. Every link is a TCP stream split into a
//! reader task that decodes frames and a writer task fed by a channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use cinder_cluster::{Action, ClusterMessage, ClusterState, LinkId, NodeAddr, NodeName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-link outbound queue depth. A peer that falls this far behind loses
/// messages; gossip repeats itself, so that's fine.
const LINK_QUEUE: usize = 256;
const READ_BUF: usize = 16 * 1024;

#[derive(Debug)]
enum BusEvent {
    Accepted {
        link: LinkId,
        peer: SocketAddr,
        writer: mpsc::Sender<Bytes>,
    },
    Connected {
        node: NodeName,
        link: LinkId,
        writer: mpsc::Sender<Bytes>,
    },
    ConnectFailed {
        node: NodeName,
    },
    Message {
        link: LinkId,
        message: ClusterMessage,
    },
    Closed {
        link: LinkId,
    },
}

/// Startup requests applied once the bus is running.
#[derive(Debug, Default)]
pub struct Bootstrap {
    pub seeds: Vec<NodeAddr>,
    /// Replicate this master as soon as the handshake with it completes.
    pub replicate_of: Option<NodeName>,
}

struct Bus {
    state: ClusterState,
    writers: HashMap<LinkId, mpsc::Sender<Bytes>>,
    events: mpsc::Sender<BusEvent>,
    next_link: u64,
    replicate_of: Option<NodeName>,
}

/// Runs the bus until ctrl-c.
pub async fn run(state: ClusterState, listener: TcpListener, bootstrap: Bootstrap) {
    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let mut bus = Bus {
        state,
        writers: HashMap::new(),
        events: events_tx.clone(),
        next_link: 0,
        replicate_of: bootstrap.replicate_of,
    };

    for seed in bootstrap.seeds {
        match bus.state.meet(seed, Instant::now()) {
            Ok(_) => info!("meeting seed {}", seed),
            Err(e) => warn!("skipping seed {}: {}", seed, e),
        }
    }

    tokio::spawn(accept_loop(listener, events_tx));

    let mut tick = tokio::time::interval(bus.state.config().cron_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                let actions = bus.state.tick(now);
                bus.apply(actions);
                bus.try_replicate();
            }
            Some(event) = events_rx.recv() => {
                bus.handle_event(event);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<BusEvent>) {
    // inbound ids count down from the top, outbound ones up from zero
    let mut next = u64::MAX;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let link = LinkId(next);
                next -= 1;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay on {} failed: {}", peer, e);
                }
                let (reader, writer) = stream.into_split();
                let writer = spawn_writer(link, writer);
                if events
                    .send(BusEvent::Accepted { link, peer, writer })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(read_link(link, reader, events.clone()));
            }
            Err(e) => warn!("bus accept error: {}", e),
        }
    }
}

async fn connect(
    node: NodeName,
    addr: SocketAddr,
    link: LinkId,
    timeout: std::time::Duration,
    events: mpsc::Sender<BusEvent>,
) {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("connect to {} failed: {}", addr, e);
            let _ = events.send(BusEvent::ConnectFailed { node }).await;
            return;
        }
        Err(_) => {
            debug!("connect to {} timed out", addr);
            let _ = events.send(BusEvent::ConnectFailed { node }).await;
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let writer = spawn_writer(link, writer);
    if events
        .send(BusEvent::Connected { node, link, writer })
        .await
        .is_ok()
    {
        read_link(link, reader, events).await;
    }
}

fn spawn_writer<W>(link: LinkId, mut writer: W) -> mpsc::Sender<Bytes>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(LINK_QUEUE);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!("{} write error: {}", link, e);
                return;
            }
        }
        let _ = writer.shutdown().await;
    });
    tx
}

/// Decodes frames from `reader` until EOF or a malformed frame, then
/// reports the link closed.
async fn read_link<R>(link: LinkId, mut reader: R, events: mpsc::Sender<BusEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUF);
    'read: loop {
        loop {
            match ClusterMessage::decode(&buf) {
                Ok(Some((message, used))) => {
                    buf.advance(used);
                    if events
                        .send(BusEvent::Message { link, message })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: {}, closing link", link, e);
                    break 'read;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("{} read error: {}", link, e);
                break;
            }
        }
    }
    let _ = events.send(BusEvent::Closed { link }).await;
}

impl Bus {
    fn handle_event(&mut self, event: BusEvent) {
        let now = Instant::now();
        match event {
            BusEvent::Accepted { link, peer, writer } => {
                self.writers.insert(link, writer);
                self.state.link_accepted(link, peer, now);
            }
            BusEvent::Connected { node, link, writer } => {
                self.writers.insert(link, writer);
                let actions = self.state.link_connected(&node, link, now);
                self.apply(actions);
            }
            BusEvent::ConnectFailed { node } => self.state.link_failed(&node),
            BusEvent::Message { link, message } => {
                let actions = self.state.handle_message(link, message, now);
                self.apply(actions);
            }
            BusEvent::Closed { link } => {
                self.writers.remove(&link);
                self.state.link_closed(link);
            }
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { node, addr } => {
                    self.next_link += 1;
                    let link = LinkId(self.next_link);
                    let timeout = self.state.config().node_timeout();
                    tokio::spawn(connect(node, addr, link, timeout, self.events.clone()));
                }
                Action::Send { link, message } => {
                    let Some(writer) = self.writers.get(&link) else {
                        continue;
                    };
                    if writer.try_send(message.encode()).is_err() {
                        debug!("{} is backed up, dropping {}", link, message.message_type());
                    }
                }
                Action::CloseLink { link } => {
                    // dropping the sender shuts the write half down
                    self.writers.remove(&link);
                }
                Action::PauseWrites { until } => {
                    let ms = until.saturating_duration_since(Instant::now()).as_millis();
                    info!("client writes paused for up to {}ms", ms);
                }
                Action::ResumeWrites => info!("client writes resumed"),
                Action::Replicate { primary: Some(addr) } => {
                    info!("replicating from {}", addr);
                }
                Action::Replicate { primary: None } => info!("replication stopped"),
                Action::DropSlotKeys { slot } => info!("dropping keys of slot {}", slot),
                Action::Publish { channel, .. } => {
                    debug!("publish on {:?}", String::from_utf8_lossy(&channel));
                }
                Action::Module {
                    sender, module_id, ..
                } => {
                    debug!("module {} message from {}", module_id, sender.short());
                }
            }
        }
    }

    /// Applies a pending `replicate_of` once its master is known.
    fn try_replicate(&mut self) {
        let Some(primary) = self.replicate_of else {
            return;
        };
        let ready = self
            .state
            .node(&primary)
            .is_some_and(|n| !n.in_handshake() && n.is_primary());
        if !ready {
            return;
        }
        match self.state.replicate(&primary) {
            Ok(actions) => {
                self.replicate_of = None;
                self.apply(actions);
            }
            Err(e) => {
                warn!("can't replicate {}: {}", primary.short(), e);
                self.replicate_of = None;
            }
        }
    }
}
