//! The router task and its link layer.
//!
//! One task owns every mutable piece of protocol state; datagrams and
//! forwarding-plane signals are serialized through the inbox channel, so no
//! lock is needed anywhere.

use std::collections::HashSet;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use super::proto::{self, Message, NodeData, PacketData, RerrMessage, RouteMessage, UnreachableNode};
use super::routes::{offers_improvement, RouteState, RoutingTable};
use super::seqnum::SeqNumStore;
use super::tables::{ClientTable, RreqLog};
use super::{Addr, MeshConfig, MetricType, MAX_HOPCOUNT, MAX_UNREACHABLE_NODES};
use crate::clock::{Clock, SystemClock};

/// What the router can be fed through its inbox.
#[derive(Debug)]
pub enum Event {
    /// A raw datagram from the socket pump.
    Datagram { data: Bytes, sender: Addr },
    /// The forwarding plane failed to deliver to `dest`. `done` is answered
    /// immediately so the forwarder stops blocking, then a route discovery
    /// starts.
    UnreachableDestination { dest: Addr, done: oneshot::Sender<()> },
    Shutdown,
}

/// Outbound packet capability plus the lower-layer neighbor cache.
pub trait LinkLayer {
    /// Hand one frame to the network. Failures are the implementation's to
    /// log; the protocol never retries.
    fn send_to(&mut self, dst: &Addr, frame: &[u8]);

    /// Whether a bidirectional lower-layer link to `addr` is known. Routes
    /// are only installed towards senders that pass this check.
    fn neighbor_known(&self, addr: &Addr) -> bool;
}

/// `LinkLayer` over a UDP socket with an explicitly maintained neighbor set.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    port: u16,
    neighbors: HashSet<Ipv6Addr>,
}

impl UdpLink {
    pub async fn bind(cfg: &MeshConfig) -> anyhow::Result<Self> {
        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, cfg.port, 0, 0);
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.join_multicast_v6(&cfg.multicast_addr, 0)?;
        log::info!("listening on port {}", cfg.port);

        Ok(Self {
            socket: Arc::new(socket),
            port: cfg.port,
            neighbors: HashSet::new(),
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn add_neighbor(&mut self, ip: Ipv6Addr) {
        self.neighbors.insert(ip);
    }

    pub fn remove_neighbor(&mut self, ip: &Ipv6Addr) {
        self.neighbors.remove(ip);
    }
}

impl LinkLayer for UdpLink {
    fn send_to(&mut self, dst: &Addr, frame: &[u8]) {
        let target = SocketAddrV6::new(dst.ip(), self.port, 0, 0);
        match self.socket.try_send_to(frame, target.into()) {
            Ok(sent) => log::debug!("{sent} bytes sent to {dst}"),
            Err(e) => log::error!("failed to send {} bytes to {dst}: {e}", frame.len()),
        }
    }

    fn neighbor_known(&self, addr: &Addr) -> bool {
        self.neighbors.contains(&addr.ip())
    }
}

/// Feed received datagrams into the router's inbox until the inbox closes.
pub async fn pump_datagrams(socket: Arc<UdpSocket>, prefix_len: u8, inbox: mpsc::Sender<Event>) {
    let mut buf = [0u8; 1500];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, SocketAddr::V6(from))) => {
                let sender = Addr::new(*from.ip(), prefix_len);
                let data = Bytes::copy_from_slice(&buf[..len]);
                if inbox.send(Event::Datagram { data, sender }).await.is_err() {
                    break;
                }
            }
            Ok((_, from)) => {
                log::debug!("ignoring datagram from non-IPv6 source {from}");
            }
            Err(e) => {
                log::error!("recv failed: {e}");
            }
        }
    }
}

/// The AODVv2 router. Owns the sequence number store, the client table, the
/// route-request log and the routing table.
pub struct Node<L, C>
where
    L: LinkLayer,
    C: Clock,
{
    local: Addr,
    multicast: Addr,
    metric_type: MetricType,
    link: L,
    clock: C,
    seqnums: SeqNumStore,
    clients: ClientTable,
    rreq_log: RreqLog,
    routes: RoutingTable,
}

impl<L, C> Node<L, C>
where
    L: LinkLayer,
    C: Clock,
{
    pub fn new(cfg: &MeshConfig, link: L, clock: C) -> Self {
        let mut clients = ClientTable::new();
        // every node is its own client
        clients.add(cfg.local());

        Self {
            local: cfg.local(),
            multicast: cfg.multicast(),
            metric_type: MetricType::HopCount,
            link,
            clock,
            seqnums: SeqNumStore::new(),
            clients,
            rreq_log: RreqLog::new(),
            routes: RoutingTable::new(),
        }
    }

    pub fn local(&self) -> Addr {
        self.local
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn routes_mut(&mut self) -> &mut RoutingTable {
        &mut self.routes
    }

    pub fn clients_mut(&mut self) -> &mut ClientTable {
        &mut self.clients
    }

    /// Drain the inbox until it closes or a shutdown arrives. Returns the
    /// node so callers can inspect or restart it.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Event>) -> Self {
        log::info!("aodvv2 node {} up", self.local);

        while let Some(event) = inbox.recv().await {
            match event {
                Event::Datagram { data, sender } => {
                    // the socket hands us our own multicasts back
                    if sender == self.local {
                        log::debug!("received our own packet, dropping it");
                        continue;
                    }
                    self.handle_datagram(&data, sender);
                }
                Event::UnreachableDestination { dest, done } => {
                    // unblock the forwarding plane before anything else
                    if done.send(()).is_err() {
                        log::warn!("forwarding plane went away before the ack");
                    }
                    self.handle_unreachable(dest);
                }
                Event::Shutdown => break,
            }
        }

        log::info!("aodvv2 node {} down", self.local);
        self
    }

    /// Start a route discovery towards `dest`.
    pub fn handle_unreachable(&mut self, dest: Addr) {
        let now = self.clock.now_ms();
        let seqnum = self.seqnums.next();

        let pd = PacketData {
            hoplimit: MAX_HOPCOUNT,
            metric_type: self.metric_type,
            orig: NodeData { addr: self.local, seqnum, metric: 0 },
            targ: NodeData::new(dest),
            sender: self.local,
            timestamp: now,
        };

        // Seed our own log entry so echoes of this flood are suppressed
        self.rreq_log.observe(&pd, now);

        log::info!("route discovery towards {dest}, seqnum {}", seqnum.get());
        let frame = proto::encode_rreq(&pd);
        let multicast = self.multicast;
        self.link.send_to(&multicast, &frame);
    }

    /// Parse and dispatch one datagram. Anything malformed is dropped
    /// without a reply.
    pub fn handle_datagram(&mut self, data: &[u8], sender: Addr) {
        let now = self.clock.now_ms();
        match proto::parse(data) {
            Some(Message::Rreq(msg)) => self.handle_rreq(msg, sender, now),
            Some(Message::Rrep(msg)) => self.handle_rrep(msg, sender, now),
            Some(Message::Rerr(msg)) => self.handle_rerr(msg, sender, now),
            None => {
                log::debug!("dropping malformed {}-byte datagram from {sender}", data.len());
            }
        }
    }

    /// Next-hop query for the forwarding plane. Using a route touches it; an
    /// Idle route becomes Active again. A known-but-Invalid route produces a
    /// RERR instead of a next hop.
    pub fn next_hop_for(&mut self, dest: &Addr) -> Option<Addr> {
        if *dest == self.local {
            return Some(self.local);
        }

        let now = self.clock.now_ms();
        let metric_type = self.metric_type;

        let mut broken: Option<UnreachableNode> = None;
        let mut next_hop = None;

        if let Some(entry) = self.routes.get(dest, metric_type, now) {
            if entry.state == RouteState::Invalid {
                broken = Some(UnreachableNode { addr: entry.dest, seqnum: entry.seqnum });
            } else {
                entry.last_used = now;
                if entry.state == RouteState::Idle {
                    entry.state = RouteState::Active;
                }
                next_hop = Some(entry.next_hop);
            }
        }

        if let Some(node) = broken {
            log::debug!("route to {dest} is Invalid, announcing");
            let frame = proto::encode_rerr(&[node], MAX_HOPCOUNT);
            let multicast = self.multicast;
            self.link.send_to(&multicast, &frame);
            return None;
        }

        next_hop
    }

    fn handle_rreq(&mut self, msg: RouteMessage, sender: Addr, now: u64) {
        let metric_type = msg.metric_type;
        let link_cost = metric_type.link_cost();

        if metric_type.max_metric() - link_cost <= msg.orig.metric {
            log::debug!("metric limit reached, dropping RREQ");
            return;
        }

        let mut pd = PacketData {
            hoplimit: msg.hoplimit,
            metric_type,
            orig: msg.orig,
            targ: msg.targ,
            sender,
            timestamp: now,
        };

        // Redundant copies of a flood carry nothing new
        if self.rreq_log.observe(&pd, now) {
            log::debug!("redundant RREQ, dropping");
            return;
        }

        pd.orig.metric = metric_type.update(pd.orig.metric);

        let mut have_route = false;
        if let Some(entry) = self.routes.get(&pd.orig.addr, metric_type, now) {
            if !offers_improvement(entry, &pd.orig) {
                log::debug!("RREQ offers no improvement over known route, dropping");
                return;
            }
            entry.refresh(pd.orig.seqnum, sender, pd.orig.metric, RouteState::Active, now);
            have_route = true;
        }
        if !have_route {
            // Without a bidirectional link the reverse route would be a trap
            if !self.link.neighbor_known(&sender) {
                log::debug!("no bidirectional link to {sender}, dropping RREQ");
                return;
            }
            self.routes.add(
                pd.orig.addr,
                pd.orig.seqnum,
                sender,
                metric_type,
                pd.orig.metric,
                RouteState::Active,
                now,
            );
        }

        if self.clients.contains(&pd.targ.addr) {
            log::debug!("RREQ targets one of our clients, replying");
            pd.targ.metric = 0;
            pd.targ.seqnum = self.seqnums.next();
            let frame = proto::encode_rrep(&pd);
            self.link.send_to(&sender, &frame);
        } else {
            log::debug!("not the RREQ target, forwarding");
            let frame = proto::encode_rreq(&pd);
            let multicast = self.multicast;
            self.link.send_to(&multicast, &frame);
        }
    }

    fn handle_rrep(&mut self, msg: RouteMessage, sender: Addr, now: u64) {
        let metric_type = msg.metric_type;
        let link_cost = metric_type.link_cost();

        if metric_type.max_metric() - link_cost <= msg.targ.metric {
            log::debug!("metric limit reached, dropping RREP");
            return;
        }

        let mut pd = PacketData {
            hoplimit: msg.hoplimit,
            metric_type,
            orig: msg.orig,
            targ: msg.targ,
            sender,
            timestamp: now,
        };

        pd.targ.metric = metric_type.update(pd.targ.metric);

        let mut have_route = false;
        if let Some(entry) = self.routes.get(&pd.targ.addr, metric_type, now) {
            if !offers_improvement(entry, &pd.targ) {
                log::debug!("RREP offers no improvement over known route, dropping");
                return;
            }
            entry.refresh(pd.targ.seqnum, sender, pd.targ.metric, RouteState::Active, now);
            have_route = true;
        }
        if !have_route {
            if !self.link.neighbor_known(&sender) {
                log::debug!("no bidirectional link to {sender}, dropping RREP");
                return;
            }
            self.routes.add(
                pd.targ.addr,
                pd.targ.seqnum,
                sender,
                metric_type,
                pd.targ.metric,
                RouteState::Active,
                now,
            );
        }

        if self.clients.contains(&pd.orig.addr) {
            log::info!(
                "route discovery towards {} complete, metric {}",
                pd.targ.addr,
                pd.targ.metric
            );
            return;
        }

        // Not ours: pass it on towards the originator
        match self.routes.next_hop(&pd.orig.addr, metric_type, now) {
            Some(next_hop) => {
                let frame = proto::encode_rrep(&pd);
                self.link.send_to(&next_hop, &frame);
            }
            None => log::debug!("no route back towards {}, dropping RREP", pd.orig.addr),
        }
    }

    fn handle_rerr(&mut self, msg: RerrMessage, sender: Addr, now: u64) {
        let metric_type = self.metric_type;
        let mut newly_broken: Vec<UnreachableNode> = Vec::new();

        for (addr, seqnum) in msg.nodes.iter().take(MAX_UNREACHABLE_NODES) {
            if let Some(entry) = self.routes.get(addr, metric_type, now) {
                let seqnum_matches = seqnum.map(|s| s == entry.seqnum).unwrap_or(true);
                if entry.next_hop == sender && seqnum_matches && entry.state != RouteState::Invalid
                {
                    entry.state = RouteState::Invalid;
                    newly_broken.push(UnreachableNode { addr: entry.dest, seqnum: entry.seqnum });
                }
            }
        }

        if newly_broken.is_empty() {
            log::debug!("RERR mentions no affected route, dropping");
            return;
        }

        log::debug!("forwarding RERR for {} destinations", newly_broken.len());
        let frame = proto::encode_rerr(&newly_broken, MAX_HOPCOUNT);
        let multicast = self.multicast;
        self.link.send_to(&multicast, &frame);
    }
}

/// Bind the socket, start the datagram pump and the router task. The
/// returned sender feeds forwarding-plane events; dropping it (after a
/// `Shutdown`) ends both tasks.
pub async fn serve(
    cfg: MeshConfig,
) -> anyhow::Result<(mpsc::Sender<Event>, tokio::task::JoinHandle<Node<UdpLink, SystemClock>>)> {
    let link = UdpLink::bind(&cfg).await?;
    let socket = link.socket();
    let node = Node::new(&cfg, link, SystemClock::new());

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(pump_datagrams(socket, cfg.prefix_len, tx.clone()));
    let handle = tokio::spawn(node.run(rx));

    Ok((tx, handle))
}
