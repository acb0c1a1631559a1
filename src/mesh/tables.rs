//! Client table and route-request log.

use super::proto::PacketData;
use super::seqnum::SeqNum;
use super::{Addr, MetricType, MAX_CLIENTS, MAX_IDLETIME_MS, RREQ_BUF};

/// The local addresses this router originates route replies for. Every node
/// is at least its own client.
#[derive(Debug)]
pub struct ClientTable {
    slots: [Option<Addr>; MAX_CLIENTS],
}

impl ClientTable {
    pub fn new() -> Self {
        Self { slots: [None; MAX_CLIENTS] }
    }

    pub fn add(&mut self, addr: Addr) {
        if self.contains(&addr) {
            return;
        }
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(addr);
                log::debug!("client table: added {addr}");
                return;
            }
        }
        log::warn!("client table full, cannot add {addr}");
    }

    pub fn contains(&self, addr: &Addr) -> bool {
        self.slots.iter().any(|slot| slot.as_ref() == Some(addr))
    }

    pub fn remove(&mut self, addr: &Addr) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref() == Some(addr) {
                *slot = None;
                return;
            }
        }
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct RreqLogEntry {
    orig: Addr,
    targ: Addr,
    metric_type: MetricType,
    metric: u8,
    seqnum: SeqNum,
    received_at: u64,
}

/// Log of recently seen route requests, keyed by (orig, targ, metric type).
/// Used to suppress redundant copies of a flooded RREQ; entries age out
/// after `MAX_IDLETIME_MS`.
#[derive(Debug)]
pub struct RreqLog {
    entries: Vec<Option<RreqLogEntry>>,
}

impl RreqLog {
    pub fn new() -> Self {
        Self { entries: vec![None; RREQ_BUF] }
    }

    /// Record `packet` and say whether it was redundant.
    ///
    /// A fresh (orig, targ, metric-type) is entered and reported as new.
    /// Anything matching an existing entry is reported redundant, but still
    /// refreshes the entry: a newer SeqNum or a better metric is taken over
    /// and the timestamp is touched either way. An originating node calls
    /// this on its own RREQ solely to seed the entry, so later echoes from
    /// the network are suppressed.
    pub fn observe(&mut self, packet: &PacketData, now: u64) -> bool {
        self.expunge_stale(now);

        let index = self.entries.iter().position(|slot| {
            slot.as_ref().is_some_and(|e| {
                e.orig == packet.orig.addr
                    && e.targ == packet.targ.addr
                    && e.metric_type == packet.metric_type
            })
        });

        let Some(index) = index else {
            self.insert(packet, now);
            return false;
        };

        if let Some(entry) = self.entries[index].as_mut() {
            match packet.orig.seqnum.cmp_to(entry.seqnum) {
                std::cmp::Ordering::Greater => {
                    entry.seqnum = packet.orig.seqnum;
                    entry.metric = packet.orig.metric;
                }
                std::cmp::Ordering::Equal => {
                    if packet.orig.metric < entry.metric {
                        entry.metric = packet.orig.metric;
                    }
                }
                std::cmp::Ordering::Less => {}
            }
            entry.received_at = now;
        }
        true
    }

    fn insert(&mut self, packet: &PacketData, now: u64) {
        let entry = RreqLogEntry {
            orig: packet.orig.addr,
            targ: packet.targ.addr,
            metric_type: packet.metric_type,
            metric: packet.orig.metric,
            seqnum: packet.orig.seqnum,
            received_at: now,
        };

        if let Some(slot) = self.entries.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
        } else {
            log::warn!("rreq log full, dropping entry for {}", packet.orig.addr);
        }
    }

    fn expunge_stale(&mut self, now: u64) {
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                if now.saturating_sub(entry.received_at) > MAX_IDLETIME_MS {
                    *slot = None;
                }
            }
        }
    }
}

impl Default for RreqLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::proto::NodeData;
    use crate::mesh::MAX_HOPCOUNT;
    use std::net::Ipv6Addr;

    fn addr(tail: u16) -> Addr {
        Addr::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, tail), 64)
    }

    fn packet(orig: u16, targ: u16, seqnum: u16, metric: u8) -> PacketData {
        PacketData {
            hoplimit: MAX_HOPCOUNT,
            metric_type: MetricType::HopCount,
            orig: NodeData { addr: addr(orig), seqnum: SeqNum::new(seqnum), metric },
            targ: NodeData::new(addr(targ)),
            sender: addr(orig),
            timestamp: 0,
        }
    }

    #[test]
    fn client_table_add_contains_remove() {
        let mut clients = ClientTable::new();
        let me = addr(1);

        assert!(!clients.contains(&me));
        clients.add(me);
        assert!(clients.contains(&me));
        // duplicate add is a no-op
        clients.add(me);

        clients.remove(&me);
        assert!(!clients.contains(&me));
    }

    #[test]
    fn observe_is_false_then_true() {
        let mut rreqs = RreqLog::new();
        let p = packet(1, 2, 10, 3);

        assert!(!rreqs.observe(&p, 1_000));
        assert!(rreqs.observe(&p, 2_000));
    }

    #[test]
    fn newer_seqnum_is_still_reported_redundant_but_taken_over() {
        let mut rreqs = RreqLog::new();
        assert!(!rreqs.observe(&packet(1, 2, 10, 3), 1_000));

        // same key, newer seqnum: the entry is refreshed yet the packet is
        // reported redundant, matching the original protocol engine
        assert!(rreqs.observe(&packet(1, 2, 11, 5), 2_000));

        // an older seqnum than the refreshed one stays redundant
        assert!(rreqs.observe(&packet(1, 2, 10, 1), 3_000));
    }

    #[test]
    fn distinct_keys_do_not_collide() {
        let mut rreqs = RreqLog::new();
        assert!(!rreqs.observe(&packet(1, 2, 10, 3), 0));
        assert!(!rreqs.observe(&packet(1, 3, 10, 3), 0));
        assert!(!rreqs.observe(&packet(2, 2, 10, 3), 0));
    }

    #[test]
    fn entries_age_out_after_max_idletime() {
        let mut rreqs = RreqLog::new();
        assert!(!rreqs.observe(&packet(1, 2, 10, 3), 0));

        // not yet stale
        assert!(rreqs.observe(&packet(1, 2, 10, 3), MAX_IDLETIME_MS));

        // the refresh above moved received_at; jump past the window
        assert!(!rreqs.observe(&packet(1, 2, 10, 3), 2 * MAX_IDLETIME_MS + 1_000));
    }
}
