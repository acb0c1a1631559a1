//! Bounded routing table with time-driven entry aging.

use super::proto::{NodeData, UnreachableNode};
use super::seqnum::SeqNum;
use super::{
    Addr, MetricType, ACTIVE_INTERVAL_MS, MAX_ROUTING_ENTRIES, MAX_SEQNUM_LIFETIME_MS,
    MAX_UNREACHABLE_NODES, VALIDITY_MS,
};

/// Lifecycle of a route. `Timed` is exempt from the inactivity invalidation
/// and exists for routes installed by external means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Active,
    Idle,
    Invalid,
    Timed,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub dest: Addr,
    pub seqnum: SeqNum,
    pub next_hop: Addr,
    /// Milliseconds, last moment the route carried or received traffic.
    pub last_used: u64,
    /// Milliseconds, the moment the route stops being trustworthy.
    pub expiration: u64,
    pub metric_type: MetricType,
    pub metric: u8,
    pub state: RouteState,
}

impl RouteEntry {
    /// Overwrite the mutable part of the entry and grant it a fresh
    /// validity window.
    pub fn refresh(&mut self, seqnum: SeqNum, next_hop: Addr, metric: u8, state: RouteState, now: u64) {
        self.seqnum = seqnum;
        self.next_hop = next_hop;
        self.last_used = now;
        self.expiration = now + VALIDITY_MS;
        self.metric = metric;
        self.state = state;
    }
}

/// Bounded table, linearly scanned, at most one entry per
/// (destination, metric type).
pub struct RoutingTable {
    entries: Vec<Option<RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { entries: vec![None; MAX_ROUTING_ENTRIES] }
    }

    /// Install a route unless one already exists for the destination and
    /// metric type; in that case the call is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        dest: Addr,
        seqnum: SeqNum,
        next_hop: Addr,
        metric_type: MetricType,
        metric: u8,
        state: RouteState,
        now: u64,
    ) {
        if self.get(&dest, metric_type, now).is_some() {
            return;
        }

        let Some(slot) = self.entries.iter_mut().find(|s| s.is_none()) else {
            log::warn!("routing table full, cannot add route to {dest}");
            return;
        };

        *slot = Some(RouteEntry {
            dest,
            seqnum,
            next_hop,
            last_used: now,
            expiration: now + VALIDITY_MS,
            metric_type,
            metric,
            state,
        });
        log::debug!("route added: {dest} via {next_hop}, metric {metric}");
    }

    /// Find the route for `(dest, metric_type)`. Ages every slot it visits
    /// first, so the returned entry reflects the current time.
    pub fn get(&mut self, dest: &Addr, metric_type: MetricType, now: u64) -> Option<&mut RouteEntry> {
        let mut found = None;
        for index in 0..self.entries.len() {
            self.age_slot(index, now);
            if let Some(entry) = &self.entries[index] {
                if entry.dest == *dest && entry.metric_type == metric_type {
                    found = Some(index);
                    break;
                }
            }
        }
        self.entries[found?].as_mut()
    }

    pub fn delete(&mut self, dest: &Addr, metric_type: MetricType, now: u64) {
        for index in 0..self.entries.len() {
            self.age_slot(index, now);
            if let Some(entry) = &self.entries[index] {
                if entry.dest == *dest && entry.metric_type == metric_type {
                    self.entries[index] = None;
                    return;
                }
            }
        }
    }

    pub fn next_hop(&mut self, dest: &Addr, metric_type: MetricType, now: u64) -> Option<Addr> {
        self.get(dest, metric_type, now).map(|entry| entry.next_hop)
    }

    /// Invalidate every route whose next hop is `hop`. Routes that were
    /// Active are appended to `out` (up to the RERR capacity) so the caller
    /// can announce them; Idle and Invalid routes are invalidated silently.
    pub fn break_over(&mut self, hop: &Addr, out: &mut Vec<UnreachableNode>, now: u64) -> usize {
        let before = out.len();

        for index in 0..self.entries.len() {
            self.age_slot(index, now);
            if let Some(entry) = self.entries[index].as_mut() {
                if entry.next_hop != *hop {
                    continue;
                }
                if entry.state == RouteState::Active && out.len() < MAX_UNREACHABLE_NODES {
                    out.push(UnreachableNode { addr: entry.dest, seqnum: entry.seqnum });
                }
                entry.state = RouteState::Invalid;
            }
        }

        out.len() - before
    }

    /// Age one slot with `now` sampled once by the caller:
    /// Active -> Idle after an unused ACTIVE_INTERVAL, Idle -> Invalid past
    /// the expiration, anything unused longer than the validity window
    /// -> Invalid (unless Timed), and expunged entirely once the sequence
    /// number information is too old to trust.
    fn age_slot(&mut self, index: usize, now: u64) {
        let Some(entry) = self.entries[index].as_mut() else {
            return;
        };

        // never-initialized slots and a node younger than one interval are
        // left alone
        if entry.expiration == 0 || now < ACTIVE_INTERVAL_MS {
            return;
        }

        if entry.state == RouteState::Active && now - ACTIVE_INTERVAL_MS > entry.last_used {
            log::debug!("route to {} is now Idle", entry.dest);
            entry.state = RouteState::Idle;
            entry.last_used = now;
        }

        if entry.state == RouteState::Idle && now > entry.expiration {
            log::debug!("route to {} is now Invalid", entry.dest);
            entry.state = RouteState::Invalid;
            entry.last_used = now;
        }

        if now - entry.last_used > VALIDITY_MS && entry.state != RouteState::Timed {
            entry.state = RouteState::Invalid;
        }

        if now - entry.last_used >= MAX_SEQNUM_LIFETIME_MS {
            log::debug!("route to {} expunged", entry.dest);
            self.entries[index] = None;
        }
    }

    #[cfg(test)]
    fn occupied(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide whether incoming node data improves on an existing route:
/// a strictly newer SeqNum always does; an equal SeqNum does with a strictly
/// smaller metric, or when it repairs an Invalid route without increasing
/// the metric (loop freedom).
pub fn offers_improvement(entry: &RouteEntry, incoming: &NodeData) -> bool {
    let loop_free = incoming.metric <= entry.metric;

    match incoming.seqnum.cmp_to(entry.seqnum) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => {
            incoming.metric < entry.metric || (entry.state == RouteState::Invalid && loop_free)
        }
        std::cmp::Ordering::Less => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    const MT: MetricType = MetricType::HopCount;

    fn addr(tail: u16) -> Addr {
        Addr::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, tail), 64)
    }

    fn seq(n: u16) -> SeqNum {
        SeqNum::new(n)
    }

    // a timestamp safely past the boot grace period
    const T0: u64 = 10_000;

    #[test]
    fn add_then_get() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Idle, T0);

        let entry = table.get(&addr(1), MT, T0).expect("entry exists");
        assert_eq!(entry.dest, addr(1));
        assert_eq!(entry.seqnum, seq(1));
        assert_eq!(entry.next_hop, addr(2));
        assert_eq!(entry.metric, 3);
        assert_eq!(entry.state, RouteState::Idle);
        assert_eq!(entry.expiration, T0 + VALIDITY_MS);
    }

    #[test]
    fn two_entries_are_kept_apart() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Idle, T0);
        table.add(addr(2), seq(2), addr(2), MT, 4, RouteState::Active, T0);

        let e1 = *table.get(&addr(1), MT, T0).unwrap();
        let e2 = *table.get(&addr(2), MT, T0).unwrap();
        assert_eq!(e1.metric, 3);
        assert_eq!(e2.metric, 4);
        assert_eq!(e2.state, RouteState::Active);
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Active, T0);
        table.add(addr(1), seq(9), addr(9), MT, 9, RouteState::Active, T0);

        assert_eq!(table.occupied(), 1);
        let entry = table.get(&addr(1), MT, T0).unwrap();
        assert_eq!(entry.seqnum, seq(1));
        assert_eq!(entry.next_hop, addr(2));
    }

    #[test]
    fn next_hop_lookup() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Idle, T0);
        assert_eq!(table.next_hop(&addr(1), MT, T0), Some(addr(2)));
        assert_eq!(table.next_hop(&addr(9), MT, T0), None);
    }

    #[test]
    fn refresh_overwrites_and_extends() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Idle, T0);

        let entry = table.get(&addr(1), MT, T0).unwrap();
        entry.refresh(seq(2), addr(1), 4, RouteState::Active, T0 + 500);

        let entry = table.get(&addr(1), MT, T0 + 500).unwrap();
        assert_eq!(entry.seqnum, seq(2));
        assert_eq!(entry.next_hop, addr(1));
        assert_eq!(entry.metric, 4);
        assert_eq!(entry.state, RouteState::Active);
        assert_eq!(entry.expiration, T0 + 500 + VALIDITY_MS);
    }

    #[test]
    fn delete_removes_the_entry() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Idle, T0);
        table.delete(&addr(1), MT, T0);
        assert!(table.get(&addr(1), MT, T0).is_none());
    }

    #[test]
    fn break_over_reports_active_routes_only() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Idle, T0);
        table.add(addr(2), seq(2), addr(2), MT, 4, RouteState::Active, T0);

        let mut unreachable = Vec::new();
        let reported = table.break_over(&addr(2), &mut unreachable, T0);

        // the Idle route is invalidated but not reported
        assert_eq!(reported, 1);
        assert_eq!(unreachable[0].addr, addr(2));
        assert_eq!(unreachable[0].seqnum, seq(2));
        assert_eq!(table.get(&addr(1), MT, T0).unwrap().state, RouteState::Invalid);
        assert_eq!(table.get(&addr(2), MT, T0).unwrap().state, RouteState::Invalid);
    }

    #[test]
    fn uniqueness_holds_under_add_sequences() {
        let mut table = RoutingTable::new();
        for round in 0..10u16 {
            for tail in 0..20u16 {
                table.add(addr(tail), seq(round + 1), addr(99), MT, 1, RouteState::Active, T0);
            }
        }
        assert_eq!(table.occupied(), 20);
    }

    #[test]
    fn aging_walks_active_idle_invalid_expunged() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 1, RouteState::Active, T0);

        // untouched for just over one active interval
        let t1 = T0 + ACTIVE_INTERVAL_MS + 1_000;
        assert_eq!(table.get(&addr(1), MT, t1).unwrap().state, RouteState::Idle);

        // past the expiration time
        let t2 = T0 + VALIDITY_MS + 1_000;
        assert_eq!(table.get(&addr(1), MT, t2).unwrap().state, RouteState::Invalid);

        // past the seqnum lifetime (measured from the Invalid transition)
        let t3 = t2 + MAX_SEQNUM_LIFETIME_MS;
        assert!(table.get(&addr(1), MT, t3).is_none());
    }

    #[test]
    fn aging_never_regresses_without_update() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 1, RouteState::Active, T0);

        let t1 = T0 + ACTIVE_INTERVAL_MS + 1_000;
        assert_eq!(table.get(&addr(1), MT, t1).unwrap().state, RouteState::Idle);

        // a later lookup before expiration keeps it Idle, not Active
        assert_eq!(table.get(&addr(1), MT, t1 + 1_000).unwrap().state, RouteState::Idle);
    }

    #[test]
    fn boot_grace_skips_aging() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 1, RouteState::Active, 0);
        // now < ACTIVE_INTERVAL: no transition even though last_used is 0
        assert_eq!(
            table.get(&addr(1), MT, ACTIVE_INTERVAL_MS - 1).unwrap().state,
            RouteState::Active
        );
    }

    #[test]
    fn improvement_on_newer_seqnum() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Idle, T0);
        let entry = table.get(&addr(1), MT, T0).unwrap();

        let incoming = NodeData { addr: addr(1), seqnum: seq(2), metric: 3 };
        assert!(offers_improvement(entry, &incoming));
    }

    #[test]
    fn improvement_on_smaller_metric() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 4, RouteState::Idle, T0);
        let entry = table.get(&addr(1), MT, T0).unwrap();

        let incoming = NodeData { addr: addr(1), seqnum: seq(1), metric: 3 };
        assert!(offers_improvement(entry, &incoming));
    }

    #[test]
    fn no_improvement_on_older_seqnum() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(2), addr(2), MT, 3, RouteState::Idle, T0);
        let entry = table.get(&addr(1), MT, T0).unwrap();

        let incoming = NodeData { addr: addr(1), seqnum: seq(1), metric: 3 };
        assert!(!offers_improvement(entry, &incoming));
    }

    #[test]
    fn equal_seqnum_repairs_invalid_routes_only_loop_free() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Invalid, T0);
        let entry = table.get(&addr(1), MT, T0).unwrap();

        // same metric repairs
        assert!(offers_improvement(entry, &NodeData { addr: addr(1), seqnum: seq(1), metric: 3 }));
        // a larger metric would risk a loop
        assert!(!offers_improvement(entry, &NodeData { addr: addr(1), seqnum: seq(1), metric: 4 }));
    }

    #[test]
    fn equal_seqnum_equal_metric_on_valid_route_is_no_improvement() {
        let mut table = RoutingTable::new();
        table.add(addr(1), seq(1), addr(2), MT, 3, RouteState::Active, T0);
        let entry = table.get(&addr(1), MT, T0).unwrap();

        assert!(!offers_improvement(entry, &NodeData { addr: addr(1), seqnum: seq(1), metric: 3 }));
    }
}
