//! RREQ / RREP / RERR wire format.
//!
//! Messages are RFC 5444-shaped: a type byte, the mandatory hop limit, then
//! one address block whose entries each carry their own TLV block. All
//! protocol state lives in address TLVs; no message TLVs are used.
//!
//! ```text
//! [ msg-type | hoplimit | addr-count |
//!   ( addr[16] | prefix-len | tlv-count |
//!     ( tlv-type | type-ext | len | value... )* )* ]
//! ```
//!
//! Parsing is strict the way the reader side of the protocol demands:
//! anything malformed, truncated or missing a mandatory TLV yields `None`
//! and the caller drops the datagram silently.

use super::seqnum::SeqNum;
use super::{Addr, MetricType, MAX_HOPCOUNT};

pub const MSG_RREQ: u8 = 10;
pub const MSG_RREP: u8 = 11;
pub const MSG_RERR: u8 = 12;

const TLV_ORIG_SEQNUM: u8 = 0;
const TLV_TARG_SEQNUM: u8 = 1;
const TLV_UNREACHABLE_NODE_SEQNUM: u8 = 2;
const TLV_METRIC: u8 = 3;

/// Per-node data carried by a route message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeData {
    pub addr: Addr,
    pub seqnum: SeqNum,
    pub metric: u8,
}

impl NodeData {
    pub fn new(addr: Addr) -> Self {
        Self { addr, seqnum: SeqNum::INVALID, metric: 0 }
    }
}

/// One unreachable destination announced in a RERR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreachableNode {
    pub addr: Addr,
    pub seqnum: SeqNum,
}

/// Parsed view of an incoming message plus local handling state.
#[derive(Debug, Clone)]
pub struct PacketData {
    /// Remaining hop budget, already decremented for this hop.
    pub hoplimit: u8,
    pub metric_type: MetricType,
    pub orig: NodeData,
    pub targ: NodeData,
    /// Link-layer neighbor the message arrived from.
    pub sender: Addr,
    /// Local receive time, milliseconds.
    pub timestamp: u64,
}

/// A validated incoming message.
#[derive(Debug, Clone)]
pub enum Message {
    Rreq(RouteMessage),
    Rrep(RouteMessage),
    Rerr(RerrMessage),
}

/// Common shape of RREQ and RREP after validation.
#[derive(Debug, Clone)]
pub struct RouteMessage {
    /// Hop limit after the post-decrement for this hop.
    pub hoplimit: u8,
    pub metric_type: MetricType,
    pub orig: NodeData,
    pub targ: NodeData,
}

#[derive(Debug, Clone)]
pub struct RerrMessage {
    pub hoplimit: u8,
    /// Unreachable addresses with their SeqNum TLV, when one was present.
    pub nodes: Vec<(Addr, Option<SeqNum>)>,
}

struct ParsedTlv {
    tlv_type: u8,
    type_ext: u8,
    value: Vec<u8>,
}

struct ParsedAddress {
    addr: Addr,
    tlvs: Vec<ParsedTlv>,
}

impl ParsedAddress {
    fn tlv(&self, tlv_type: u8) -> Option<&ParsedTlv> {
        self.tlvs.iter().find(|t| t.tlv_type == tlv_type)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Option<u8> {
        let value = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }
}

fn tlv_u16(tlv: &ParsedTlv) -> Option<u16> {
    match tlv.value.as_slice() {
        [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

fn tlv_u8(tlv: &ParsedTlv) -> Option<u8> {
    match tlv.value.as_slice() {
        [v] => Some(*v),
        _ => None,
    }
}

fn parse_addresses(cur: &mut Cursor<'_>) -> Option<Vec<ParsedAddress>> {
    let count = cur.byte()?;
    let mut addrs = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let raw = cur.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        let prefix_len = cur.byte()?;

        let tlv_count = cur.byte()?;
        let mut tlvs = Vec::with_capacity(tlv_count as usize);
        for _ in 0..tlv_count {
            let tlv_type = cur.byte()?;
            let type_ext = cur.byte()?;
            let len = cur.byte()? as usize;
            let value = cur.take(len)?.to_vec();
            tlvs.push(ParsedTlv { tlv_type, type_ext, value });
        }

        addrs.push(ParsedAddress { addr: Addr::from_bytes(bytes, prefix_len), tlvs });
    }

    Some(addrs)
}

/// Parse and validate one datagram. The hop limit is checked for presence
/// and non-zero and comes back post-decremented.
pub fn parse(buf: &[u8]) -> Option<Message> {
    let mut cur = Cursor { buf, pos: 0 };
    let msg_type = cur.byte()?;
    let hoplimit = cur.byte()?;
    if hoplimit == 0 {
        return None;
    }
    let hoplimit = hoplimit - 1;

    let addrs = parse_addresses(&mut cur)?;

    match msg_type {
        MSG_RREQ => parse_route_msg(hoplimit, &addrs, false).map(Message::Rreq),
        MSG_RREP => parse_route_msg(hoplimit, &addrs, true).map(Message::Rrep),
        MSG_RERR => {
            let mut nodes = Vec::with_capacity(addrs.len());
            for addr in &addrs {
                let seqnum = match addr.tlv(TLV_UNREACHABLE_NODE_SEQNUM) {
                    Some(tlv) => Some(SeqNum::new(tlv_u16(tlv)?)),
                    None => None,
                };
                nodes.push((addr.addr, seqnum));
            }
            if nodes.is_empty() {
                return None;
            }
            Some(Message::Rerr(RerrMessage { hoplimit, nodes }))
        }
        _ => None,
    }
}

/// Sort a route message's addresses into OrigNode and TargNode and enforce
/// the mandatory TLVs.
///
/// In a RREQ the metric rides on OrigNode and TargNode may or may not carry
/// a SeqNum; in a RREP the roles are mirrored. An address without any
/// SeqNum TLV is assumed to be the TargNode (RREQ) / discarded as invalid
/// (RREP, where both SeqNums are mandatory).
fn parse_route_msg(hoplimit: u8, addrs: &[ParsedAddress], is_rrep: bool) -> Option<RouteMessage> {
    let mut orig: Option<NodeData> = None;
    let mut targ: Option<NodeData> = None;
    let mut metric_type: Option<MetricType> = None;

    for address in addrs {
        let orig_tlv = address.tlv(TLV_ORIG_SEQNUM);
        let targ_tlv = address.tlv(TLV_TARG_SEQNUM);
        let metric_tlv = address.tlv(TLV_METRIC);

        let mut node = NodeData::new(address.addr);
        let mut is_orig = false;
        let mut is_targ = false;

        if let Some(tlv) = orig_tlv {
            node.seqnum = SeqNum::new(tlv_u16(tlv)?);
            is_orig = true;
        } else if let Some(tlv) = targ_tlv {
            node.seqnum = SeqNum::new(tlv_u16(tlv)?);
            is_targ = true;
        } else {
            // No SeqNum TLV at all: assume TargNode
            is_targ = true;
        }

        // The metric TLV must ride on the metric-carrying address: OrigNode
        // in a RREQ, TargNode in a RREP.
        let carries_metric = if is_rrep { is_targ } else { is_orig };
        match metric_tlv {
            Some(tlv) => {
                if !carries_metric {
                    return None;
                }
                metric_type = Some(MetricType::from_raw(tlv.type_ext)?);
                node.metric = tlv_u8(tlv)?;
            }
            None => {
                if carries_metric {
                    return None;
                }
            }
        }

        if is_orig {
            orig = Some(node);
        } else if is_targ {
            targ = Some(node);
        }
    }

    let orig = orig?;
    let targ = targ?;
    if !orig.seqnum.is_valid() {
        return None;
    }
    if is_rrep && !targ.seqnum.is_valid() {
        return None;
    }

    Some(RouteMessage {
        hoplimit,
        metric_type: metric_type?,
        orig,
        targ,
    })
}

struct MessageBuilder {
    buf: Vec<u8>,
    addr_count_at: usize,
}

impl MessageBuilder {
    fn new(msg_type: u8, hoplimit: u8) -> Self {
        let buf = vec![msg_type, hoplimit, 0];
        Self { addr_count_at: 2, buf }
    }

    fn address(&mut self, addr: &Addr) -> TlvBlock<'_> {
        self.buf[self.addr_count_at] += 1;
        self.buf.extend_from_slice(addr.bytes());
        self.buf.push(addr.prefix_len());
        let tlv_count_at = self.buf.len();
        self.buf.push(0);
        TlvBlock { buf: &mut self.buf, tlv_count_at }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct TlvBlock<'a> {
    buf: &'a mut Vec<u8>,
    tlv_count_at: usize,
}

impl TlvBlock<'_> {
    fn tlv(self, tlv_type: u8, type_ext: u8, value: &[u8]) -> Self {
        self.buf[self.tlv_count_at] += 1;
        self.buf.push(tlv_type);
        self.buf.push(type_ext);
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value);
        self
    }
}

/// Serialize a RREQ: OrigNode carries its SeqNum and the metric, TargNode
/// carries its SeqNum only when one is known.
pub fn encode_rreq(pd: &PacketData) -> Vec<u8> {
    let mut msg = MessageBuilder::new(MSG_RREQ, pd.hoplimit);

    msg.address(&pd.orig.addr)
        .tlv(TLV_ORIG_SEQNUM, 0, &pd.orig.seqnum.get().to_be_bytes())
        .tlv(TLV_METRIC, pd.metric_type.raw(), &[pd.orig.metric]);

    let targ = msg.address(&pd.targ.addr);
    if pd.targ.seqnum.is_valid() {
        targ.tlv(TLV_TARG_SEQNUM, 0, &pd.targ.seqnum.get().to_be_bytes());
    }

    msg.finish()
}

/// Serialize a RREP: both SeqNums are mandatory and the metric rides on
/// TargNode. RREPs always start with a full hop budget.
pub fn encode_rrep(pd: &PacketData) -> Vec<u8> {
    let mut msg = MessageBuilder::new(MSG_RREP, MAX_HOPCOUNT);

    msg.address(&pd.orig.addr)
        .tlv(TLV_ORIG_SEQNUM, 0, &pd.orig.seqnum.get().to_be_bytes());

    msg.address(&pd.targ.addr)
        .tlv(TLV_TARG_SEQNUM, 0, &pd.targ.seqnum.get().to_be_bytes())
        .tlv(TLV_METRIC, pd.metric_type.raw(), &[pd.targ.metric]);

    msg.finish()
}

/// Serialize a RERR listing `nodes`, each with its stored SeqNum.
pub fn encode_rerr(nodes: &[UnreachableNode], hoplimit: u8) -> Vec<u8> {
    let mut msg = MessageBuilder::new(MSG_RERR, hoplimit);

    for node in nodes {
        msg.address(&node.addr)
            .tlv(TLV_UNREACHABLE_NODE_SEQNUM, 0, &node.seqnum.get().to_be_bytes());
    }

    msg.finish()
}
