//! Split-phase ICMP echo probing.
//!
//! Every request of a pass is registered in a [`CorrelationTable`] before
//! the first packet leaves. Sender lanes then write echo requests to the
//! shared raw sockets while one receiver per address family matches echo
//! replies back to their request by `(identifier, sequence)`. Once all
//! lanes are done and a grace period has passed, whatever is still in the
//! table is counted as lost.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{self as icmp_echo_request, MutableEchoRequestPacket};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::util;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::ICMP_PAYLOAD;
use crate::executor::{PassRunner, RunContext};
use crate::target::resolve_host;
use crate::task::{IcmpTag, ProbeTask, TaskSet, WorkerLane};

const ICMP_HEADER_SIZE: usize = 8;
const RECV_BUFFER_SIZE: usize = 1500;
const MIN_READ_DEADLINE: Duration = Duration::from_secs(1);
/// Pause after a failed read before the socket is polled again.
pub const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("ipv4"),
            IpFamily::V6 => f.write_str("ipv6"),
        }
    }
}

/// What the receiver makes of one inbound ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpMessage {
    EchoReply { id: u16, seq: u16 },
    Other { icmp_type: u8 },
}

/// Serializes an echo request. The ICMPv6 checksum is left zero for the
/// kernel to fill in.
pub fn build_echo_request(family: IpFamily, id: u16, seq: u16, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; ICMP_HEADER_SIZE + payload.len()];
    match family {
        IpFamily::V4 => {
            let mut echo = MutableEchoRequestPacket::new(&mut buf).ok_or_else(short_buffer)?;
            echo.set_icmp_type(IcmpTypes::EchoRequest);
            echo.set_icmp_code(icmp_echo_request::IcmpCodes::NoCode);
            echo.set_identifier(id);
            echo.set_sequence_number(seq);
            echo.set_payload(payload);
            let checksum = util::checksum(echo.packet(), 1);
            echo.set_checksum(checksum);
        }
        IpFamily::V6 => {
            let mut body = Vec::with_capacity(4 + payload.len());
            body.extend_from_slice(&id.to_be_bytes());
            body.extend_from_slice(&seq.to_be_bytes());
            body.extend_from_slice(payload);

            let mut packet = MutableIcmpv6Packet::new(&mut buf).ok_or_else(short_buffer)?;
            packet.set_icmpv6_type(Icmpv6Types::EchoRequest);
            packet.set_icmpv6_code(Icmpv6Code::new(0));
            packet.set_payload(&body);
        }
    }
    Ok(buf)
}

/// Parses an ICMP message (no IP header). `None` when it is too short to
/// be one.
pub fn parse_message(family: IpFamily, bytes: &[u8]) -> Option<IcmpMessage> {
    match family {
        IpFamily::V4 => {
            let packet = IcmpPacket::new(bytes)?;
            if packet.get_icmp_type() != IcmpTypes::EchoReply {
                return Some(IcmpMessage::Other {
                    icmp_type: packet.get_icmp_type().0,
                });
            }
            let reply = EchoReplyPacket::new(bytes)?;
            Some(IcmpMessage::EchoReply {
                id: reply.get_identifier(),
                seq: reply.get_sequence_number(),
            })
        }
        IpFamily::V6 => {
            let packet = Icmpv6Packet::new(bytes)?;
            if packet.get_icmpv6_type() != Icmpv6Types::EchoReply {
                return Some(IcmpMessage::Other {
                    icmp_type: packet.get_icmpv6_type().0,
                });
            }
            match packet.payload() {
                [id_hi, id_lo, seq_hi, seq_lo, ..] => Some(IcmpMessage::EchoReply {
                    id: u16::from_be_bytes([*id_hi, *id_lo]),
                    seq: u16::from_be_bytes([*seq_hi, *seq_lo]),
                }),
                _ => None,
            }
        }
    }
}

/// Drops the IPv4 header raw sockets deliver in front of the ICMP message.
pub fn strip_ipv4_header(bytes: &[u8]) -> &[u8] {
    match Ipv4Packet::new(bytes) {
        Some(ip) if ip.get_version() == 4 => {
            let header_len = ip.get_header_length() as usize * 4;
            bytes.get(header_len..).unwrap_or(&[])
        }
        _ => bytes,
    }
}

fn short_buffer() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "buffer too small for an ICMP echo message")
}

/// A socket that carries ICMP messages of one address family.
pub trait EchoSocket: Send + Sync {
    fn send_to(&self, message: &[u8], dst: IpAddr) -> io::Result<usize>;

    /// Waits up to `deadline` for one message and returns it without any IP
    /// header. `Ok(None)` means the deadline passed.
    fn recv(&self, deadline: Duration) -> io::Result<Option<(Vec<u8>, IpAddr)>>;
}

pub struct RawIcmpSocket {
    socket: Socket,
    family: IpFamily,
}

impl RawIcmpSocket {
    /// Opens a raw ICMP socket, bound to `src_ip` when it belongs to the
    /// same family. Needs root or CAP_NET_RAW.
    pub fn open(family: IpFamily, src_ip: Option<IpAddr>) -> io::Result<Self> {
        let (domain, protocol) = match family {
            IpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            IpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
        if let Some(src) = src_ip.filter(|ip| IpFamily::of(*ip) == family) {
            socket.bind(&SockAddr::from(SocketAddr::new(src, 0)))?;
        }
        Ok(Self { socket, family })
    }
}

impl EchoSocket for RawIcmpSocket {
    fn send_to(&self, message: &[u8], dst: IpAddr) -> io::Result<usize> {
        self.socket.send_to(message, &SockAddr::from(SocketAddr::new(dst, 0)))
    }

    fn recv(&self, deadline: Duration) -> io::Result<Option<(Vec<u8>, IpAddr)>> {
        self.socket.set_read_timeout(Some(deadline))?;
        let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];
        match self.socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                // SAFETY: recv_from initialized the first `len` bytes.
                let bytes: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
                let peer = peer.as_socket().map(|addr| addr.ip()).unwrap_or(match self.family {
                    IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                });
                let message = match self.family {
                    IpFamily::V4 => strip_ipv4_header(bytes),
                    IpFamily::V6 => bytes,
                };
                Ok(Some((message.to_vec(), peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The v4 socket plus, when the host supports it, the v6 one.
pub struct IcmpTransport<S> {
    v4: S,
    v6: Option<S>,
}

impl<S: EchoSocket> IcmpTransport<S> {
    pub fn new(v4: S, v6: Option<S>) -> Self {
        Self { v4, v6 }
    }

    pub fn socket(&self, family: IpFamily) -> Option<&S> {
        match family {
            IpFamily::V4 => Some(&self.v4),
            IpFamily::V6 => self.v6.as_ref(),
        }
    }

    fn sockets(&self) -> impl Iterator<Item = (IpFamily, &S)> {
        std::iter::once((IpFamily::V4, &self.v4)).chain(self.v6.as_ref().map(|s| (IpFamily::V6, s)))
    }
}

impl IcmpTransport<RawIcmpSocket> {
    /// IPv4 is mandatory; a host without usable IPv6 just loses the v6
    /// receiver and its v6 probes time out.
    pub fn open(src_ip: Option<IpAddr>) -> io::Result<Self> {
        let v4 = RawIcmpSocket::open(IpFamily::V4, src_ip)?;
        let v6 = match RawIcmpSocket::open(IpFamily::V6, src_ip) {
            Ok(socket) => Some(socket),
            Err(err) => {
                warn!(error = %err, "ipv6 icmp socket unavailable");
                None
            }
        };
        Ok(Self::new(v4, v6))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub id: u16,
    pub seq: u16,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.id, self.seq)
    }
}

impl From<IcmpTag> for CorrelationKey {
    fn from(tag: IcmpTag) -> Self {
        Self {
            id: tag.id,
            seq: tag.seq,
        }
    }
}

/// Outstanding echo requests of the current pass, keyed by correlation
/// pair. Removing an entry is what marks a request answered.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<CorrelationKey, String>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every ICMP task before any packet is sent.
    pub fn fill<'a>(&self, tasks: impl IntoIterator<Item = &'a ProbeTask>) {
        let mut entries = self.entries.lock();
        for task in tasks {
            if let Some(tag) = task.icmp {
                entries.insert(tag.into(), task.target.clone());
            }
        }
    }

    pub fn insert(&self, key: CorrelationKey, destination: impl Into<String>) {
        self.entries.lock().insert(key, destination.into());
    }

    /// Removes and returns the destination waiting on `key`.
    pub fn take(&self, key: CorrelationKey) -> Option<String> {
        self.entries.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Empties the table, returning what was left.
    pub fn drain(&self) -> Vec<(CorrelationKey, String)> {
        self.entries.lock().drain().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub registered: usize,
    pub unanswered: usize,
}

/// Runs ICMP passes over a shared transport and correlation table.
pub struct IcmpRunner<'a, S> {
    transport: &'a IcmpTransport<S>,
    table: &'a CorrelationTable,
}

impl<'a, S: EchoSocket> IcmpRunner<'a, S> {
    pub fn new(transport: &'a IcmpTransport<S>, table: &'a CorrelationTable) -> Self {
        Self { transport, table }
    }

    pub fn run(&self, task_set: &mut TaskSet, ctx: &RunContext<'_>) -> PassReport {
        self.table.fill(task_set.tasks());
        let registered = self.table.len();
        let task_set_id = task_set.id;
        let deadline = ctx.timeout.max(MIN_READ_DEADLINE);
        let drained = CancelToken::new();

        thread::scope(|scope| {
            let receivers: Vec<_> = self
                .transport
                .sockets()
                .map(|(family, socket)| {
                    let drained = &drained;
                    scope.spawn(move || self.receive_loop(family, socket, ctx, drained, deadline))
                })
                .collect();

            let senders: Vec<_> = task_set
                .lanes
                .iter_mut()
                .map(|lane| scope.spawn(move || self.send_lane(lane, ctx)))
                .collect();
            for sender in senders {
                if sender.join().is_err() {
                    error!("icmp sender lane panicked");
                }
            }

            debug!(task_set = %task_set_id, "all echo requests issued");
            ctx.cancel.sleep(ctx.timeout);
            drained.cancel();

            for receiver in receivers {
                if receiver.join().is_err() {
                    error!("icmp receiver panicked");
                }
            }
        });

        if ctx.cancel.is_cancelled() {
            self.table.clear();
            return PassReport {
                registered,
                unanswered: 0,
            };
        }

        let leftovers = self.table.drain();
        for (key, destination) in &leftovers {
            trace!(%key, destination, "no echo reply before drain deadline");
            let totals = ctx.tracker.increment(destination, false);
            ctx.reporter.outcome(destination, false, totals);
        }
        info!(task_set = %task_set_id, registered, unanswered = leftovers.len(), "icmp pass reconciled");

        PassReport {
            registered,
            unanswered: leftovers.len(),
        }
    }

    fn send_lane(&self, lane: &mut WorkerLane, ctx: &RunContext<'_>) {
        for task in lane.tasks.iter_mut() {
            if ctx.cancel.is_cancelled() {
                return;
            }
            let Some(tag) = task.icmp else {
                continue;
            };
            task.completed = true;
            if self.send_one(&task.target, tag) {
                ctx.cancel.sleep(tag.send_interval);
            }
        }
    }

    // Failures here are left in the table and surface as timeouts.
    fn send_one(&self, target: &str, tag: IcmpTag) -> bool {
        let dst = match resolve_host(target) {
            Ok(ip) => ip,
            Err(err) => {
                warn!(target, error = %err, "cannot resolve icmp destination");
                return false;
            }
        };
        let family = IpFamily::of(dst);
        let Some(socket) = self.transport.socket(family) else {
            debug!(target, %family, "no socket for address family");
            return false;
        };
        let message = match build_echo_request(family, tag.id, tag.seq, ICMP_PAYLOAD) {
            Ok(message) => message,
            Err(err) => {
                error!(target, error = %err, "failed to build echo request");
                return false;
            }
        };
        match socket.send_to(&message, dst) {
            Ok(_) => {
                trace!(%dst, id = tag.id, seq = tag.seq, "echo request sent");
                true
            }
            Err(err) => {
                error!(%dst, error = %err, "failed to send echo request");
                false
            }
        }
    }

    fn receive_loop(
        &self,
        family: IpFamily,
        socket: &S,
        ctx: &RunContext<'_>,
        drained: &CancelToken,
        deadline: Duration,
    ) {
        let mut read_errors = 0u64;
        loop {
            if ctx.cancel.is_cancelled() || drained.is_cancelled() {
                if read_errors > 1 {
                    warn!(%family, read_errors, "icmp receiver saw repeated read errors");
                }
                return;
            }
            let (message, peer) = match socket.recv(deadline) {
                Ok(Some(received)) => {
                    read_errors = 0;
                    received
                }
                Ok(None) => {
                    trace!(%family, "read deadline elapsed");
                    continue;
                }
                Err(err) => {
                    read_errors += 1;
                    if read_errors == 1 {
                        error!(%family, error = %err, "icmp read failed");
                    } else {
                        trace!(%family, read_errors, error = %err, "icmp read still failing");
                    }
                    ctx.cancel.sleep(READ_ERROR_BACKOFF.min(deadline));
                    continue;
                }
            };

            match parse_message(family, &message) {
                Some(IcmpMessage::EchoReply { id, seq }) => {
                    let key = CorrelationKey { id, seq };
                    match self.table.take(key) {
                        Some(destination) => {
                            let totals = ctx.tracker.increment(&destination, true);
                            ctx.reporter.outcome(&peer.to_string(), true, totals);
                        }
                        None => trace!(%peer, %key, "echo reply from another process or pass"),
                    }
                }
                Some(IcmpMessage::Other { icmp_type }) => {
                    trace!(%peer, icmp_type, "ignoring non echo reply");
                }
                None => debug!(%peer, len = message.len(), "malformed icmp message dropped"),
            }
        }
    }
}

impl<S: EchoSocket> PassRunner for IcmpRunner<'_, S> {
    fn run_pass(&self, task_set: &mut TaskSet, ctx: &RunContext<'_>) {
        self.run(task_set, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_request_has_valid_checksum_and_fields() {
        let bytes = build_echo_request(IpFamily::V4, 65535, 7, ICMP_PAYLOAD).unwrap();
        assert_eq!(bytes.len(), ICMP_HEADER_SIZE + ICMP_PAYLOAD.len());
        assert_eq!(bytes[0], 8);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[4..6], &65535u16.to_be_bytes());
        assert_eq!(&bytes[6..8], &7u16.to_be_bytes());
        assert_eq!(&bytes[8..], ICMP_PAYLOAD);
        assert_eq!(util::checksum(&bytes, 1), u16::from_be_bytes([bytes[2], bytes[3]]));

        assert_eq!(parse_message(IpFamily::V4, &bytes), Some(IcmpMessage::Other { icmp_type: 8 }));
    }

    #[test]
    fn v4_reply_yields_correlation_pair() {
        let mut bytes = build_echo_request(IpFamily::V4, 1234, 42, ICMP_PAYLOAD).unwrap();
        bytes[0] = 0;
        assert_eq!(
            parse_message(IpFamily::V4, &bytes),
            Some(IcmpMessage::EchoReply { id: 1234, seq: 42 })
        );
    }

    #[test]
    fn v6_request_layout_and_reply_parse() {
        let mut bytes = build_echo_request(IpFamily::V6, 65534, 3, ICMP_PAYLOAD).unwrap();
        assert_eq!(bytes[0], 128);
        assert_eq!(&bytes[2..4], &[0, 0]);
        assert_eq!(&bytes[4..6], &65534u16.to_be_bytes());
        assert_eq!(&bytes[6..8], &3u16.to_be_bytes());
        assert_eq!(&bytes[8..], ICMP_PAYLOAD);

        bytes[0] = 129;
        assert_eq!(
            parse_message(IpFamily::V6, &bytes),
            Some(IcmpMessage::EchoReply { id: 65534, seq: 3 })
        );
    }

    #[test]
    fn truncated_messages_are_malformed() {
        assert_eq!(parse_message(IpFamily::V4, &[0, 0]), None);
        assert_eq!(parse_message(IpFamily::V4, &[0, 0, 0, 0, 1]), None);
        assert_eq!(parse_message(IpFamily::V6, &[129, 0, 0, 0, 1]), None);
    }

    #[test]
    fn strips_ipv4_header() {
        let icmp = build_echo_request(IpFamily::V4, 1, 1, b"x").unwrap();
        let mut datagram = vec![0x45, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0, 127, 0, 0, 1, 127, 0, 0, 1];
        datagram.extend_from_slice(&icmp);
        assert_eq!(strip_ipv4_header(&datagram), icmp.as_slice());
        assert_eq!(strip_ipv4_header(&icmp), icmp.as_slice());
    }

    #[test]
    fn correlation_table_take_and_drain() {
        let table = CorrelationTable::new();
        table.insert(CorrelationKey { id: 65535, seq: 0 }, "10.0.0.1");
        table.insert(CorrelationKey { id: 65535, seq: 1 }, "10.0.0.2");
        assert_eq!(table.len(), 2);

        assert_eq!(table.take(CorrelationKey { id: 65535, seq: 0 }).as_deref(), Some("10.0.0.1"));
        assert_eq!(table.take(CorrelationKey { id: 65535, seq: 0 }), None);

        let rest = table.drain();
        assert_eq!(rest, vec![(CorrelationKey { id: 65535, seq: 1 }, "10.0.0.2".to_string())]);
        assert!(table.is_empty());
    }

    #[test]
    fn correlation_key_renders_id_bar_seq() {
        assert_eq!(CorrelationKey { id: 65535, seq: 12 }.to_string(), "65535|12");
    }
}
