//! ICMPv4 echo prober
//!
//! Builds echo requests on the wire level, sends them over a raw socket and
//! classifies the replies. One prober instance owns one socket; every icmp
//! check registered through [`IcmpProber::constructor`] shares it.
//!
//! Replies are not matched against the request's identifier or sequence
//! number, so concurrent probes over the shared socket can observe each
//! other's replies. Callers relying on per-probe correlation must use one
//! prober per concurrent target.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace};

use crate::registry::CheckConstructor;
use crate::{CheckFn, CheckResult, Outcome};

const ECHO_REQUEST_TYPE: u8 = 8;
const ECHO_REPLY_TYPE: u8 = 0;
const ECHO_CODE: u8 = 0;
const ECHO_SEQUENCE: u16 = 1;
const HEADER_LEN: usize = 8;
const RECV_BUF_SIZE: usize = 256;
const ID_RANGE: u16 = 32000;
const PROBE_PAYLOAD: &[u8] = b"healthwatch/probe";

/// An ICMPv4 echo message (request or reply) in parsed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMessage {
    pub message_type: u8,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl EchoMessage {
    pub fn request(identifier: u16, payload: &[u8]) -> Self {
        Self {
            message_type: ECHO_REQUEST_TYPE,
            code: ECHO_CODE,
            identifier,
            sequence: ECHO_SEQUENCE,
            payload: payload.to_vec(),
        }
    }

    pub fn is_echo_reply(&self) -> bool {
        self.message_type == ECHO_REPLY_TYPE
    }

    /// Serialize to wire bytes with a freshly computed checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(self.message_type);
        bytes.push(self.code);
        bytes.extend_from_slice(&[0, 0]); // checksum placeholder
        bytes.extend_from_slice(&self.identifier.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.payload);

        let checksum = internet_checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    /// Parse wire bytes. Returns `None` for truncated messages and for
    /// messages whose checksum does not verify.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        if internet_checksum(bytes) != 0 {
            return None;
        }
        Some(Self {
            message_type: bytes[0],
            code: bytes[1],
            identifier: u16::from_be_bytes([bytes[4], bytes[5]]),
            sequence: u16::from_be_bytes([bytes[6], bytes[7]]),
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// RFC 1071 internet checksum. Over a message with a valid embedded
/// checksum the result is zero.
fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in bytes.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Raw replies arrive with the IPv4 header still attached; the ICMP message
/// starts after it.
fn strip_ipv4_header(packet: &[u8]) -> &[u8] {
    if let Some(first) = packet.first()
        && first >> 4 == 4
    {
        let header_len = ((first & 0x0f) as usize) * 4;
        if header_len >= 20 && packet.len() > header_len {
            return &packet[header_len..];
        }
    }
    packet
}

/// Transport used by the prober. Abstracted so the protocol logic can be
/// exercised against an in-memory fake.
pub trait ProbeSocket: Send + Sync {
    fn send_to(&self, bytes: &[u8], target: Ipv4Addr) -> io::Result<usize>;
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Raw ICMPv4 socket with an OS-level read timeout.
struct RawIcmpSocket {
    socket: Socket,
}

impl RawIcmpSocket {
    fn open(timeout: Duration) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                anyhow::anyhow!(
                    "opening a raw ICMP socket requires elevated privileges (root or CAP_NET_RAW)"
                )
            } else {
                anyhow::Error::new(e).context("failed to open raw ICMP socket")
            }
        })?;
        socket
            .set_read_timeout(Some(timeout))
            .context("failed to set read timeout on ICMP socket")?;
        Ok(Self { socket })
    }
}

impl ProbeSocket for RawIcmpSocket {
    fn send_to(&self, bytes: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        let addr = SocketAddr::new(IpAddr::V4(target), 0);
        self.socket.send_to(bytes, &addr.into())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }
}

/// ICMPv4 echo prober. Construction opens the raw socket, so it fails fast
/// when the process lacks the required privilege.
pub struct IcmpProber {
    socket: Box<dyn ProbeSocket>,
    identifier: u16,
    timeout: Duration,
}

impl IcmpProber {
    pub fn new(timeout: Duration) -> anyhow::Result<Arc<Self>> {
        let socket = RawIcmpSocket::open(timeout)?;
        Ok(Arc::new(Self::with_socket(Box::new(socket), timeout)))
    }

    /// Build a prober over an arbitrary transport (used by tests).
    pub fn with_socket(socket: Box<dyn ProbeSocket>, timeout: Duration) -> Self {
        Self {
            socket,
            identifier: rand::thread_rng().gen_range(0..ID_RANGE),
            timeout,
        }
    }

    /// Constructor for the `icmp` check type. Required args: `targetIP`
    /// (an IPv4 address or a resolvable hostname).
    pub fn constructor(self: Arc<Self>) -> CheckConstructor {
        let prober = self;
        Box::new(move |args| {
            let raw = args
                .get("targetIP")
                .context("icmp check missing 'targetIP' parameter")?;
            let target = resolve_ipv4(raw)?;

            let prober = Arc::clone(&prober);
            let check: CheckFn = Arc::new(move || {
                let prober = Arc::clone(&prober);
                async move {
                    // the raw socket blocks, so probe off the async runtime
                    match tokio::task::spawn_blocking(move || prober.probe(target)).await {
                        Ok(result) => result,
                        Err(e) => {
                            error!("icmp probe task failed: {e}");
                            CheckResult::new(Outcome::Error, Duration::ZERO)
                        }
                    }
                }
                .boxed()
            });
            Ok(check)
        })
    }

    /// One request/response round trip against `target`. No retry; exactly
    /// one echo request is written per call.
    pub fn probe(&self, target: Ipv4Addr) -> CheckResult {
        let timestamp = Utc::now();
        let start = Instant::now();
        trace!("probing {target}");

        match self.round_trip(target) {
            Ok(reply) if reply.is_echo_reply() => CheckResult {
                timestamp,
                outcome: Outcome::Success,
                duration: start.elapsed(),
            },
            Ok(reply) => {
                debug!(
                    "probe of {target} answered with unexpected ICMP type {}",
                    reply.message_type
                );
                CheckResult {
                    timestamp,
                    outcome: Outcome::Failure,
                    duration: start.elapsed(),
                }
            }
            Err(e) if is_timeout(&e) => CheckResult {
                timestamp,
                outcome: Outcome::Failure,
                // the read deadline elapsed; charge the full timeout
                duration: self.timeout,
            },
            Err(e) => {
                debug!("probe of {target} failed: {e}");
                CheckResult {
                    timestamp,
                    outcome: Outcome::Failure,
                    duration: start.elapsed(),
                }
            }
        }
    }

    fn round_trip(&self, target: Ipv4Addr) -> io::Result<EchoMessage> {
        let request = EchoMessage::request(self.identifier, PROBE_PAYLOAD);
        self.socket.send_to(&request.to_bytes(), target)?;

        let mut buf = [0u8; RECV_BUF_SIZE];
        let read = self.socket.recv(&mut buf)?;

        EchoMessage::parse(strip_ipv4_header(&buf[..read])).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unparseable ICMP reply")
        })
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn resolve_ipv4(raw: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(addr) = raw.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    (raw, 0)
        .to_socket_addrs()
        .with_context(|| format!("unable to resolve '{raw}'"))?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .with_context(|| format!("'{raw}' did not resolve to an IPv4 address"))
}
