//! Listener multiplexing.
//!
//! Every hub in active mode asks for TCP, UDP and TLS listeners on a
//! configured interface and port. Requests collapse into a minimum
//! disjoint set of sockets: an exact match (or an existing wildcard
//! bind) is reused, a new wildcard bind absorbs interface-specific ones
//! on the same port and type, and a TCP/TLS clash on one port is a
//! configuration error that aborts every listener.
//!
//! Sockets are only created after resolution succeeds. Accepted TCP
//! connections are handed to the peer-session layer tagged with their
//! TLS-or-plain flavor; UDP datagrams are split into protocol messages
//! and dispatched to the search-result ingester.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NetError;

/// Listener transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindType {
    /// Plain TCP
    Tcp,
    /// UDP
    Udp,
    /// TCP that the collaborator wraps in TLS
    Tls,
}

/// One hub's listener request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    /// Requesting hub
    pub hub: u64,
    /// Transport type
    pub typ: BindType,
    /// Interface address; `0.0.0.0` is the wildcard
    pub ip: Ipv4Addr,
    /// Port; `0` draws the process-wide random port for the type
    pub port: u16,
}

/// A resolved bind: one socket-to-be, shared by one or more hubs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    /// Transport type
    pub typ: BindType,
    /// Interface address
    pub ip: Ipv4Addr,
    /// Concrete port (never zero)
    pub port: u16,
    /// Hubs whose requests reduced to this bind
    pub hubs: BTreeSet<u64>,
}

impl Bind {
    fn is_wildcard(&self) -> bool {
        self.ip.is_unspecified()
    }
}

/// The three process-wide fallback ports, drawn once at startup and
/// reused whenever a configured port is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomPorts {
    /// TCP fallback port
    pub tcp: u16,
    /// UDP fallback port
    pub udp: u16,
    /// TLS fallback port; always differs from `tcp`
    pub tls: u16,
}

impl RandomPorts {
    /// Draw the three ports in `[1025, 65534]`, TLS distinct from TCP.
    #[must_use]
    pub fn draw<R: Rng>(rng: &mut R) -> RandomPorts {
        let mut port = || rng.gen_range(1025..=65534);
        let tcp = port();
        let udp = port();
        let tls = loop {
            let p = port();
            if p != tcp {
                break p;
            }
        };
        RandomPorts { tcp, udp, tls }
    }

    fn for_type(&self, typ: BindType) -> u16 {
        match typ {
            BindType::Tcp => self.tcp,
            BindType::Udp => self.udp,
            BindType::Tls => self.tls,
        }
    }
}

/// Both TCP flavors occupy the same port space; UDP is disjoint.
fn tcp_family(t: BindType) -> bool {
    matches!(t, BindType::Tcp | BindType::Tls)
}

/// Collapse bind requests into the minimum disjoint bind set.
///
/// Zero ports are substituted from `ports` before matching.
///
/// # Errors
///
/// [`NetError::BindConflict`] when a TCP and a TLS request land on the
/// same port with overlapping interfaces; the caller must abort all
/// listeners and report passive mode.
pub fn resolve(requests: &[BindRequest], ports: &RandomPorts) -> Result<Vec<Bind>, NetError> {
    let mut binds: Vec<Bind> = Vec::new();

    for req in requests {
        let port = if req.port == 0 {
            ports.for_type(req.typ)
        } else {
            req.port
        };

        let mut reused = false;
        for bind in &mut binds {
            if bind.port != port {
                continue;
            }
            let ip_overlaps =
                bind.ip == req.ip || bind.is_wildcard() || req.ip.is_unspecified();
            if bind.typ == req.typ && (bind.ip == req.ip || bind.is_wildcard()) {
                bind.hubs.insert(req.hub);
                reused = true;
                break;
            }
            if bind.typ != req.typ && tcp_family(bind.typ) && tcp_family(req.typ) && ip_overlaps {
                return Err(NetError::BindConflict { port });
            }
        }
        if reused {
            continue;
        }

        let new = Bind {
            typ: req.typ,
            ip: req.ip,
            port,
            hubs: BTreeSet::from([req.hub]),
        };
        if new.is_wildcard() {
            // The wildcard absorbs interface-specific binds of the same
            // port and type.
            let mut absorbed = BTreeSet::new();
            binds.retain(|b| {
                if b.port == new.port && b.typ == new.typ {
                    absorbed.extend(b.hubs.iter().copied());
                    false
                } else {
                    true
                }
            });
            let mut new = new;
            new.hubs.extend(absorbed);
            binds.push(new);
        } else {
            binds.push(new);
        }
    }

    Ok(binds)
}

/// Events emitted by the running listener set.
#[derive(Debug)]
pub enum ListenerEvent {
    /// Inbound TCP connection
    Accepted {
        /// The accepted socket
        stream: TcpStream,
        /// Peer address
        peer: SocketAddr,
        /// Flavor of the listening bind
        tls: bool,
    },
    /// Inbound UDP messages, already split per flavor
    Datagram {
        /// Wire flavor of the packet
        flavor: UdpFlavor,
        /// The individual protocol messages
        messages: Vec<Vec<u8>>,
        /// Sender address
        from: SocketAddr,
    },
    /// A hard socket error; all listeners are down, passive mode is in
    /// effect
    Aborted {
        /// Description for the user
        reason: String,
    },
}

/// Wire flavor of a UDP packet, selected by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpFlavor {
    /// ADC-style packet (`U...`), messages split by `\n`
    Adc,
    /// Legacy packet (`$...`), messages split by `|`
    Nmdc,
}

/// Split a datagram into protocol messages by its flavor byte.
/// `None` drops the packet.
#[must_use]
pub fn split_datagram(data: &[u8]) -> Option<(UdpFlavor, Vec<Vec<u8>>)> {
    let (flavor, sep) = match data.first() {
        Some(b'U') => (UdpFlavor::Adc, b'\n'),
        Some(b'$') => (UdpFlavor::Nmdc, b'|'),
        _ => return None,
    };
    let messages = data
        .split(|&b| b == sep)
        .filter(|m| !m.is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    Some((flavor, messages))
}

/// The running listener set.
pub struct ListenerSet {
    binds: Vec<Bind>,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerSet {
    /// Resolve requests and open the sockets.
    ///
    /// Any bind failure tears the whole set down: the engine is either
    /// fully active or passive.
    ///
    /// # Errors
    ///
    /// [`NetError::BindConflict`] from resolution or
    /// [`NetError::BindFailed`] from socket setup.
    pub fn start(
        requests: &[BindRequest],
        ports: &RandomPorts,
        events: mpsc::UnboundedSender<ListenerEvent>,
    ) -> Result<ListenerSet, NetError> {
        let binds = resolve(requests, ports)?;
        let mut tasks = Vec::new();

        for bind in &binds {
            let addr = SocketAddrV4::new(bind.ip, bind.port);
            let events = events.clone();
            let task = match bind.typ {
                BindType::Tcp | BindType::Tls => {
                    let listener = open_tcp(addr).map_err(|e| {
                        warn!("cannot listen on {addr}: {e}");
                        NetError::BindFailed(format!("{addr}: {e}"))
                    })?;
                    let tls = bind.typ == BindType::Tls;
                    info!(%addr, tls, "listening");
                    tokio::spawn(accept_loop(listener, tls, events))
                }
                BindType::Udp => {
                    let socket = open_udp(addr).map_err(|e| {
                        warn!("cannot bind udp {addr}: {e}");
                        NetError::BindFailed(format!("{addr}: {e}"))
                    })?;
                    info!(%addr, "listening (udp)");
                    tokio::spawn(udp_loop(socket, events))
                }
            };
            tasks.push(task);
        }

        Ok(ListenerSet { binds, tasks })
    }

    /// The resolved bind set.
    #[must_use]
    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    /// Stop all listeners.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.binds.clear();
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_tcp(addr: SocketAddrV4) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(5)?;
    TcpListener::from_std(socket.into())
}

fn open_udp(addr: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    UdpSocket::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    tls: bool,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, tls, "accepted connection");
                if events
                    .send(ListenerEvent::Accepted { stream, peer, tls })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if is_soft(&e) => continue,
            Err(e) => {
                warn!("accept failed, listeners aborting: {e}");
                let _ = events.send(ListenerEvent::Aborted {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

async fn udp_loop(socket: UdpSocket, events: mpsc::UnboundedSender<ListenerEvent>) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let Some((flavor, messages)) = split_datagram(&buf[..n]) else {
                    debug!(%from, "dropping datagram with unknown flavor byte");
                    continue;
                };
                if events
                    .send(ListenerEvent::Datagram {
                        flavor,
                        messages,
                        from,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if is_soft(&e) => continue,
            Err(e) => {
                warn!("udp recv failed, listeners aborting: {e}");
                let _ = events.send(ListenerEvent::Aborted {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

fn is_soft(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
