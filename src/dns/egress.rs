//! Ephemeral upstream socket allocation (C5).
//!
//! Every outstanding query (or liveness probe) gets its own short-lived
//! UDP socket bound to a randomized source port, optionally pinned to a
//! named egress interface with `SO_BINDTODEVICE`, and registered with
//! the daemon's single `mio::Poll` so the event loop can multiplex
//! replies across all of them without threads.

use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;

use derive_more::{Display, Error};
use mio::{Interest, Registry, Token};
use rand::Rng;
use socket2::{Domain, Socket, Type};

#[derive(Debug, Display, Error)]
pub enum EgressError {
    #[display(fmt = "open_upstream_sockets would exceed max_sockets")]
    SocketCeilingExceeded,
    #[display(fmt = "socket I/O error: {}", _0)]
    Io(io::Error),
}

impl From<io::Error> for EgressError {
    fn from(e: io::Error) -> Self {
        EgressError::Io(e)
    }
}

type Result<T> = std::result::Result<T, EgressError>;

const SOURCE_PORT_RANGE: std::ops::RangeInclusive<u16> = 1025..=65535;

/// A single egress socket and the interface it was bound to, if any.
pub struct EgressSocket {
    pub token: Token,
    pub socket: mio::net::UdpSocket,
    pub bound_interface: Option<String>,
}

/// Owns the global socket-ceiling accounting and the exclusion set; one
/// instance per [`crate::dns::context::Daemon`] (§9: no hidden
/// singletons).
pub struct EgressManager {
    max_sockets: usize,
    open_sockets: usize,
    /// Stored in network byte order -- see [`EgressManager::is_port_excluded`].
    excluded_ports_be: HashSet<u16>,
    dropping: bool,
    next_token: usize,
}

impl EgressManager {
    pub fn new(max_sockets: usize, excluded_ports: &[u16]) -> EgressManager {
        EgressManager {
            max_sockets,
            open_sockets: 0,
            excluded_ports_be: excluded_ports.iter().map(|p| p.to_be()).collect(),
            dropping: false,
            next_token: 1, // token 0 is reserved for the listening socket
        }
    }

    pub fn open_sockets(&self) -> usize {
        self.open_sockets
    }

    /// A candidate source port is compared against the exclusion set
    /// in network byte order, mirroring the source's `is_port_excluded`,
    /// which receives the port already in the wire's big-endian form.
    fn is_port_excluded(&self, candidate_host_order: u16) -> bool {
        self.excluded_ports_be.contains(&candidate_host_order.to_be())
    }

    fn next_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1).max(1);
        t
    }

    /// Open one ephemeral egress socket: random unexcluded source
    /// port, non-blocking, packet-info ancillary data enabled, and
    /// registered with `registry`. Does not send anything and does not
    /// bind to a specific interface -- see
    /// [`EgressManager::bind_to_interface`].
    pub fn open(&mut self, registry: &Registry) -> Result<EgressSocket> {
        if self.open_sockets >= self.max_sockets {
            if !self.dropping {
                log::warn!(
                    "socket limit reached ({}/{}), dropping new queries",
                    self.open_sockets,
                    self.max_sockets
                );
                self.dropping = true;
            }
            return Err(EgressError::SocketCeilingExceeded);
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        enable_pktinfo(&socket)?;

        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(SOURCE_PORT_RANGE);
            if self.is_port_excluded(candidate) {
                continue;
            }
            let addr = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, candidate);
            match socket.bind(&addr.into()) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }

        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let mut mio_socket = mio::net::UdpSocket::from_std(std_socket);

        let token = self.next_token();
        registry.register(&mut mio_socket, token, Interest::READABLE)?;

        self.open_sockets += 1;
        self.dropping = false;

        Ok(EgressSocket {
            token,
            socket: mio_socket,
            bound_interface: None,
        })
    }

    /// Attach the socket to an OS-level egress device so outbound
    /// datagrams leave there regardless of the routing table. Failure
    /// is logged, not fatal -- the packet may still egress via the
    /// routing table.
    pub fn bind_to_interface(&self, egress: &mut EgressSocket, name: &str) {
        let cloned = match egress.socket.try_clone() {
            Ok(cloned) => cloned,
            Err(e) => {
                log::warn!("failed to clone egress socket to bind it to interface {}: {}", name, e);
                return;
            }
        };
        let raw = Socket::from(cloned);
        match raw.bind_device(Some(name.as_bytes())) {
            Ok(()) => egress.bound_interface = Some(name.to_string()),
            Err(e) => log::warn!("failed to bind egress socket to interface {}: {}", name, e),
        }
        // `raw` wraps the same fd as `egress.socket`; avoid double-close.
        std::mem::forget(raw);
    }

    /// Unregister and drop a socket, reclaiming its ceiling slot.
    /// Called by the query table's `delete` caller for every token a
    /// record held.
    pub fn close(&mut self, registry: &Registry, mut egress: EgressSocket) {
        let _ = registry.deregister(&mut egress.socket);
        self.open_sockets = self.open_sockets.saturating_sub(1);
    }

    pub fn send_to(&self, socket: &EgressSocket, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        socket.socket.send_to(buf, dst)
    }
}

#[cfg(target_os = "linux")]
fn enable_pktinfo(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_pktinfo(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

/// A datagram received with its source address and, where the
/// platform supports it, the interface it arrived on.
pub struct ReceivedReply {
    pub len: usize,
    pub from: SocketAddr,
    pub ingress_ifindex: Option<u32>,
}

/// Receive one datagram from `fd` using `recvmsg` with ancillary
/// packet-info data, so the correlator can recover which interface
/// delivered the reply (C7 step 4). Falls back to a plain `recvfrom`
/// semantics (no ancillary data) on non-Linux targets.
#[cfg(target_os = "linux")]
pub fn recv_with_pktinfo(fd: std::os::unix::io::RawFd, buf: &mut [u8]) -> io::Result<ReceivedReply> {
    use std::mem::MaybeUninit;

    let mut src: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    const CMSG_BUF_LEN: usize = 128;
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = CMSG_BUF_LEN as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let from = SocketAddr::V4(SocketAddrV4::new(
        std::net::Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr)),
        u16::from_be(src.sin_port),
    ));

    let mut ingress_ifindex = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                let pktinfo_ptr = libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo;
                let pktinfo: MaybeUninit<libc::in_pktinfo> = MaybeUninit::new(pktinfo_ptr.read_unaligned());
                ingress_ifindex = Some(pktinfo.assume_init().ipi_ifindex as u32);
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(ReceivedReply {
        len: n as usize,
        from,
        ingress_ifindex,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn recv_with_pktinfo(fd: std::os::unix::io::RawFd, buf: &mut [u8]) -> io::Result<ReceivedReply> {
    use std::os::unix::io::FromRawFd;
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    let result = socket.recv_from(buf).map(|(len, from)| ReceivedReply {
        len,
        from,
        ingress_ifindex: None,
    });
    std::mem::forget(socket); // do not close the real socket on drop
    result
}

/// Resolve an interface index to its OS name (`eth0`, ...). Returns
/// `None` on lookup failure or on platforms without `if_indextoname`.
#[cfg(unix)]
pub fn ifindex_to_name(ifindex: u32) -> Option<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let ptr = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr() as *mut libc::c_char) };
    if ptr.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    cstr.to_str().ok().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_exclusion_respects_network_byte_order() {
        let mgr = EgressManager::new(8, &[5353]);
        assert!(mgr.is_port_excluded(5353));
        assert!(!mgr.is_port_excluded(5354));
    }

    #[test]
    fn ceiling_prevents_opening_past_max_sockets() {
        let poll = mio::Poll::new().unwrap();
        let mut mgr = EgressManager::new(0, &[]);
        let err = mgr.open(poll.registry());
        assert!(matches!(err, Err(EgressError::SocketCeilingExceeded)));
    }

    #[test]
    fn open_allocates_unique_random_port_within_range() {
        let poll = mio::Poll::new().unwrap();
        let mut mgr = EgressManager::new(4, &[]);
        let sock = mgr.open(poll.registry()).unwrap();
        let port = sock.socket.local_addr().unwrap().port();
        assert!(SOURCE_PORT_RANGE.contains(&port));
        assert_eq!(mgr.open_sockets(), 1);
    }
}
