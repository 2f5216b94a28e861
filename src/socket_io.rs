//! Raw and packet-socket primitives, `AsyncFd`-wrapped so `tokio::select!`
//! can treat them exactly like any other readiness source (SPEC_FULL §4.1,
//! §9 "Event multiplexer"). The edge-triggered-drain contract (`readable()`
//! then retry on `WouldBlock`) and the "grow a Vec, recv into it, truncate"
//! idiom are both grounded directly in the rsadv `IcmpSocket` pattern.

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::warn;

pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 1, 3);

pub const DHCPV6_SERVER_PORT: u16 = 547;
pub const DHCPV6_CLIENT_PORT: u16 = 546;

const RECV_BUFFER: usize = 1500 + 128;

/// A raw ICMPv6 socket bound to all interfaces, wrapped for edge-triggered
/// polling. One shared instance serves every interface the RD/NDP engines
/// watch — the kernel tags each received datagram with its originating
/// interface via `IPV6_PKTINFO` ancillary data, so a single socket suffices
/// (SPEC_FULL §4.1).
pub struct IcmpSocket {
    inner: AsyncFd<Socket>,
}

impl IcmpSocket {
    pub fn new() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_hops_v6(255)?;
        socket.set_unicast_hops_v6(255)?;
        enable_pktinfo(&socket)?;
        Ok(IcmpSocket {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub fn join_multicast(&self, group: Ipv6Addr, ifindex: u32) -> io::Result<()> {
        self.inner.get_ref().join_multicast_v6(&group, ifindex)
    }

    /// The raw fd, for use with [`crate::forwarder::send_on`] — the
    /// forwarder primitive builds its own ancillary-data `sendmsg` call
    /// rather than going through `AsyncFd`'s writable-wait, since raw ICMPv6
    /// sends essentially never block.
    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    /// Drain one datagram. Returns the payload, the peer address, and the
    /// interface index it arrived on (recovered from IPV6_PKTINFO ancillary
    /// data via `nix`, since `socket2`'s safe surface doesn't expose
    /// ancillary data).
    pub async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddrV6, u32)> {
        loop {
            let mut guard = self.inner.readable().await?;
            let fd = self.inner.get_ref().as_raw_fd();
            match guard.try_io(|_| recv_with_pktinfo(fd)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn send_raw(&self, buf: &[u8], dest: &SockAddr) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|socket| socket.get_ref().send_to(buf, dest)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// A DHCPv6 UDP socket, optionally bound to one interface via
/// `SO_BINDTODEVICE` (used for the broken-server-mode port-546 socket, which
/// must only ever speak to the master — SPEC_FULL §4.4 "Sockets").
pub struct DhcpSocket {
    inner: AsyncFd<Socket>,
}

impl DhcpSocket {
    pub fn bind(port: u16, bind_device: Option<&str>) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDPV6))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        if let Some(ifname) = bind_device {
            #[cfg(target_os = "linux")]
            socket.bind_device(Some(ifname.as_bytes()))?;
        }
        enable_pktinfo(&socket)?;
        let addr: SocketAddrV6 = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
        socket.bind(&addr.into())?;
        Ok(DhcpSocket {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub fn join_multicast(&self, group: Ipv6Addr, ifindex: u32) -> io::Result<()> {
        self.inner.get_ref().join_multicast_v6(&group, ifindex)
    }

    /// Returns the payload, the peer address, and the ingress interface
    /// index — recovered from IPV6_PKTINFO, since the engine needs to tell
    /// master-sourced server replies from slave-sourced client requests even
    /// when the peer address itself is global (SPEC_FULL §4.4
    /// "Classification").
    pub async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddrV6, u32)> {
        loop {
            let mut guard = self.inner.readable().await?;
            let fd = self.inner.get_ref().as_raw_fd();
            match guard.try_io(|_| recv_with_pktinfo(fd)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn send_to(&self, buf: &[u8], dest: SocketAddrV6) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|socket| socket.get_ref().send_to(buf, &dest.into())) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Enable `IPV6_RECVPKTINFO` so every `recvmsg` call carries the ingress
/// interface index as ancillary data.
fn enable_pktinfo(socket: &Socket) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};
    setsockopt(socket, sockopt::Ipv6RecvPacketInfo, &true)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

fn recv_with_pktinfo(fd: RawFd) -> io::Result<(Vec<u8>, SocketAddrV6, u32)> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrIn6};
    use std::io::IoSliceMut;

    let mut buf = vec![0u8; RECV_BUFFER];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!(libc::in6_pktinfo);
    let msg = recvmsg::<SockaddrIn6>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

    let mut ifindex = 0u32;
    for cmsg in msg.cmsgs().map_err(|e| io::Error::from_raw_os_error(e as i32))? {
        if let ControlMessageOwned::Ipv6PacketInfo(pktinfo) = cmsg {
            ifindex = pktinfo.ipi6_ifindex as u32;
        }
    }

    let addr = msg
        .address
        .map(|a| SocketAddrV6::new(a.ip(), a.port(), a.flowinfo(), a.scope_id()))
        .unwrap_or_else(|| SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));

    buf.truncate(msg.bytes);
    Ok((buf, addr, ifindex))
}

/// A raw `AF_PACKET`/`ETH_P_IPV6` socket for the NDP proxy engine
/// (SPEC_FULL §4.5). Not covered by `socket2`'s or `nix`'s safe
/// cross-platform surface, so built directly on `libc`.
pub struct PacketSocket {
    fd: RawFd,
    inner: AsyncFd<RawFd>,
}

const ETH_P_IPV6: u16 = 0x86DD;

impl PacketSocket {
    pub fn open_all_interfaces() -> io::Result<Self> {
        // SAFETY: a plain socket(2) call with constant, valid arguments.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
                (ETH_P_IPV6 as i32).to_be(),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(PacketSocket {
            fd,
            inner: AsyncFd::new(fd)?,
        })
    }

    pub async fn recv(&self) -> io::Result<(Vec<u8>, u32)> {
        loop {
            let mut guard = self.inner.readable().await?;
            let result = guard.try_io(|_| {
                let mut buf = vec![0u8; RECV_BUFFER];
                let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
                let mut addrlen = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                // SAFETY: `self.fd` is a valid, open AF_PACKET socket; `buf`
                // and `sll` are live and correctly sized for the call.
                let n = unsafe {
                    libc::recvfrom(
                        self.fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                        &mut sll as *mut _ as *mut libc::sockaddr,
                        &mut addrlen,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    buf.truncate(n as usize);
                    Ok((buf, sll.sll_ifindex as u32))
                }
            });
            match result {
                Ok(inner) => return inner,
                Err(_would_block) => continue,
            }
        }
    }

    /// Send a raw ND frame out `ifindex` to link-layer address `dest_mac`
    /// (the kernel builds the Ethernet header itself on a cooked
    /// `SOCK_DGRAM` packet socket, but still needs the destination hardware
    /// address supplied).
    pub async fn send_on(&self, buf: &[u8], ifindex: u32, dest_mac: [u8; 6]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            let result = guard.try_io(|_| {
                let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
                sll.sll_family = libc::AF_PACKET as u16;
                sll.sll_protocol = (ETH_P_IPV6 as u16).to_be();
                sll.sll_ifindex = ifindex as i32;
                sll.sll_halen = 6;
                sll.sll_addr[..6].copy_from_slice(&dest_mac);
                // SAFETY: `self.fd` is a valid, open AF_PACKET socket; `sll`
                // is a fully initialized, correctly sized sockaddr_ll.
                let n = unsafe {
                    libc::sendto(
                        self.fd,
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        0,
                        &sll as *const _ as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(inner) => return inner,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for PacketSocket {
    fn drop(&mut self) {
        // SAFETY: `self.fd` was opened by this struct and is closed exactly
        // once, here.
        if unsafe { libc::close(self.fd) } < 0 {
            warn!(error = %io::Error::last_os_error(), "failed to close packet socket");
        }
    }
}
