use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;

use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use crate::frame::ECHO_REQUEST;
use crate::relay::{DatagramSource, IcmpTransmit, MAX_DATAGRAM};

/// `ICMP_FILTER` option on `SOL_RAW` sockets (linux/icmp.h).
const ICMP_FILTER: libc::c_int = 1;

fn ip_to_socket(ip: Ipv4Addr) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(ip), 0)
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the layout of u8 and the kernel only ever
    // writes initialized bytes into the buffer.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

/// Non-blocking raw IPv4 ICMP socket.
///
/// Datagrams received on it include the IPv4 header.
#[derive(Debug)]
pub struct IcmpSocketV4 {
    socket: AsyncFd<Socket>,
}

impl IcmpSocketV4 {
    /// Socket for sending tunnel frames. Every inbound ICMP type is filtered
    /// out, so reads only ever drain stray datagrams.
    pub fn sender() -> Result<Self> {
        let socket = Self::open()?;
        socket
            .set_icmp_filter(u32::MAX)
            .context("Failed to set ICMP filter on send socket")?;
        Ok(socket)
    }

    /// Socket standing in for the divert path: the kernel hands it a copy of
    /// every inbound Echo Request and nothing else.
    pub fn divert() -> Result<Self> {
        let socket = Self::open()?;
        socket
            .set_icmp_filter(!(1u32 << ECHO_REQUEST))
            .context("Failed to set ICMP filter on divert socket")?;
        Ok(socket)
    }

    fn open() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
            if e.raw_os_error() == Some(libc::EPERM) {
                anyhow!(
                    "Insufficient permissions for raw ICMP sockets.\n\n\
                     Fix options:\n\
                     \u{2022} Run as root\n\
                     \u{2022} Add capabilities: sudo setcap cap_net_raw,cap_net_admin+ep {}",
                    std::env::current_exe()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| "pingtun".to_string())
                )
            } else {
                anyhow!(e).context("Failed to create raw ICMP socket")
            }
        })?;
        socket.set_nonblocking(true)?;
        if let Err(e) = socket.set_recv_buffer_size(MAX_DATAGRAM) {
            warn!("Failed to set ICMP receive buffer size: {}", e);
        }
        debug!(fd = socket.as_raw_fd(), "opened raw ICMP socket");

        Ok(Self {
            socket: AsyncFd::new(socket)?,
        })
    }

    /// Block every ICMP type whose bit is set in `mask`.
    fn set_icmp_filter(&self, mask: u32) -> io::Result<()> {
        let fd = self.socket.get_ref().as_raw_fd();
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_RAW,
                ICMP_FILTER,
                &mask as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub async fn send_to(&self, dest: Ipv4Addr, bytes: &[u8]) -> io::Result<usize> {
        let dest: SockAddr = ip_to_socket(dest).into();
        loop {
            let mut guard = self.socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(bytes, &dest)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn rcv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
        loop {
            let mut guard = self.socket.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv_from(as_uninit(&mut *buf))) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl IcmpTransmit for IcmpSocketV4 {
    async fn send_to(&self, frame: &[u8], peer: Ipv4Addr) -> io::Result<usize> {
        IcmpSocketV4::send_to(self, peer, frame).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _) = self.rcv_from(buf).await?;
        Ok(n)
    }
}

impl DatagramSource for IcmpSocketV4 {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        let (n, addr) = self.rcv_from(buf).await?;
        let source = addr
            .as_socket_ipv4()
            .map(|sa| *sa.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IPv4 source address"))?;
        Ok((n, source))
    }
}
