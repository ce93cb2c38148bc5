//! Linux TUN device.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use byteorder::{BigEndian, ByteOrder};
use libc::{c_char, c_int, c_short, c_void, sockaddr_in, AF_INET};
use socket2::{Domain, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, trace};
use tun_tap::{Iface, Mode};

use crate::config::DevConfig;
use crate::relay::PacketDevice;

const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
const SIOCSIFADDR: libc::c_ulong = 0x8916;
const SIOCSIFDSTADDR: libc::c_ulong = 0x8918;
const SIOCSIFMTU: libc::c_ulong = 0x8922;

const IFF_UP: c_short = 0x1;
const IFF_RUNNING: c_short = 0x40;

/// Size of the packet information header (flags + protocol).
pub const PI_HEADER_SIZE: usize = 4;
const ETH_P_IP: u16 = 0x0800;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [c_char; 16],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

#[repr(C)]
struct IfReqAddr {
    ifr_name: [c_char; 16],
    ifr_addr: sockaddr_in,
    _pad: [u8; 8],
}

#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; 16],
    ifr_mtu: c_int,
    _pad: [u8; 20],
}

fn ifr_name(name: &str) -> [c_char; 16] {
    let mut buf = [0 as c_char; 16];
    for (i, byte) in name.bytes().take(15).enumerate() {
        buf[i] = byte as c_char;
    }
    buf
}

fn sockaddr(ip: Ipv4Addr) -> sockaddr_in {
    let mut sin: sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = u32::from_ne_bytes(ip.octets());
    sin
}

/// Run one interface ioctl on a throwaway datagram socket.
fn if_ioctl<T>(request: libc::c_ulong, req: &mut T) -> io::Result<()> {
    let control = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    let rc = unsafe { libc::ioctl(control.as_raw_fd(), request as _, req as *mut T as *mut c_void) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Strip the packet information header. `None` when the frame is not IPv4.
fn strip_packet_info(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < PI_HEADER_SIZE {
        return None;
    }
    let proto = BigEndian::read_u16(&frame[2..4]);
    if proto != ETH_P_IP {
        return None;
    }
    Some(&frame[PI_HEADER_SIZE..])
}

fn with_packet_info(packet: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PI_HEADER_SIZE + packet.len());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&ETH_P_IP.to_be_bytes());
    frame.extend_from_slice(packet);
    frame
}

/// The tunnel's virtual interface, registered with the reactor.
pub struct TunDevice {
    nic: AsyncFd<Iface>,
    packet_info: bool,
}

impl TunDevice {
    /// Create, address and bring up the interface described by `dev`.
    pub fn open(dev: &DevConfig, mtu: u16) -> Result<Self> {
        let nic = if dev.packet_info {
            Iface::new(&dev.name, Mode::Tun)
        } else {
            Iface::without_packet_info(&dev.name, Mode::Tun)
        }
        .with_context(|| format!("Failed to create TUN device {}", dev.name))?;
        info!("Created TUN device: {}", nic.name());

        let name = nic.name().to_string();
        set_mtu(&name, mtu).with_context(|| format!("Failed to set MTU on {}", name))?;
        if let Some(local) = dev.local {
            set_addr(&name, SIOCSIFADDR, local)
                .with_context(|| format!("Failed to set address {} on {}", local, name))?;
        }
        if let Some(peer) = dev.peer {
            set_addr(&name, SIOCSIFDSTADDR, peer)
                .with_context(|| format!("Failed to set destination {} on {}", peer, name))?;
        }
        set_up(&name).with_context(|| format!("Failed to bring up {}", name))?;

        set_nonblocking(&nic).context("Failed to make TUN device non-blocking")?;
        Ok(Self {
            nic: AsyncFd::new(nic)?,
            packet_info: dev.packet_info,
        })
    }

    pub fn name(&self) -> &str {
        self.nic.get_ref().name()
    }

    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.nic.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut *buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.nic.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(frame)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl PacketDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let nbytes = self.read_frame(buf).await?;
            if !self.packet_info || nbytes == 0 {
                return Ok(nbytes);
            }
            let len = match strip_packet_info(&buf[..nbytes]) {
                Some(packet) => packet.len(),
                None => {
                    trace!(bytes = nbytes, "skipping non-IPv4 frame");
                    continue;
                }
            };
            buf.copy_within(PI_HEADER_SIZE..nbytes, 0);
            return Ok(len);
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if !self.packet_info {
            return self.write_frame(packet).await;
        }
        let written = self.write_frame(&with_packet_info(packet)).await?;
        Ok(written.saturating_sub(PI_HEADER_SIZE))
    }
}

fn set_nonblocking(nic: &Iface) -> io::Result<()> {
    let fd = nic.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_mtu(name: &str, mtu: u16) -> io::Result<()> {
    let mut ifr = IfReqMtu {
        ifr_name: ifr_name(name),
        ifr_mtu: mtu as c_int,
        _pad: [0; 20],
    };
    if_ioctl(SIOCSIFMTU, &mut ifr)?;
    debug!("Set MTU to {} on {}", mtu, name);
    Ok(())
}

fn set_addr(name: &str, request: libc::c_ulong, ip: Ipv4Addr) -> io::Result<()> {
    let mut ifr = IfReqAddr {
        ifr_name: ifr_name(name),
        ifr_addr: sockaddr(ip),
        _pad: [0; 8],
    };
    if_ioctl(request, &mut ifr)?;
    debug!("Set address {} on {}", ip, name);
    Ok(())
}

fn set_up(name: &str) -> io::Result<()> {
    let mut ifr = IfReqFlags {
        ifr_name: ifr_name(name),
        ifr_flags: 0,
        _pad: [0; 22],
    };
    if_ioctl(SIOCGIFFLAGS, &mut ifr)?;
    ifr.ifr_flags |= IFF_UP | IFF_RUNNING;
    if_ioctl(SIOCSIFFLAGS, &mut ifr)?;
    info!("Interface {} is up", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifr_name_truncates() {
        let name = ifr_name("a-very-long-interface-name");
        assert_eq!(name[14], b't' as c_char);
        assert_eq!(name[15], 0);

        let short = ifr_name("tun0");
        assert_eq!(short[3], b'0' as c_char);
        assert_eq!(short[4], 0);
    }

    #[test]
    fn test_packet_info_round_trip() {
        let packet = [0x45u8, 0, 0, 20, 1, 2, 3, 4];
        let frame = with_packet_info(&packet);
        assert_eq!(&frame[..4], &[0, 0, 0x08, 0x00]);
        assert_eq!(strip_packet_info(&frame), Some(&packet[..]));
    }

    #[test]
    fn test_packet_info_skips_non_ipv4() {
        let ipv6 = [0u8, 0, 0x86, 0xdd, 0x60, 0, 0, 0];
        assert_eq!(strip_packet_info(&ipv6), None);
        assert_eq!(strip_packet_info(&[0, 0, 8]), None);
    }

    #[test]
    fn test_ifreq_layouts() {
        assert_eq!(std::mem::size_of::<IfReqFlags>(), 40);
        assert_eq!(std::mem::size_of::<IfReqAddr>(), 40);
        assert_eq!(std::mem::size_of::<IfReqMtu>(), 40);
    }

    #[test]
    fn test_sockaddr() {
        let sin = sockaddr(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(sin.sin_family, AF_INET as libc::sa_family_t);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [10, 0, 0, 1]);
    }
}
