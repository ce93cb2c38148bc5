//! Linux plumbing: the TUN device and raw ICMP sockets.
//!
//! Linux has no divert sockets. Inbound tunnel frames are read from a raw ICMP
//! socket that only passes Echo Requests, so the host must not answer pings
//! itself (`net.ipv4.icmp_echo_ignore_all = 1`).
//!
//! Frames a responder sends are Echo Replies, which the initiator never
//! decodes. Traffic from the responder back to the initiator therefore needs a
//! packet-filter rule on the initiator host that turns those replies into
//! Echo Requests before they are delivered; without it the tunnel only
//! carries initiator-to-responder traffic.

pub mod icmp_socket;
pub mod tun;

pub use icmp_socket::IcmpSocketV4;
pub use tun::TunDevice;
