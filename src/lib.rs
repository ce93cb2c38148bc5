//! Tunnel IP traffic inside ICMP Echo packets.
//!
//! The platform-independent core lives in [`checksum`], [`frame`], [`role`],
//! [`keepalive`] and [`relay`]; [`linux`] provides the devices it runs on.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod relay;
pub mod role;

#[cfg(target_os = "linux")]
pub mod linux;
