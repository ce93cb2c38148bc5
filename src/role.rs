use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::NoPeer;

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Knows the remote up front and sends Echo Requests.
    Initiator,
    /// Learns the remote from inbound traffic and answers with Echo Replies.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

/// When a Responder commits to a peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindPolicy {
    /// First datagram that decodes as tunnel payload.
    #[default]
    Tunnel,
    /// First diverted datagram of any kind, before it is classified.
    Any,
}

/// Role plus the peer it talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleState {
    role: Role,
    peer: Option<Ipv4Addr>,
}

impl RoleState {
    pub fn initiator(peer: Ipv4Addr) -> Self {
        Self {
            role: Role::Initiator,
            peer: Some(peer),
        }
    }

    pub fn responder() -> Self {
        Self {
            role: Role::Responder,
            peer: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Result<Ipv4Addr, NoPeer> {
        self.peer.ok_or(NoPeer)
    }

    pub fn is_bound(&self) -> bool {
        self.peer.is_some()
    }

    /// Bind the Responder to `addr` unless a peer is already known.
    ///
    /// Returns true only for the call that performed the binding. Initiators
    /// keep their configured peer.
    pub fn bind_peer(&mut self, addr: Ipv4Addr) -> bool {
        if self.role != Role::Responder || self.peer.is_some() {
            return false;
        }
        self.peer = Some(addr);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_peer_fixed() {
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let mut state = RoleState::initiator(peer);
        assert_eq!(state.role(), Role::Initiator);
        assert_eq!(state.peer(), Ok(peer));

        assert!(!state.bind_peer(Ipv4Addr::new(192, 0, 2, 99)));
        assert_eq!(state.peer(), Ok(peer));
    }

    #[test]
    fn test_responder_first_bind_wins() {
        let mut state = RoleState::responder();
        assert_eq!(state.peer(), Err(NoPeer));
        assert!(!state.is_bound());

        let first = Ipv4Addr::new(203, 0, 113, 5);
        assert!(state.bind_peer(first));
        assert!(!state.bind_peer(Ipv4Addr::new(203, 0, 113, 9)));
        assert!(!state.bind_peer(first));
        assert_eq!(state.peer(), Ok(first));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Initiator.to_string(), "initiator");
        assert_eq!(Role::Responder.to_string(), "responder");
    }
}
