//! Per-peer session lifecycle: `Connecting -> Active -> Disconnected`.
//!
//! Stream and broker adapters wrap every peer in a [`Session`]. The session
//! is the only thing that calls `observe`/`forget` for its peer, so
//! membership always follows the transport's view of the connection.

use crate::{peer::Peer, registry::Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Disconnected,
}

pub struct Session<P: Peer> {
    peer: P,
    state: SessionState,
    registry: Registry<P>,
}

impl<P: Peer> Session<P> {
    pub fn new(peer: P, registry: Registry<P>) -> Self {
        Self {
            peer,
            state: SessionState::Connecting,
            registry,
        }
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Accepts one well-formed unit from the peer.
    ///
    /// The first unit activates the session and registers the peer. Returns
    /// the unit when it should be broadcast, `None` for blank units or once
    /// the session has been closed.
    pub fn receive<'a>(&mut self, unit: &'a [u8]) -> Option<&'a [u8]> {
        match self.state {
            SessionState::Disconnected => return None,
            SessionState::Connecting => {
                self.registry.observe(&self.peer);
                self.state = SessionState::Active;
            }
            SessionState::Active => {}
        }
        (!unit.is_empty()).then_some(unit)
    }

    /// Ends the session and deregisters the peer. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == SessionState::Active {
            self.registry.forget(&self.peer);
        }
        self.state = SessionState::Disconnected;
    }
}

impl<P: Peer> Drop for Session<P> {
    fn drop(&mut self) {
        self.close();
    }
}
