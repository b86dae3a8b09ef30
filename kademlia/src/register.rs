use std::collections::HashSet;

use crate::{address::Address, Uri};

/// Identifier the transport assigns to a live connection.
pub type ConnectionHandle = u64;

/// Which side opened a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// What the transport knows about one connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionDetails {
    /// Set once the handshake completed.
    pub address: Option<Address>,
    pub remote_host: Option<String>,
    /// For incoming connections this is the ephemeral port of the remote,
    /// not the one it listens on.
    pub remote_port: Option<u16>,
    pub direction: ConnectionDirection,
}

impl ConnectionDetails {
    pub fn is_incoming(&self) -> bool {
        self.direction == ConnectionDirection::Incoming
    }
}

/// Read side of the transport: who we are connected to.
pub trait ConnectionRegister: Send + Sync {
    /// Addresses we hold an outgoing connection to.
    fn outgoing_addresses(&self) -> HashSet<Address>;

    /// Addresses holding an incoming connection to us.
    fn incoming_addresses(&self) -> HashSet<Address>;

    /// Addresses connected in either direction.
    fn current_addresses(&self) -> HashSet<Address> {
        let mut addresses = self.outgoing_addresses();
        addresses.extend(self.incoming_addresses());
        addresses
    }

    fn outgoing_handle(&self, address: &Address) -> Option<ConnectionHandle>;

    fn incoming_handle(&self, address: &Address) -> Option<ConnectionHandle>;

    /// Returns `None` once the connection is gone.
    fn connection_details(&self, handle: ConnectionHandle) -> Option<ConnectionDetails>;
}

/// Connection changes the tracker asks the transport to make.
pub trait PeerConnectionList: Send + Sync {
    /// Keeps a connection to `uri` open, reconnecting when it drops.
    fn add_persistent_peer(&self, uri: &Uri);

    /// Stops reconnecting the connection behind `handle`.
    fn remove_persistent_peer(&self, handle: ConnectionHandle);

    /// Closes the connection behind `handle`.
    fn remove_connection(&self, handle: ConnectionHandle);
}
