use std::cmp::Reverse;

use bincode::{Decode, Encode};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, KademliaAddress, KademliaDistance},
    utils::{now, Timestamp},
    Uri,
};

/// Everything the table knows about one peer.
///
/// Only `address`, `kademlia_address`, `distance` and `uri` carry meaning
/// across the wire and across restarts, the counters are local bookkeeping.
#[derive(Clone, Debug, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeerInfo {
    pub address: Address,
    pub kademlia_address: KademliaAddress,
    /// Distance to the address of the last lookup, recomputed per query.
    pub distance: KademliaDistance,
    pub uri: Option<Uri>,
    /// Set once we connected to the peer ourselves.
    pub verified: bool,

    pub connection_attempts: u64,
    pub failed_attempts: u64,
    pub connections: u64,
    pub message_count: u64,

    pub last_reporter: Option<Address>,
    pub first_seen: Timestamp,
    pub last_activity: Timestamp,
    pub earliest_next_attempt: Option<Timestamp>,
}

impl PeerInfo {
    /// Creates a new record for the given address.
    pub fn new(address: Address) -> Self {
        let now = now();
        Self {
            address,
            kademlia_address: KademliaAddress::create(&address),
            distance: KademliaDistance::default(),
            uri: None,
            verified: false,
            connection_attempts: 0,
            failed_attempts: 0,
            connections: 0,
            message_count: 0,
            last_reporter: None,
            first_seen: now,
            last_activity: now,
            earliest_next_attempt: None,
        }
    }

    /// Creates a new record for the given address reachable at `uri`.
    pub fn with_uri(address: Address, uri: Uri) -> Self {
        let mut info = Self::new(address);
        info.uri = Some(uri);
        info
    }

    /// Returns the uri of the peer if it is a valid one.
    pub fn valid_uri(&self) -> Option<&Uri> {
        self.uri.as_ref().filter(|uri| uri.is_valid())
    }

    /// Ordering key used to pick which peer leaves a full bucket; the
    /// smallest key is evicted first.
    ///
    /// Verified peers outrank unverified ones, then the most recently active,
    /// then the one with fewer failures. The address breaks remaining ties.
    pub(crate) fn eviction_rank(&self) -> (bool, Timestamp, Reverse<u64>, Address) {
        (
            self.verified,
            self.last_activity,
            Reverse(self.failed_attempts),
            self.address,
        )
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

/// Connection bookkeeping for a uri, kept apart from the address keyed
/// knowledge since a uri may be dialed before its address is known.
#[derive(Clone, Debug, Default)]
pub struct UriInfo {
    pub address: Option<Address>,
    pub connection_attempts: u64,
    pub failed_attempts: u64,
    pub connections: u64,
    pub last_activity: Timestamp,
    pub earliest_next_attempt: Option<Timestamp>,
}

impl UriInfo {
    /// Returns true if the uri may be dialed at the given time.
    pub fn may_connect(&self, at: Timestamp) -> bool {
        self.earliest_next_attempt.map_or(true, |t| t <= at)
    }
}
