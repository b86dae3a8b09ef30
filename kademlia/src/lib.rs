//! Kademlia peer table and peer tracker for the muddle overlay network.
//!
//! The [`KademliaTable`] stores every known peer in XOR distance buckets and
//! answers nearest peer lookups. The [`PeerTracker`] runs on a fixed period
//! and keeps the node connected to its desired peers and to the best peers
//! of the table, pulling more peers from connected nodes over RPC.
//!
//! The transport and the RPC framework are provided by the caller through
//! the [`ConnectionRegister`], [`PeerConnectionList`], [`RpcClient`] and
//! [`RpcServer`] traits.
//!
//! # Example
//! ```
//! use muddle_kademlia::{Address, KademliaTable, PeerInfo, Uri};
//!
//! let table = KademliaTable::new(Address([0; 32]));
//!
//! let peer = PeerInfo::with_uri(Address([1; 32]), "tcp://10.0.0.1:8000".parse().unwrap());
//! table.report_existence(&peer, &Address([0; 32]));
//!
//! let found = table.find_peer(&Address([1; 32]));
//! assert_eq!(found[0].address, Address([1; 32]));
//! ```
//!
mod address;
mod config;
mod error;
mod priority;
mod register;
mod table;
mod tracker;
mod uri;
mod utils;

/// Defines the peer tracker RPC surface and the RPC boundary traits.
pub mod protocol;

pub use address::{
    distance, Address, KademliaAddress, KademliaDistance, ADDRESS_SIZE, KADEMLIA_ADDRESS_SIZE,
    KADEMLIA_MAX_ID,
};
pub use config::{TableConfig, TrackerConfig};
pub use error::{Error, Result};
pub use priority::{sort_by_priority, AddressPriority, PriorityCoefficients};
pub use protocol::{PeerTrackerProtocol, RpcClient, RpcServer, RpcService};
pub use register::{
    ConnectionDetails, ConnectionDirection, ConnectionHandle, ConnectionRegister,
    PeerConnectionList,
};
pub use table::{
    bucket_by_hamming, bucket_by_logarithm, Bucket, BucketKind, KademliaTable, PeerInfo, UriInfo,
    BUCKET_COUNT, BUCKET_SIZE,
};
pub use tracker::{PeerTracker, PriorityPool, TrackerStatus};
pub use uri::Uri;
pub use utils::{now, Timestamp};
