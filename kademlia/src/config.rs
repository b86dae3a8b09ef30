use crate::table::{BUCKET_COUNT, BUCKET_SIZE};

/// The configuration for the [`crate::PeerTracker`].
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /////////////////
    // STAGES
    ////////////////
    /// Connect to desired peers and desired uris.
    pub allow_desired_connections: bool,
    /// Resolve queued connection handles and register their details in the
    /// table.
    pub register_connections: bool,
    /// Pull peer knowledge from connected peers with `FIND_PEERS`.
    pub pull_peers: bool,
    /// Maintain connections to the highest priority peers of the near
    /// (kademlia) pool.
    pub connect_to_nearest: bool,
    /// Tear down our outgoing leg when a peer is connected both ways and
    /// holds the higher address.
    pub disconnect_duplicates: bool,
    /// Tear down outgoing connections that were not kept this tick.
    pub trim_peer_list: bool,
    /// Maintain connections to the highest priority peers of the long-range
    /// (hamming) pool.
    pub long_range_connectivity: bool,
    /// Tear down any connection to our own address.
    pub disconnect_from_self: bool,
    /// Drop desired peers and temporary pool entries once they expire.
    pub allow_connection_expiry: bool,

    /////////////////
    // LIMITS
    ////////////////
    /// The maximum number of outgoing connections kept for the near pool.
    pub max_kademlia_connections: usize,
    /// The maximum number of outgoing connections kept for the long-range
    /// pool.
    pub max_longrange_connections: usize,
    /// The maximum number of connections opened for desired peers per tick.
    pub max_desired_connections: usize,
    /// The maximum number of temporary (non persistent) links in the near
    /// pool.
    pub max_shortlived_connections: usize,
    /// The maximum number of `FIND_PEERS` calls in flight.
    pub max_discovery_tasks: usize,
    /// The number of connected peers queried for a single pull target.
    pub async_calls: usize,

    /////////////////
    // PRIORITY
    ////////////////
    /// Steepness of the desired expiry curve, per second.
    pub expiry_decay: f64,
    /// Steepness of the bucket curve, per bucket.
    pub bucket_decay: f64,
    /// Steepness of the connection time curve, per second.
    pub connectivity_decay: f64,
    /// Steepness of the behaviour curve, per unit of connection value.
    pub behaviour_decay: f64,
    /// Priority above which a temporary link is upgraded to a persistent one.
    pub persistent_threshold: f64,

    /////////////////
    // TABLE
    ////////////////
    /// The number of peers held per bucket.
    pub kademlia_bucket_size: usize,
    /// The number of buckets in each bucket array.
    pub kademlia_bucket_count: usize,

    /////////////////
    // TIMING
    ////////////////
    /// Timeout for every tracker RPC call, in milliseconds.
    pub promise_timeout: u64,
    /// Interval between two ticks, in milliseconds.
    pub periodicity: u64,
    /// Lifetime of the temporary pool entries learned from a pull, in
    /// seconds.
    pub default_connection_expiry: u64,
    /// Minimum time before the same peer is pulled from again, in seconds.
    pub pull_cooldown: u64,
    /// Number of ticks between two pulls for our own address.
    pub tracking_interval: u64,
}

impl TrackerConfig {
    /// Returns a configuration with every stage disabled.
    pub fn all_off() -> Self {
        Self {
            allow_desired_connections: false,
            register_connections: false,
            pull_peers: false,
            connect_to_nearest: false,
            disconnect_duplicates: false,
            trim_peer_list: false,
            long_range_connectivity: false,
            disconnect_from_self: false,
            allow_connection_expiry: false,
            ..Default::default()
        }
    }

    /// Returns the table configuration derived from this configuration.
    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            bucket_size: self.kademlia_bucket_size,
            bucket_count: self.kademlia_bucket_count,
            ..Default::default()
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            allow_desired_connections: true,
            register_connections: true,
            pull_peers: true,
            connect_to_nearest: true,
            disconnect_duplicates: true,
            trim_peer_list: true,
            long_range_connectivity: true,
            disconnect_from_self: true,
            allow_connection_expiry: true,

            max_kademlia_connections: 3,
            max_longrange_connections: 1,
            max_desired_connections: 16,
            max_shortlived_connections: 2,
            max_discovery_tasks: 3,
            async_calls: 3,

            expiry_decay: 0.05,
            bucket_decay: 0.1,
            connectivity_decay: 0.005,
            behaviour_decay: 0.5,
            persistent_threshold: 0.5,

            kademlia_bucket_size: BUCKET_SIZE,
            kademlia_bucket_count: BUCKET_COUNT,

            promise_timeout: 30_000,
            periodicity: 1_000,
            default_connection_expiry: 300,
            pull_cooldown: 300,
            tracking_interval: 32,
        }
    }
}

/// The configuration for the [`crate::KademliaTable`].
#[derive(Clone, Debug)]
pub struct TableConfig {
    /// The number of peers held per bucket.
    pub bucket_size: usize,
    /// The number of buckets in each bucket array.
    pub bucket_count: usize,
    /// Consecutive failures after which a peer is removed from the buckets.
    pub max_failures: u64,
    /// The maximum number of peers returned by a lookup.
    pub find_peer_limit: usize,
    /// Base delay before reconnecting to a uri that failed, in seconds.
    pub retry_base_delay: u64,
    /// Maximum delay before reconnecting to a uri that failed, in seconds.
    pub retry_max_delay: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            bucket_size: BUCKET_SIZE,
            bucket_count: BUCKET_COUNT,
            max_failures: 3,
            find_peer_limit: BUCKET_SIZE,
            retry_base_delay: 5,
            retry_max_delay: 600,
        }
    }
}
