mod connectivity;
mod desired;
mod pull;
mod resolution;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use muddle_core::{
    runtime::{sleep, Executor},
    task_group::{TaskGroup, TaskResult},
};

use crate::{
    address::Address,
    config::TrackerConfig,
    priority::{AddressPriority, PriorityCoefficients},
    protocol::{PeerTrackerClient, PeerTrackerProtocol, RpcClient, RpcServer, PEER_TRACKER_PROTOCOL},
    register::{ConnectionHandle, ConnectionRegister, PeerConnectionList},
    table::KademliaTable,
    utils::Timestamp,
    Error, Result, Uri,
};

use pull::PullState;
use resolution::ResolutionState;

/// Priority entries of one connectivity pool, by address.
pub type PriorityPool = HashMap<Address, AddressPriority>;

/// Keeps the node connected to the right peers.
///
/// Every `periodicity` milliseconds the tracker runs one tick of its
/// maintenance pipeline:
///
/// 1. trim expired desired peers and resolve desired uris
/// 2. connect to desired peers
/// 3. resolve new connection handles and pull peers from connected nodes
/// 4. connect to the best peers of the near and long-range pools
/// 5. tear down duplicate, self and unneeded connections
/// 6. refresh the snapshot of directly connected peers
/// 7. persist the table
///
/// Ticks never overlap. RPC calls run as tasks and their results are
/// applied whenever they complete, possibly during a later tick.
///
/// # Locking
///
/// State is split over six locks, always taken in this order: `core`,
/// `direct_connections`, `kademlia_priority`, `longrange_priority`, `pull`,
/// `uri_resolution`. Tracker locks may be held while calling into the table,
/// the table never calls back. No lock is held while spawning a task.
pub struct PeerTracker {
    own_address: Address,
    config: TrackerConfig,
    coefficients: PriorityCoefficients,

    table: Arc<KademliaTable>,
    register: Arc<dyn ConnectionRegister>,
    connections: Arc<dyn PeerConnectionList>,
    client: PeerTrackerClient,
    protocol: Arc<PeerTrackerProtocol>,

    core: Mutex<TrackerCore>,
    direct_connections: RwLock<HashSet<Address>>,
    kademlia_priority: Mutex<PriorityPool>,
    longrange_priority: Mutex<PriorityPool>,
    pull: Mutex<PullState>,
    uri_resolution: Mutex<ResolutionState>,

    /// Holds the tick loop and every in-flight RPC.
    task_group: TaskGroup,
    running: AtomicBool,
    ticking: AtomicBool,
}

/// Working sets derived during a tick.
#[derive(Default)]
struct TrackerCore {
    cycle: u64,
    kademlia_connections: HashSet<Address>,
    longrange_connections: HashSet<Address>,
    keep_connections: HashSet<Address>,
}

/// Snapshot of the tracker state.
#[derive(Clone, Debug, Default)]
pub struct TrackerStatus {
    pub is_running: bool,
    pub directly_connected_peers: HashSet<Address>,
    pub kademlia_connections: HashSet<Address>,
    pub longrange_connections: HashSet<Address>,
    pub keep_connections: HashSet<Address>,
    pub pulls_in_flight: usize,
    pub queued_pulls: usize,
    pub known_peers: usize,
    pub desired_peers: HashSet<Address>,
}

/// Connection state as seen by the register at the start of a tick.
struct ConnectionSnapshot {
    current: HashSet<Address>,
    incoming: HashSet<Address>,
    outgoing: HashSet<Address>,
}

impl ConnectionSnapshot {
    /// True if the only connection to `address` was opened by the peer.
    fn is_incoming_only(&self, address: &Address) -> bool {
        self.incoming.contains(address) && !self.outgoing.contains(address)
    }
}

impl PeerTracker {
    /// Creates a new tracker for the node at `own_address` and registers its
    /// protocol on `rpc_server`.
    pub fn new(
        own_address: Address,
        config: TrackerConfig,
        register: Arc<dyn ConnectionRegister>,
        connections: Arc<dyn PeerConnectionList>,
        rpc_client: Arc<dyn RpcClient>,
        rpc_server: &dyn RpcServer,
        ex: Executor,
    ) -> Result<Arc<Self>> {
        if config.kademlia_bucket_size == 0 || config.kademlia_bucket_count == 0 {
            return Err(Error::Config(
                "kademlia buckets must hold at least one peer".into(),
            ));
        }
        if config.periodicity == 0 {
            return Err(Error::Config("periodicity must not be zero".into()));
        }

        let table = Arc::new(KademliaTable::with_config(own_address, config.table_config()));
        let protocol = PeerTrackerProtocol::new(table.clone());
        rpc_server.add(PEER_TRACKER_PROTOCOL, protocol.clone());

        let client = PeerTrackerClient::new(
            rpc_client,
            Duration::from_millis(config.promise_timeout),
        );

        Ok(Arc::new(Self {
            own_address,
            coefficients: (&config).into(),
            config,
            table,
            register,
            connections,
            client,
            protocol,
            core: Mutex::new(TrackerCore::default()),
            direct_connections: RwLock::new(HashSet::new()),
            kademlia_priority: Mutex::new(HashMap::new()),
            longrange_priority: Mutex::new(HashMap::new()),
            pull: Mutex::new(PullState::default()),
            uri_resolution: Mutex::new(ResolutionState::default()),
            task_group: TaskGroup::with_executor(ex),
            running: AtomicBool::new(false),
            ticking: AtomicBool::new(false),
        }))
    }

    /// Starts the periodic tick. The table is first restored from its cache
    /// file, if one is set.
    ///
    /// Calling `start` on a running tracker does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self.table.load() {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        info!("Start peer tracker for {}", self.own_address);
        let this = self.clone();
        let period = Duration::from_millis(self.config.periodicity);
        self.task_group.spawn(
            async move {
                loop {
                    this.periodically();
                    sleep(period).await;
                }
            },
            |res| async move {
                if let TaskResult::Completed(()) = res {
                    error!("Peer tracker loop exited");
                }
            },
        );

        Ok(())
    }

    /// Stops the tracker and forgets every desired peer, pending pull,
    /// pending resolution and pool entry.
    ///
    /// Outstanding RPC calls are dropped, their results are ignored. Must
    /// not be called from a task owned by the tracker.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stop peer tracker for {}", self.own_address);
        self.task_group.cancel().await;

        self.table.clear_desired();
        *self.core.lock() = TrackerCore::default();
        self.direct_connections.write().clear();
        self.kademlia_priority.lock().clear();
        self.longrange_priority.lock().clear();
        *self.pull.lock() = PullState::default();
        *self.uri_resolution.lock() = ResolutionState::default();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one tick of the maintenance pipeline.
    ///
    /// Does nothing if the tracker is stopped or a tick is already running.
    pub fn periodically(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }

        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!("Skip overlapping tick");
            return;
        }

        if let Err(err) = self.tick() {
            error!("Peer tracker tick failed: {err}");
        }

        self.ticking.store(false, Ordering::SeqCst);
    }

    fn tick(self: &Arc<Self>) -> Result<()> {
        let snapshot = ConnectionSnapshot {
            current: self.register.current_addresses(),
            incoming: self.register.incoming_addresses(),
            outgoing: self.register.outgoing_addresses(),
        };

        let cycle = {
            let mut core = self.core.lock();
            core.keep_connections.clear();
            core.cycle += 1;
            core.cycle - 1
        };

        // 1. Bookkeeping
        if self.config.allow_connection_expiry {
            self.table.trim_desired_peers();
            self.expire_pool_entries();
        }

        // 2. Desired peers
        if self.config.allow_desired_connections {
            self.table.convert_desired_uris_to_addresses();
            self.connect_to_desired_uris();
            self.connect_to_desired_peers(&snapshot);
        }

        // 3. Resolution and pulls
        if self.config.register_connections {
            self.process_connection_handles();
        }

        let tracking_cycle = cycle % self.config.tracking_interval.max(1) == 0;
        if tracking_cycle
            && (self.config.connect_to_nearest || self.config.long_range_connectivity)
        {
            self.add_most_promising_peers(&snapshot);
        }

        if self.config.pull_peers {
            if tracking_cycle {
                self.track(self.own_address);
            }
            self.start_pulls(&snapshot);
        }

        // 4. Connectivity
        if self.config.connect_to_nearest {
            self.connect_to_nearest(&snapshot);
        }

        if self.config.long_range_connectivity {
            self.connect_to_long_range(&snapshot);
        }

        // 5. Disconnections
        if self.config.disconnect_from_self {
            self.disconnect_from_self();
        }

        if self.config.disconnect_duplicates {
            self.disconnect_duplicates();
        }

        if self.config.trim_peer_list {
            self.disconnect_unneeded();
        }

        // 6. Snapshot
        self.update_direct_connections();

        // 7. Persist
        self.table.dump()?;

        debug!(
            "Tick {cycle}: {} connected, {} kept, {} known",
            snapshot.current.len(),
            self.core.lock().keep_connections.len(),
            self.table.size()
        );
        Ok(())
    }

    /// Refreshes the addresses connected in either direction whose
    /// connection still resolves.
    fn update_direct_connections(&self) {
        let connected: HashSet<Address> = self
            .register
            .current_addresses()
            .into_iter()
            .filter(|address| {
                let handles = [
                    self.register.outgoing_handle(address),
                    self.register.incoming_handle(address),
                ];
                handles
                    .into_iter()
                    .flatten()
                    .any(|handle| self.register.connection_details(handle).is_some())
            })
            .collect();

        *self.direct_connections.write() = connected;
    }

    /// Queues a transport connection for address and uri resolution.
    pub fn add_connection_handle_to_queue(&self, handle: ConnectionHandle) {
        self.uri_resolution.lock().handles.push_back(handle);
    }

    /// Adjusts the behaviour score of a peer in both pools.
    pub fn report_behaviour(&self, address: &Address, delta: f64) {
        for pool in [&self.kademlia_priority, &self.longrange_priority] {
            if let Some(entry) = pool.lock().get_mut(address) {
                entry.connection_value += delta;
            }
        }
    }

    /// Marks a peer for teardown on the next tick.
    pub fn schedule_disconnect(&self, address: &Address) {
        for pool in [&self.kademlia_priority, &self.longrange_priority] {
            if let Some(entry) = pool.lock().get_mut(address) {
                entry.schedule_disconnect();
            }
        }
    }

    /// Sets the ports advertised through `GET_MUDDLE_PORTS`.
    pub fn set_muddle_ports(&self, ports: Vec<u16>) {
        self.protocol.set_ports(ports);
    }

    /// Sets the uris advertised through `GET_MUDDLE_URIS`.
    pub fn set_muddle_uris(&self, uris: Vec<Uri>) {
        self.protocol.set_uris(uris);
    }

    /// Keeps a connection to `address` until `expiry`, or forever if `None`.
    pub fn add_desired_peer(&self, address: &Address, expiry: Option<Timestamp>) {
        self.table.add_desired_peer(address, expiry);
    }

    /// Same as [`PeerTracker::add_desired_peer`], with a known way to reach
    /// the peer.
    pub fn add_desired_peer_with_hint(&self, hint: &crate::PeerInfo, expiry: Option<Timestamp>) {
        self.table.add_desired_peer_with_hint(hint, expiry);
    }

    /// Keeps a connection to `uri` until `expiry`, or forever if `None`.
    pub fn add_desired_uri(&self, uri: &Uri, expiry: Option<Timestamp>) {
        self.table.add_desired_uri(uri, expiry);
    }

    pub fn remove_desired_peer(&self, address: &Address) {
        self.table.remove_desired_peer(address);
    }

    pub fn remove_desired_uri(&self, uri: &Uri) {
        self.table.remove_desired_uri(uri);
    }

    pub fn own_address(&self) -> Address {
        self.own_address
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<KademliaTable> {
        &self.table
    }

    /// Returns a copy of the near pool.
    pub fn connection_priority(&self) -> PriorityPool {
        self.kademlia_priority.lock().clone()
    }

    /// Returns a copy of the long-range pool.
    pub fn longrange_priority(&self) -> PriorityPool {
        self.longrange_priority.lock().clone()
    }

    /// Addresses connected in either direction, as of the last tick.
    pub fn directly_connected_peers(&self) -> HashSet<Address> {
        self.direct_connections.read().clone()
    }

    pub fn status(&self) -> TrackerStatus {
        let (kademlia_connections, longrange_connections, keep_connections) = {
            let core = self.core.lock();
            (
                core.kademlia_connections.clone(),
                core.longrange_connections.clone(),
                core.keep_connections.clone(),
            )
        };
        let directly_connected_peers = self.direct_connections.read().clone();
        let (pulls_in_flight, queued_pulls) = {
            let pull = self.pull.lock();
            (pull.in_flight.len(), pull.queue.len())
        };

        TrackerStatus {
            is_running: self.is_running(),
            directly_connected_peers,
            kademlia_connections,
            longrange_connections,
            keep_connections,
            pulls_in_flight,
            queued_pulls,
            known_peers: self.table.size(),
            desired_peers: self.table.desired_peers(),
        }
    }

    /// Asks the transport to drop our outgoing connection to `address`.
    fn drop_outgoing(&self, address: &Address) {
        if let Some(handle) = self.register.outgoing_handle(address) {
            warn!("Dropping connection to {address}");
            self.connections.remove_persistent_peer(handle);
            self.connections.remove_connection(handle);
        }
    }
}
