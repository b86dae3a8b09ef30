#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use muddle_core::runtime::global_executor;
use muddle_kademlia::{
    protocol::PEER_TRACKER_SERVICE, Address, ConnectionDetails, ConnectionDirection,
    ConnectionHandle, ConnectionRegister, Error, PeerConnectionList, PeerTracker, Result,
    RpcClient, RpcServer, RpcService, TrackerConfig, Uri, ADDRESS_SIZE,
};

pub const HOST: &str = "127.0.0.1";

pub fn address(seed: u8) -> Address {
    Address([seed; ADDRESS_SIZE])
}

pub fn port(seed: u8) -> u16 {
    8000 + seed as u16
}

pub fn uri(seed: u8) -> Uri {
    Uri::from_host_port(HOST, port(seed)).unwrap()
}

/// All stages off, one tick on start and then only manual ticks.
pub fn test_config() -> TrackerConfig {
    TrackerConfig {
        periodicity: 3_600_000,
        promise_timeout: 1_000,
        ..TrackerConfig::all_off()
    }
}

/// Gives spawned RPC calls time to complete.
pub async fn settle() {
    smol::Timer::after(Duration::from_millis(150)).await;
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Connection {
    handle: ConnectionHandle,
    from: Address,
    to: Address,
}

struct NodeState {
    port: u16,
    services: HashMap<u8, Arc<dyn RpcService>>,
    tracker: Weak<PeerTracker>,
    responsive: bool,
}

/// In-memory network routing connections and RPC calls between trackers.
pub struct Network {
    nodes: RwLock<HashMap<Address, NodeState>>,
    connections: Mutex<Vec<Connection>>,
    next_handle: AtomicU64,
}

pub struct TestNode {
    pub address: Address,
    pub uri: Uri,
    pub tracker: Arc<PeerTracker>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        init_logger();
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            connections: Mutex::new(vec![]),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn add_node(self: &Arc<Self>, seed: u8, config: TrackerConfig) -> TestNode {
        self.try_add_node(seed, config).unwrap()
    }

    pub fn try_add_node(self: &Arc<Self>, seed: u8, config: TrackerConfig) -> Result<TestNode> {
        let address = address(seed);
        self.nodes.write().insert(
            address,
            NodeState {
                port: port(seed),
                services: HashMap::new(),
                tracker: Weak::new(),
                responsive: true,
            },
        );

        let rpc = Arc::new(FakeRpc {
            network: self.clone(),
            me: address,
        });
        let tracker = PeerTracker::new(
            address,
            config,
            Arc::new(FakeRegister {
                network: self.clone(),
                me: address,
            }),
            Arc::new(FakeConnections {
                network: self.clone(),
                me: address,
            }),
            rpc.clone(),
            rpc.as_ref(),
            global_executor(),
        )?;

        if let Some(node) = self.nodes.write().get_mut(&address) {
            node.tracker = Arc::downgrade(&tracker);
        }

        Ok(TestNode {
            address,
            uri: uri(seed),
            tracker,
        })
    }

    /// Opens a connection and hands its handle to both trackers.
    pub fn connect(&self, from: &Address, to: &Address) -> Option<ConnectionHandle> {
        let trackers = {
            let nodes = self.nodes.read();
            if !nodes.contains_key(to) {
                return None;
            }
            [from, to]
                .iter()
                .filter_map(|a| nodes.get(a).and_then(|n| n.tracker.upgrade()))
                .collect::<Vec<_>>()
        };

        let handle = {
            let mut connections = self.connections.lock();
            if let Some(c) = connections.iter().find(|c| c.from == *from && c.to == *to) {
                return Some(c.handle);
            }
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
            connections.push(Connection {
                handle,
                from: *from,
                to: *to,
            });
            handle
        };

        for tracker in trackers {
            tracker.add_connection_handle_to_queue(handle);
        }
        Some(handle)
    }

    pub fn disconnect(&self, handle: ConnectionHandle) {
        self.connections.lock().retain(|c| c.handle != handle);
    }

    pub fn has_connection(&self, from: &Address, to: &Address) -> bool {
        self.connections
            .lock()
            .iter()
            .any(|c| c.from == *from && c.to == *to)
    }

    pub fn outgoing(&self, from: &Address) -> HashSet<Address> {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.from == *from)
            .map(|c| c.to)
            .collect()
    }

    pub fn set_responsive(&self, address: &Address, responsive: bool) {
        if let Some(node) = self.nodes.write().get_mut(address) {
            node.responsive = responsive;
        }
    }

    fn is_connected(&self, a: &Address, b: &Address) -> bool {
        self.has_connection(a, b) || self.has_connection(b, a)
    }

    fn address_by_port(&self, port: u16) -> Option<Address> {
        self.nodes
            .read()
            .iter()
            .find(|(_, node)| node.port == port)
            .map(|(address, _)| *address)
    }

    fn port_of(&self, address: &Address) -> Option<u16> {
        self.nodes.read().get(address).map(|node| node.port)
    }
}

struct FakeRegister {
    network: Arc<Network>,
    me: Address,
}

impl ConnectionRegister for FakeRegister {
    fn outgoing_addresses(&self) -> HashSet<Address> {
        self.network.outgoing(&self.me)
    }

    fn incoming_addresses(&self) -> HashSet<Address> {
        self.network
            .connections
            .lock()
            .iter()
            .filter(|c| c.to == self.me)
            .map(|c| c.from)
            .collect()
    }

    fn outgoing_handle(&self, address: &Address) -> Option<ConnectionHandle> {
        self.network
            .connections
            .lock()
            .iter()
            .find(|c| c.from == self.me && c.to == *address)
            .map(|c| c.handle)
    }

    fn incoming_handle(&self, address: &Address) -> Option<ConnectionHandle> {
        self.network
            .connections
            .lock()
            .iter()
            .find(|c| c.to == self.me && c.from == *address)
            .map(|c| c.handle)
    }

    fn connection_details(&self, handle: ConnectionHandle) -> Option<ConnectionDetails> {
        let (from, to) = {
            let connections = self.network.connections.lock();
            let c = connections.iter().find(|c| c.handle == handle)?;
            (c.from, c.to)
        };

        if from == self.me {
            Some(ConnectionDetails {
                address: Some(to),
                remote_host: Some(HOST.to_string()),
                remote_port: self.network.port_of(&to),
                direction: ConnectionDirection::Outgoing,
            })
        } else if to == self.me {
            Some(ConnectionDetails {
                address: Some(from),
                remote_host: Some(HOST.to_string()),
                remote_port: Some(40_000 + handle as u16),
                direction: ConnectionDirection::Incoming,
            })
        } else {
            None
        }
    }
}

struct FakeConnections {
    network: Arc<Network>,
    me: Address,
}

impl PeerConnectionList for FakeConnections {
    fn add_persistent_peer(&self, uri: &Uri) {
        let target = uri.port().and_then(|port| self.network.address_by_port(port));
        if let Some(target) = target {
            self.network.connect(&self.me, &target);
        }
    }

    fn remove_persistent_peer(&self, _handle: ConnectionHandle) {}

    fn remove_connection(&self, handle: ConnectionHandle) {
        self.network.disconnect(handle);
    }
}

struct FakeRpc {
    network: Arc<Network>,
    me: Address,
}

#[async_trait]
impl RpcClient for FakeRpc {
    async fn call_specific_address(
        &self,
        address: &Address,
        service: u16,
        protocol: u8,
        method: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        if service != PEER_TRACKER_SERVICE {
            return Err(Error::Rpc(format!("unknown service {service}")));
        }

        if !self.network.is_connected(&self.me, address) {
            return Err(Error::Rpc("not connected".into()));
        }

        let service = {
            let nodes = self.network.nodes.read();
            let node = nodes
                .get(address)
                .ok_or_else(|| Error::Rpc("unknown node".into()))?;
            if !node.responsive {
                return Err(Error::Rpc("no response".into()));
            }
            node.services
                .get(&protocol)
                .cloned()
                .ok_or_else(|| Error::Rpc(format!("unknown protocol {protocol}")))?
        };

        service.call(method, &payload).await
    }
}

impl RpcServer for FakeRpc {
    fn add(&self, protocol: u8, service: Arc<dyn RpcService>) {
        if let Some(node) = self.network.nodes.write().get_mut(&self.me) {
            node.services.insert(protocol, service);
        }
    }
}
