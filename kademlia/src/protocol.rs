use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use log::trace;
use parking_lot::RwLock;

use muddle_core::{
    runtime::timeout,
    util::{decode, encode},
};

use crate::{address::Address, table::KademliaTable, Error, PeerInfo, Result, Uri};

/// Service the peer tracker protocol is exposed under.
pub const PEER_TRACKER_SERVICE: u16 = 2;

/// Protocol id of the peer tracker within its service.
pub const PEER_TRACKER_PROTOCOL: u8 = 1;

/// Numeric ids of the peer tracker RPC methods, stable across versions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Method {
    Ping = 1,
    FindPeers = 2,
    GetMuddleUris = 3,
    GetMuddlePorts = 4,
    /// Reserved, not served.
    RequestDisconnect = 5,
}

impl TryFrom<u8> for Method {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Method::Ping),
            2 => Ok(Method::FindPeers),
            3 => Ok(Method::GetMuddleUris),
            4 => Ok(Method::GetMuddlePorts),
            5 => Ok(Method::RequestDisconnect),
            _ => Err(Error::UnknownRpcMethod(id)),
        }
    }
}

/// FindPeers request, the address searched for.
#[derive(Decode, Encode, Debug)]
pub struct FindPeersMsg(pub Address);

/// FindPeers response.
#[derive(Decode, Encode, Debug)]
pub struct PeersMsg(pub Vec<PeerInfo>);

#[derive(Decode, Encode, Debug)]
pub struct UrisMsg(pub Vec<Uri>);

#[derive(Decode, Encode, Debug)]
pub struct PortsMsg(pub Vec<u16>);

/// Ping response.
#[derive(Decode, Encode, Debug)]
pub struct PongMsg(pub bool);

/// Client side of the RPC layer.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Calls `method` on the node at `address` and returns the encoded
    /// response.
    async fn call_specific_address(
        &self,
        address: &Address,
        service: u16,
        protocol: u8,
        method: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>>;
}

/// A set of methods served under one protocol id.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn call(&self, method: u8, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Server side of the RPC layer.
pub trait RpcServer: Send + Sync {
    fn add(&self, protocol: u8, service: Arc<dyn RpcService>);
}

/// Serves the peer tracker methods from a table.
pub struct PeerTrackerProtocol {
    table: Arc<KademliaTable>,
    ports: RwLock<Vec<u16>>,
    uris: RwLock<Vec<Uri>>,
}

impl PeerTrackerProtocol {
    pub fn new(table: Arc<KademliaTable>) -> Arc<Self> {
        Arc::new(Self {
            table,
            ports: RwLock::new(vec![]),
            uris: RwLock::new(vec![]),
        })
    }

    /// Sets the ports served by `GET_MUDDLE_PORTS`.
    pub fn set_ports(&self, ports: Vec<u16>) {
        *self.ports.write() = ports;
    }

    /// Sets the uris served by `GET_MUDDLE_URIS`.
    pub fn set_uris(&self, uris: Vec<Uri>) {
        *self.uris.write() = uris;
    }

    /// Returns the known peers nearest to `target` that can be reached.
    pub fn find_peers(&self, target: &Address) -> Vec<PeerInfo> {
        self.table
            .find_peer(target)
            .into_iter()
            .filter(|peer| peer.valid_uri().is_some())
            .collect()
    }

    pub fn muddle_uris(&self) -> Vec<Uri> {
        self.uris.read().clone()
    }

    pub fn muddle_ports(&self) -> Vec<u16> {
        self.ports.read().clone()
    }
}

#[async_trait]
impl RpcService for PeerTrackerProtocol {
    async fn call(&self, method: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let method = Method::try_from(method)?;
        trace!("Serve {method:?}");

        let response = match method {
            Method::Ping => encode(&PongMsg(true))?,
            Method::FindPeers => {
                let (FindPeersMsg(target), _) = decode::<FindPeersMsg>(payload)?;
                encode(&PeersMsg(self.find_peers(&target)))?
            }
            Method::GetMuddleUris => encode(&UrisMsg(self.muddle_uris()))?,
            Method::GetMuddlePorts => encode(&PortsMsg(self.muddle_ports()))?,
            Method::RequestDisconnect => return Err(Error::UnknownRpcMethod(method as u8)),
        };

        Ok(response)
    }
}

/// Typed calls to the peer tracker protocol of a remote node, each bounded
/// by a timeout.
#[derive(Clone)]
pub struct PeerTrackerClient {
    client: Arc<dyn RpcClient>,
    timeout: Duration,
}

impl PeerTrackerClient {
    pub fn new(client: Arc<dyn RpcClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn find_peers(&self, address: &Address, target: &Address) -> Result<Vec<PeerInfo>> {
        let payload = encode(&FindPeersMsg(*target))?;
        let PeersMsg(peers) = self.call(address, Method::FindPeers, payload).await?;
        Ok(peers)
    }

    pub async fn muddle_uris(&self, address: &Address) -> Result<Vec<Uri>> {
        let UrisMsg(uris) = self.call(address, Method::GetMuddleUris, vec![]).await?;
        Ok(uris)
    }

    pub async fn muddle_ports(&self, address: &Address) -> Result<Vec<u16>> {
        let PortsMsg(ports) = self.call(address, Method::GetMuddlePorts, vec![]).await?;
        Ok(ports)
    }

    async fn call<T: Decode<()>>(&self, address: &Address, method: Method, payload: Vec<u8>) -> Result<T> {
        let fut = self.client.call_specific_address(
            address,
            PEER_TRACKER_SERVICE,
            PEER_TRACKER_PROTOCOL,
            method as u8,
            payload,
        );
        let response = timeout(self.timeout, fut).await??;
        let (msg, _) = decode::<T>(&response)?;
        Ok(msg)
    }
}
