use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use log::{debug, trace, warn};

use muddle_core::task_group::TaskResult;

use crate::{
    address::{Address, KademliaAddress},
    priority::AddressPriority,
    protocol::PeerTrackerClient,
    register::ConnectionHandle,
    table::bucket_by_logarithm,
    utils::now,
    PeerInfo, Result, Uri,
};

use super::PeerTracker;

/// Connection handles waiting for their address and uri.
#[derive(Default)]
pub(super) struct ResolutionState {
    pub handles: VecDeque<ConnectionHandle>,
    /// Handles with a `GET_MUDDLE_PORTS` or `GET_MUDDLE_URIS` call in flight.
    pub in_flight: HashSet<ConnectionHandle>,
}

/// An incoming connection whose listening endpoint must be asked for.
struct EndpointRequest {
    handle: ConnectionHandle,
    address: Address,
    host: Option<String>,
}

impl PeerTracker {
    /// Resolves the queued connection handles.
    ///
    /// Handles without an address yet are kept for the next tick, closed
    /// ones are dropped. Outgoing connections are registered right away from
    /// the endpoint we dialed. For incoming connections only the remote host
    /// is known, the peer is asked for the ports it listens on, or for its
    /// uris when the host is unknown.
    pub(super) fn process_connection_handles(self: &Arc<Self>) {
        let handles = std::mem::take(&mut self.uri_resolution.lock().handles);

        let mut waiting = VecDeque::new();
        let mut requests = vec![];
        for handle in handles {
            let details = match self.register.connection_details(handle) {
                Some(details) => details,
                None => {
                    trace!("Connection {handle} closed before resolution");
                    continue;
                }
            };

            let address = match details.address {
                Some(address) => address,
                None => {
                    waiting.push_back(handle);
                    continue;
                }
            };

            if details.is_incoming() {
                requests.push(EndpointRequest {
                    handle,
                    address,
                    host: details.remote_host,
                });
                continue;
            }

            match (details.remote_host, details.remote_port) {
                (Some(host), Some(port)) => match Uri::from_host_port(&host, port) {
                    Ok(uri) => self.register_connection_details(address, uri, false),
                    Err(err) => warn!("Connection {handle} has an invalid endpoint: {err}"),
                },
                _ => warn!("Connection {handle} to {address} has no remote endpoint"),
            }
        }

        {
            let mut resolution = self.uri_resolution.lock();
            resolution.handles.extend(waiting);
            requests.retain(|req| resolution.in_flight.insert(req.handle));
        }

        for request in requests {
            self.spawn_resolution(request);
        }
    }

    fn spawn_resolution(self: &Arc<Self>, request: EndpointRequest) {
        let EndpointRequest {
            handle,
            address,
            host,
        } = request;

        let client = self.client.clone();
        let this = self.clone();
        self.task_group.spawn(
            async move { resolve_endpoint(&client, &address, host).await },
            move |res| async move { this.on_resolved_endpoint(handle, address, res) },
        );
    }

    fn on_resolved_endpoint(
        &self,
        handle: ConnectionHandle,
        address: Address,
        result: TaskResult<Result<Option<Uri>>>,
    ) {
        if !self.is_running() {
            return;
        }

        match result {
            TaskResult::Completed(Ok(Some(uri))) => {
                self.register_connection_details(address, uri, true)
            }
            TaskResult::Completed(Ok(None)) => debug!("Peer {address} advertises no endpoint"),
            TaskResult::Completed(Err(err)) => {
                warn!("Unable to resolve endpoint of {address}: {err}");
                self.table.report_failure(&address, &self.own_address);
            }
            TaskResult::Cancelled => {}
        }

        self.uri_resolution.lock().in_flight.remove(&handle);
    }

    /// Records a live connection in the table and in the near pool.
    fn register_connection_details(&self, address: Address, uri: Uri, incoming: bool) {
        if address == self.own_address {
            return;
        }

        trace!("Register connection to {address} at {uri}");
        let info = PeerInfo::with_uri(address, uri.clone());
        self.table
            .report_liveliness(&address, &self.own_address, Some(&info));
        if !incoming {
            self.table.report_successful_connect_attempt(&uri);
        }

        let own_kad = self.table.own_kademlia_address();
        let bucket = bucket_by_logarithm(&own_kad.distance(&KademliaAddress::create(&address)));

        let mut pool = self.kademlia_priority.lock();
        let entry = pool.entry(address).or_insert_with(|| {
            let mut entry = AddressPriority::new(address, bucket);
            // Links opened by the remote are not ours to keep.
            entry.persistent = !incoming;
            entry
        });
        entry.set_connected(incoming, now());
    }
}

/// Asks `address` where it listens: the first advertised port on `host`, or
/// its first valid uri when the host is unknown.
async fn resolve_endpoint(
    client: &PeerTrackerClient,
    address: &Address,
    host: Option<String>,
) -> Result<Option<Uri>> {
    match host {
        Some(host) => {
            let ports = client.muddle_ports(address).await?;
            ports
                .first()
                .map(|port| Uri::from_host_port(&host, *port))
                .transpose()
        }
        None => {
            let uris = client.muddle_uris(address).await?;
            Ok(uris.into_iter().find(|uri| uri.is_valid()))
        }
    }
}
