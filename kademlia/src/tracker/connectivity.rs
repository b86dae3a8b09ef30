use std::collections::HashSet;

use log::{debug, trace};

use crate::{
    address::Address,
    priority::{sort_by_priority, AddressPriority},
    utils::{now, Timestamp},
};

use super::{ConnectionSnapshot, PeerTracker, PriorityPool};

/// Entries scoring below this are not worth a temporary link.
const MIN_PRIORITY: f64 = 0.01;

impl PeerTracker {
    /// Drops temporary pool entries whose expiry has passed.
    pub(super) fn expire_pool_entries(&self) {
        let now = now();
        for pool in [&self.kademlia_priority, &self.longrange_priority] {
            pool.lock().retain(|address, entry| {
                let expired = entry.is_expired(now);
                if expired {
                    trace!("Pool entry {address} expired");
                }
                !expired
            });
        }
    }

    /// Connects to the best entries of the near pool.
    ///
    /// Entries are taken by decreasing priority until
    /// `max_kademlia_connections` persistent links are kept, counting at
    /// most `max_shortlived_connections` temporary links on the way. Any
    /// slots left for temporary links are then filled from the rest.
    pub(super) fn connect_to_nearest(&self, snapshot: &ConnectionSnapshot) {
        let now = now();
        let expiry = now + self.config.default_connection_expiry as Timestamp;
        let threshold = self.config.persistent_threshold;

        let mut core = self.core.lock();
        let mut pool = self.kademlia_priority.lock();
        let mut prioritized = self.prioritize(&mut pool, snapshot, now);

        let mut kept = HashSet::new();
        let mut persistent = 0;
        let mut shortlived = 0;

        let mut entries = prioritized.iter_mut();
        for entry in entries.by_ref() {
            if persistent >= self.config.max_kademlia_connections {
                break;
            }

            // Expired entries are left for the trim stage to tear down.
            if !self.is_candidate(entry, snapshot) || entry.is_expired(now) {
                continue;
            }

            if shortlived >= self.config.max_shortlived_connections && !entry.persistent {
                continue;
            }

            if !self.ensure_connected(entry, snapshot, now) {
                continue;
            }

            if entry.preferably_persistent(threshold) {
                entry.make_persistent();
            }

            if entry.persistent {
                persistent += 1;
            } else {
                shortlived += 1;
            }
            kept.insert(entry.address);
        }

        for entry in entries {
            if shortlived >= self.config.max_shortlived_connections {
                break;
            }

            if !self.is_candidate(entry, snapshot) {
                continue;
            }

            if entry.priority < MIN_PRIORITY {
                break;
            }

            if !self.ensure_connected(entry, snapshot, now) {
                continue;
            }

            entry.make_temporary(entry.desired_expiry.unwrap_or(expiry));
            shortlived += 1;
            kept.insert(entry.address);
        }

        debug!("Near pool: {persistent} persistent, {shortlived} temporary links");
        pool.extend(prioritized.into_iter().map(|entry| (entry.address, entry)));
        core.keep_connections.extend(kept.iter().copied());
        core.kademlia_connections = kept;
    }

    /// Connects to the best `max_longrange_connections` entries of the
    /// long-range pool not already served by the near pool.
    pub(super) fn connect_to_long_range(&self, snapshot: &ConnectionSnapshot) {
        let now = now();

        let mut core = self.core.lock();
        let mut pool = self.longrange_priority.lock();
        let mut prioritized = self.prioritize(&mut pool, snapshot, now);

        let mut kept = HashSet::new();
        for entry in prioritized.iter_mut() {
            if kept.len() >= self.config.max_longrange_connections {
                break;
            }

            if !self.is_candidate(entry, snapshot)
                || core.kademlia_connections.contains(&entry.address)
            {
                continue;
            }

            if entry.priority < MIN_PRIORITY {
                break;
            }

            if self.ensure_connected(entry, snapshot, now) {
                kept.insert(entry.address);
            }
        }

        pool.extend(prioritized.into_iter().map(|entry| (entry.address, entry)));
        core.keep_connections.extend(kept.iter().copied());
        core.longrange_connections = kept;
    }

    /// Refreshes the connection state and priority of every entry, and
    /// returns them sorted by decreasing priority.
    fn prioritize(
        &self,
        pool: &mut PriorityPool,
        snapshot: &ConnectionSnapshot,
        now: Timestamp,
    ) -> Vec<AddressPriority> {
        pool.remove(&self.own_address);

        let mut prioritized: Vec<AddressPriority> = pool
            .values_mut()
            .map(|entry| {
                if snapshot.current.contains(&entry.address) {
                    entry.set_connected(snapshot.is_incoming_only(&entry.address), now);
                } else {
                    entry.set_disconnected();
                }
                entry.update_priority_at(&self.coefficients, now);
                entry.clone()
            })
            .collect();

        sort_by_priority(&mut prioritized);
        prioritized
    }

    /// Self and peers that already connected to us are never dialed.
    fn is_candidate(&self, entry: &AddressPriority, snapshot: &ConnectionSnapshot) -> bool {
        entry.address != self.own_address && !snapshot.is_incoming_only(&entry.address)
    }

    /// Dials the entry if it is not connected yet.
    ///
    /// Returns false if the peer cannot be reached: no known uri, or the uri
    /// is backing off after failures.
    fn ensure_connected(
        &self,
        entry: &mut AddressPriority,
        snapshot: &ConnectionSnapshot,
        now: Timestamp,
    ) -> bool {
        if snapshot.current.contains(&entry.address) {
            return true;
        }

        let uri = match self.table.get_uri(&entry.address) {
            Some(uri) => uri,
            None => return false,
        };

        if !self.table.may_connect(&uri) {
            return false;
        }

        trace!("Connect to {} at {uri}", entry.address);
        self.connections.add_persistent_peer(&uri);
        entry.set_connected(false, now);
        true
    }

    /// Tears down any connection to our own address.
    pub(super) fn disconnect_from_self(&self) {
        if let Some(handle) = self.register.outgoing_handle(&self.own_address) {
            debug!("Drop outgoing connection to self");
            self.connections.remove_persistent_peer(handle);
            self.connections.remove_connection(handle);
        }

        if let Some(handle) = self.register.incoming_handle(&self.own_address) {
            debug!("Drop incoming connection from self");
            self.connections.remove_connection(handle);
        }
    }

    /// Resolves peers connected in both directions.
    ///
    /// When our address is the lower one our outgoing leg is torn down,
    /// otherwise the peer tears down its own and we keep ours.
    pub fn disconnect_duplicates(&self) {
        let outgoing = self.register.outgoing_addresses();
        let incoming = self.register.incoming_addresses();

        for address in outgoing.intersection(&incoming) {
            if self.own_address < *address {
                debug!("Drop duplicate connection to {address}");
                self.drop_outgoing(address);
            }
        }
    }

    /// Tears down the outgoing connections nothing asked to keep this tick.
    ///
    /// Desired peers are kept, as are peers reached through a desired uri.
    pub(super) fn disconnect_unneeded(&self) {
        let keep = self.core.lock().keep_connections.clone();
        let desired = self.table.desired_peers();
        let desired_uris = self.table.desired_uris();

        let is_desired = |address: &Address| {
            desired.contains(address)
                || self
                    .table
                    .get_uri(address)
                    .is_some_and(|uri| desired_uris.contains(&uri))
        };

        for address in self.register.outgoing_addresses() {
            if address == self.own_address || keep.contains(&address) || is_desired(&address) {
                continue;
            }
            self.drop_outgoing(&address);
        }
    }
}
