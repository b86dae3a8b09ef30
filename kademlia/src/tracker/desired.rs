use log::trace;

use super::{ConnectionSnapshot, PeerTracker};

impl PeerTracker {
    /// Dials desired uris whose address is still unknown.
    pub(super) fn connect_to_desired_uris(&self) {
        for uri in self.table.desired_uris() {
            if self.table.get_address_from_uri(&uri).is_some() {
                continue;
            }

            if self.table.may_connect(&uri) {
                trace!("Connect to desired uri {uri}");
                self.connections.add_persistent_peer(&uri);
            }
        }
    }

    /// Connects to every desired peer that is not connected yet.
    ///
    /// Peers we know how to reach are dialed directly. For the others, the
    /// nearest known peer is either asked about them, when connected, or
    /// dialed as a stepping stone.
    pub(super) fn connect_to_desired_peers(&self, snapshot: &ConnectionSnapshot) {
        let mut desired: Vec<_> = self.table.desired_peers().into_iter().collect();
        desired.sort();

        let mut kept = vec![];
        let mut attempts = 0;
        for address in desired {
            if address == self.own_address {
                continue;
            }

            if snapshot.current.contains(&address) {
                kept.push(address);
                continue;
            }

            if attempts >= self.config.max_desired_connections {
                break;
            }

            if let Some(uri) = self.table.get_uri(&address) {
                if self.table.may_connect(&uri) {
                    trace!("Connect to desired peer {address} at {uri}");
                    self.connections.add_persistent_peer(&uri);
                    kept.push(address);
                    attempts += 1;
                }
                continue;
            }

            let nearest = self.table.find_peer(&address);
            let closest = match nearest.first() {
                Some(closest) => closest,
                None => {
                    trace!("No path to desired peer {address}");
                    continue;
                }
            };

            if snapshot.current.contains(&closest.address) {
                self.track(address);
            } else if let Some(uri) = closest.valid_uri() {
                if self.table.may_connect(uri) {
                    trace!("Connect to {} on the way to {address}", closest.address);
                    self.connections.add_persistent_peer(uri);
                    kept.push(closest.address);
                    attempts += 1;
                }
            }
        }

        self.core.lock().keep_connections.extend(kept);
    }
}
