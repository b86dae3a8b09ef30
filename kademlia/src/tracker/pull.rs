use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use log::{trace, warn};

use muddle_core::task_group::TaskResult;

use crate::{
    address::{Address, KademliaAddress},
    priority::AddressPriority,
    table::{bucket_by_hamming, bucket_by_logarithm},
    utils::{now, Timestamp},
    PeerInfo, Result,
};

use super::{ConnectionSnapshot, PeerTracker};

/// Pull queue and in-flight `FIND_PEERS` calls.
#[derive(Default)]
pub(super) struct PullState {
    pub queue: VecDeque<Address>,
    pub in_flight: HashMap<u64, PullInfo>,
    next_id: u64,
    /// When each (queried peer, target) pair was last pulled.
    last_pulled: HashMap<(Address, Address), Timestamp>,
}

#[derive(Clone, Debug)]
pub(super) struct PullInfo {
    pub peer: Address,
    pub target: Address,
}

impl PullState {
    /// Queues `target` unless it is already queued or being pulled.
    fn enqueue(&mut self, target: Address) -> bool {
        if self.queue.contains(&target) || self.in_flight.values().any(|p| p.target == target) {
            return false;
        }
        self.queue.push_back(target);
        true
    }

    fn active_targets(&self) -> usize {
        self.in_flight
            .values()
            .map(|p| p.target)
            .collect::<HashSet<_>>()
            .len()
    }

    fn in_cooldown(&self, peer: &Address, target: &Address, at: Timestamp, cooldown: u64) -> bool {
        self.last_pulled
            .get(&(*peer, *target))
            .is_some_and(|last| at - last < cooldown as Timestamp)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl PeerTracker {
    /// Queues a pull for `target` through the connected peers nearest to it.
    pub fn track(&self, target: Address) {
        if self.pull.lock().enqueue(target) {
            trace!("Queue pull for {target}");
        }
    }

    /// Seeds the near pool with the peers nearest to us, and the long-range
    /// pool with the peers nearest to us by hamming distance.
    pub(super) fn add_most_promising_peers(&self, snapshot: &ConnectionSnapshot) {
        let own_kad = self.table.own_kademlia_address();

        let nearest = self.table.find_peer(&self.own_address);
        {
            let mut pool = self.kademlia_priority.lock();
            for peer in nearest {
                if snapshot.current.contains(&peer.address) {
                    continue;
                }
                let bucket = bucket_by_logarithm(&own_kad.distance(&peer.kademlia_address));
                pool.entry(peer.address)
                    .or_insert_with(|| AddressPriority::new(peer.address, bucket));
            }
        }

        let nearest = self.table.find_peer_by_hamming(&self.own_address);
        let mut pool = self.longrange_priority.lock();
        for peer in nearest {
            let bucket = bucket_by_hamming(&own_kad.distance(&peer.kademlia_address));
            pool.entry(peer.address)
                .or_insert_with(|| AddressPriority::new(peer.address, bucket));
        }
    }

    /// Starts queued pulls while fewer than `max_discovery_tasks` targets
    /// are being pulled.
    ///
    /// Targets with no connected peer to ask are dropped.
    pub(super) fn start_pulls(self: &Arc<Self>, snapshot: &ConnectionSnapshot) {
        let now = now();
        let mut calls = vec![];
        {
            let mut pull = self.pull.lock();
            while pull.active_targets() < self.config.max_discovery_tasks {
                let target = match pull.queue.pop_front() {
                    Some(target) => target,
                    None => break,
                };

                let peers: Vec<Address> = self
                    .pull_candidates(&target, snapshot)
                    .into_iter()
                    .filter(|peer| !pull.in_cooldown(peer, &target, now, self.config.pull_cooldown))
                    .take(self.config.async_calls.max(1))
                    .collect();

                if peers.is_empty() {
                    trace!("No connected peer to pull {target} from");
                    continue;
                }

                for peer in peers {
                    let id = pull.next_id();
                    pull.in_flight.insert(id, PullInfo { peer, target });
                    pull.last_pulled.insert((peer, target), now);
                    calls.push((id, peer, target));
                }
            }

            pull.last_pulled
                .retain(|_, last| now - *last < self.config.pull_cooldown as Timestamp);
        }

        for (id, peer, target) in calls {
            self.spawn_pull(id, peer, target);
        }
    }

    /// Connected peers to ask about `target`, nearest to it first.
    ///
    /// Falls back on every connected peer when none of the known peers
    /// nearest to `target` is connected.
    fn pull_candidates(&self, target: &Address, snapshot: &ConnectionSnapshot) -> Vec<Address> {
        let usable = |address: &Address| {
            *address != self.own_address && address != target && snapshot.current.contains(address)
        };

        let nearest: Vec<Address> = self
            .table
            .find_peer(target)
            .into_iter()
            .map(|peer| peer.address)
            .filter(|address| usable(address))
            .collect();
        if !nearest.is_empty() {
            return nearest;
        }

        let target_kad = KademliaAddress::create(target);
        let mut connected: Vec<Address> = snapshot.current.iter().copied().filter(usable).collect();
        connected.sort_by_key(|address| KademliaAddress::create(address).distance(&target_kad));
        connected
    }

    fn spawn_pull(self: &Arc<Self>, id: u64, peer: Address, target: Address) {
        trace!("Pull {target} from {peer}");
        let client = self.client.clone();
        let this = self.clone();
        self.task_group.spawn(
            async move { client.find_peers(&peer, &target).await },
            move |res| async move { this.on_pull_resolved(id, peer, target, res) },
        );
    }

    /// Applies the result of a `FIND_PEERS` call.
    ///
    /// Returned peers are recorded in the table and, unless the peer asked
    /// was the target itself, offered to the near pool as temporary entries.
    /// The target is queued again while the answers keep getting closer to
    /// it without reaching it.
    fn on_pull_resolved(
        &self,
        id: u64,
        peer: Address,
        target: Address,
        result: TaskResult<Result<Vec<PeerInfo>>>,
    ) {
        if !self.is_running() {
            return;
        }

        let mut requeue = false;
        match result {
            TaskResult::Completed(Ok(peers)) => {
                self.table.report_liveliness(&peer, &self.own_address, None);

                let target_kad = KademliaAddress::create(&target);
                let peer_distance = KademliaAddress::create(&peer).distance(&target_kad);

                let mut found = false;
                let mut closer = false;
                for info in peers.iter().filter(|info| info.address != self.own_address) {
                    self.table.report_existence(info, &peer);
                    found |= info.address == target;
                    closer |= KademliaAddress::create(&info.address).distance(&target_kad)
                        < peer_distance;
                }
                trace!("Pull {target} from {peer} returned {} peers", peers.len());

                if peer != target {
                    self.add_temporary_peers(&peers);
                }

                requeue = !found && closer && target != self.own_address;
            }
            TaskResult::Completed(Err(err)) => {
                warn!("Pull {target} from {peer} failed: {err}");
                self.table.report_failure(&peer, &self.own_address);
            }
            TaskResult::Cancelled => {}
        }

        let mut pull = self.pull.lock();
        pull.in_flight.remove(&id);
        if requeue {
            pull.enqueue(target);
        }
    }

    /// Offers freshly learned peers to the near pool until the default
    /// connection expiry.
    fn add_temporary_peers(&self, peers: &[PeerInfo]) {
        let own_kad = self.table.own_kademlia_address();
        let expiry = now() + self.config.default_connection_expiry as Timestamp;

        let mut pool = self.kademlia_priority.lock();
        for info in peers.iter().filter(|info| info.address != self.own_address) {
            // Distances reported by others are not trusted.
            let distance = own_kad.distance(&KademliaAddress::create(&info.address));
            pool.entry(info.address).or_insert_with(|| {
                let mut entry = AddressPriority::new(info.address, bucket_by_logarithm(&distance));
                entry.make_temporary(expiry);
                entry
            });
        }
    }
}
