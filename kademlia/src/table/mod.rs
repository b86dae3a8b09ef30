mod bucket;
mod cache;
mod peer_info;

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use log::{debug, info, trace};
use parking_lot::{Mutex, RwLock};

use muddle_core::util::tilde_expand;

use crate::{
    address::{Address, KademliaAddress, KademliaDistance},
    config::TableConfig,
    utils::{now, Timestamp},
    Result, Uri,
};

pub use bucket::{bucket_by_hamming, bucket_by_logarithm, Bucket, BUCKET_COUNT, BUCKET_SIZE};
pub use peer_info::{PeerInfo, UriInfo};

use cache::TableCache;

/// Selects which of the two bucket arrays a lookup walks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BucketKind {
    /// Classic kademlia buckets, by the highest differing bit.
    Logarithm,
    /// Long-range buckets, by the number of differing bits.
    Hamming,
}

/// Thread-safe store of every known and desired peer.
///
/// State is split over three locks which are always taken in the same
/// order: `core`, then `peers`, then `desired`. A method that needs a later
/// lock never calls back into a method that takes an earlier one while
/// holding it. No lock is held across a call out of the table.
pub struct KademliaTable {
    core: RwLock<TableCore>,
    peers: RwLock<PeerStore>,
    desired: Mutex<DesiredPeers>,
}

struct TableCore {
    own_address: Address,
    own_kademlia_address: KademliaAddress,
    config: TableConfig,
    cache_file: Option<PathBuf>,
}

/// The peer arena plus two bucket arrays of arena keys.
struct PeerStore {
    known_peers: HashMap<Address, PeerInfo>,
    known_uris: HashMap<Uri, UriInfo>,
    by_logarithm: Vec<Bucket>,
    by_hamming: Vec<Bucket>,
}

#[derive(Default)]
struct DesiredPeers {
    peers: HashSet<Address>,
    uris: HashSet<Uri>,
    connection_expiry: HashMap<Address, Timestamp>,
    uri_expiry: HashMap<Uri, Timestamp>,
}

impl KademliaTable {
    /// Creates a new table for the given node, with the default configuration.
    pub fn new(own_address: Address) -> Self {
        Self::with_config(own_address, TableConfig::default())
    }

    /// Creates a new table for the given node.
    pub fn with_config(own_address: Address, config: TableConfig) -> Self {
        let bucket_count = config.bucket_count.max(1);
        let peers = PeerStore {
            known_peers: HashMap::new(),
            known_uris: HashMap::new(),
            by_logarithm: (0..bucket_count).map(|_| Bucket::new()).collect(),
            by_hamming: (0..bucket_count).map(|_| Bucket::new()).collect(),
        };

        Self {
            core: RwLock::new(TableCore {
                own_address,
                own_kademlia_address: KademliaAddress::create(&own_address),
                config,
                cache_file: None,
            }),
            peers: RwLock::new(peers),
            desired: Mutex::new(DesiredPeers::default()),
        }
    }

    pub fn own_address(&self) -> Address {
        self.core.read().own_address
    }

    pub fn own_kademlia_address(&self) -> KademliaAddress {
        self.core.read().own_kademlia_address
    }

    /// Returns the number of known peers.
    pub fn size(&self) -> usize {
        self.peers.read().known_peers.len()
    }

    /// Returns the number of peers held in the buckets of the given kind.
    pub fn bucketed_size(&self, kind: BucketKind) -> usize {
        let peers = self.peers.read();
        peers.buckets(kind).iter().map(|b| b.len()).sum()
    }

    /// Reports that a peer exists, as learned from `reporter`.
    ///
    /// Unknown peers are inserted with fresh counters. For known peers the
    /// uri and the verified flag are merged in and the history is kept.
    pub fn report_existence(&self, info: &PeerInfo, reporter: &Address) {
        let core = self.core.read();
        if info.address == core.own_address {
            return;
        }

        let mut peers = self.peers.write();
        peers.report_existence(&core, info, reporter);
    }

    /// Reports that a peer is alive.
    ///
    /// If the peer is unknown and `info` is provided, it is first reported
    /// as existing.
    pub fn report_liveliness(&self, address: &Address, reporter: &Address, info: Option<&PeerInfo>) {
        let core = self.core.read();
        if *address == core.own_address {
            return;
        }

        let mut peers = self.peers.write();
        if !peers.known_peers.contains_key(address) {
            match info {
                Some(info) if info.address == *address => {
                    peers.report_existence(&core, info, reporter)
                }
                _ => return,
            }
        } else if let Some(info) = info {
            peers.merge(info, reporter);
        }

        if let Some(peer) = peers.known_peers.get_mut(address) {
            peer.last_activity = now();
            peer.failed_attempts = 0;
            peer.earliest_next_attempt = None;
            peer.message_count += 1;
            peer.last_reporter = Some(*reporter);
        }

        // A peer evicted after failures comes back once it is seen again.
        peers.place(&core, address);
    }

    /// Reports that a peer failed to respond.
    ///
    /// Once the failures reach `max_failures` the peer leaves the buckets,
    /// its record stays known.
    pub fn report_failure(&self, address: &Address, reporter: &Address) {
        let core = self.core.read();
        let mut peers = self.peers.write();

        let failures = match peers.known_peers.get_mut(address) {
            Some(peer) => {
                peer.failed_attempts += 1;
                peer.last_reporter = Some(*reporter);
                peer.failed_attempts
            }
            None => return,
        };

        if failures >= core.config.max_failures {
            debug!("Peer {address} unreachable after {failures} failures");
            peers.unplace(address);
        }
    }

    /// Reports a successful connection to `uri`.
    pub fn report_successful_connect_attempt(&self, uri: &Uri) {
        let core = self.core.read();
        let mut peers = self.peers.write();
        let now = now();

        let record = peers.known_uris.entry(uri.clone()).or_default();
        record.connection_attempts += 1;
        record.connections += 1;
        record.failed_attempts = 0;
        record.last_activity = now;
        record.earliest_next_attempt = None;

        let address = match record.address {
            Some(address) => address,
            None => return,
        };

        if let Some(peer) = peers.known_peers.get_mut(&address) {
            peer.connection_attempts += 1;
            peer.connections += 1;
            peer.failed_attempts = 0;
            peer.verified = true;
            peer.last_activity = now;
            peer.earliest_next_attempt = None;
        }
        peers.place(&core, &address);
    }

    /// Reports a failed connection attempt to `uri`.
    ///
    /// The uri is not dialed again before an exponentially growing delay.
    pub fn report_failed_connect_attempt(&self, uri: &Uri) {
        let core = self.core.read();
        let mut peers = self.peers.write();
        let now = now();

        let record = peers.known_uris.entry(uri.clone()).or_default();
        record.connection_attempts += 1;
        record.failed_attempts += 1;
        let next = now + retry_delay(&core.config, record.failed_attempts);
        record.earliest_next_attempt = Some(next);

        let address = match record.address {
            Some(address) => address,
            None => return,
        };

        let failures = match peers.known_peers.get_mut(&address) {
            Some(peer) => {
                peer.connection_attempts += 1;
                peer.failed_attempts += 1;
                peer.earliest_next_attempt = Some(next);
                peer.failed_attempts
            }
            None => return,
        };

        if failures >= core.config.max_failures {
            peers.unplace(&address);
        }
    }

    /// Reports that the peer at `uri` is leaving the network.
    pub fn report_leaving(&self, uri: &Uri) {
        let core = self.core.read();
        let mut peers = self.peers.write();
        let now = now();
        let next = now + core.config.retry_base_delay as Timestamp;

        let record = peers.known_uris.entry(uri.clone()).or_default();
        record.last_activity = now;
        record.earliest_next_attempt = Some(next);

        if let Some(address) = record.address {
            if let Some(peer) = peers.known_peers.get_mut(&address) {
                peer.last_activity = now;
                peer.earliest_next_attempt = Some(next);
            }
        }
    }

    /// Returns up to `find_peer_limit` peers nearest to `target`, by
    /// increasing distance to it.
    pub fn find_peer(&self, target: &Address) -> Vec<PeerInfo> {
        self.find_peer_in(target, BucketKind::Logarithm)
    }

    /// Same as [`KademliaTable::find_peer`] but walks the hamming buckets.
    pub fn find_peer_by_hamming(&self, target: &Address) -> Vec<PeerInfo> {
        self.find_peer_in(target, BucketKind::Hamming)
    }

    /// Lookup over one of the bucket arrays.
    ///
    /// The search starts from the bucket `target` falls into relative to us
    /// and widens until enough peers are collected. The `distance` of each
    /// returned record is its distance to `target`.
    pub fn find_peer_in(&self, target: &Address, kind: BucketKind) -> Vec<PeerInfo> {
        let core = self.core.read();
        let peers = self.peers.read();

        let limit = core.config.find_peer_limit;
        let target_kad = KademliaAddress::create(target);
        let distance_to_self = core.own_kademlia_address.distance(&target_kad);

        let buckets = peers.buckets(kind);
        let last = buckets.len() - 1;
        let start = bucket_id(&distance_to_self, kind).min(last);

        let mut candidates: Vec<Address> = vec![];
        for group in scan_order(start, last, kind) {
            for idx in group {
                candidates.extend(buckets[idx].iter().copied());
            }
            if candidates.len() >= limit {
                break;
            }
        }

        let mut found: Vec<PeerInfo> = candidates
            .iter()
            .filter_map(|address| peers.known_peers.get(address))
            .map(|peer| {
                let mut peer = peer.clone();
                peer.distance = peer.kademlia_address.distance(&target_kad);
                peer
            })
            .collect();

        found.sort_by(|a, b| a.distance.cmp(&b.distance));
        found.truncate(limit);
        trace!("Lookup {target} over {kind:?} buckets found {} peers", found.len());
        found
    }

    /// Returns true if we know how to reach the peer.
    pub fn has_peer_details(&self, address: &Address) -> bool {
        let peers = self.peers.read();
        peers
            .known_peers
            .get(address)
            .is_some_and(|peer| peer.valid_uri().is_some())
    }

    /// Returns the record of a known peer.
    pub fn get_peer_details(&self, address: &Address) -> Option<PeerInfo> {
        let core = self.core.read();
        let peers = self.peers.read();
        peers.known_peers.get(address).map(|peer| {
            let mut peer = peer.clone();
            peer.distance = core.own_kademlia_address.distance(&peer.kademlia_address);
            peer
        })
    }

    /// Returns the uri of a known peer.
    pub fn get_uri(&self, address: &Address) -> Option<Uri> {
        let peers = self.peers.read();
        peers
            .known_peers
            .get(address)
            .and_then(|peer| peer.valid_uri().cloned())
    }

    /// Returns the address behind a uri, once it has been learned.
    pub fn get_address_from_uri(&self, uri: &Uri) -> Option<Address> {
        let peers = self.peers.read();
        peers.known_uris.get(uri).and_then(|record| record.address)
    }

    /// Returns the connection bookkeeping of a uri.
    pub fn get_uri_details(&self, uri: &Uri) -> Option<UriInfo> {
        self.peers.read().known_uris.get(uri).cloned()
    }

    /// Returns false while a failed uri is backing off.
    pub fn may_connect(&self, uri: &Uri) -> bool {
        let peers = self.peers.read();
        let now = now();
        peers
            .known_uris
            .get(uri)
            .map_or(true, |record| record.may_connect(now))
    }

    /////////////////
    // DESIRED PEERS
    ////////////////

    /// Marks `address` as desired until `expiry`, or forever if `None`.
    pub fn add_desired_peer(&self, address: &Address, expiry: Option<Timestamp>) {
        if *address == self.own_address() {
            return;
        }

        let mut desired = self.desired.lock();
        desired.peers.insert(*address);
        match expiry {
            Some(expiry) => {
                desired.connection_expiry.insert(*address, expiry);
            }
            None => {
                desired.connection_expiry.remove(address);
            }
        }
    }

    /// Marks a peer as desired and records `hint` as a way to reach it.
    pub fn add_desired_peer_with_hint(&self, hint: &PeerInfo, expiry: Option<Timestamp>) {
        let own_address = self.own_address();
        self.report_existence(hint, &own_address);
        self.add_desired_peer(&hint.address, expiry);
    }

    /// Marks `uri` as desired until `expiry`, or forever if `None`.
    pub fn add_desired_uri(&self, uri: &Uri, expiry: Option<Timestamp>) {
        let mut desired = self.desired.lock();
        desired.uris.insert(uri.clone());
        match expiry {
            Some(expiry) => {
                desired.uri_expiry.insert(uri.clone(), expiry);
            }
            None => {
                desired.uri_expiry.remove(uri);
            }
        }
    }

    pub fn remove_desired_peer(&self, address: &Address) {
        let mut desired = self.desired.lock();
        desired.peers.remove(address);
        desired.connection_expiry.remove(address);
    }

    pub fn remove_desired_uri(&self, uri: &Uri) {
        let mut desired = self.desired.lock();
        desired.uris.remove(uri);
        desired.uri_expiry.remove(uri);
    }

    /// Drops every desired peer and uri whose expiry has passed.
    pub fn trim_desired_peers(&self) {
        let now = now();
        let mut desired = self.desired.lock();

        let expired: Vec<Address> = desired
            .connection_expiry
            .iter()
            .filter(|(_, expiry)| **expiry < now)
            .map(|(address, _)| *address)
            .collect();
        for address in expired {
            trace!("Desired peer {address} expired");
            desired.peers.remove(&address);
            desired.connection_expiry.remove(&address);
        }

        let expired: Vec<Uri> = desired
            .uri_expiry
            .iter()
            .filter(|(_, expiry)| **expiry < now)
            .map(|(uri, _)| uri.clone())
            .collect();
        for uri in expired {
            trace!("Desired uri {uri} expired");
            desired.uris.remove(&uri);
            desired.uri_expiry.remove(&uri);
        }
    }

    /// Moves desired uris whose address became known to the desired peers,
    /// keeping their expiry.
    pub fn convert_desired_uris_to_addresses(&self) {
        let core = self.core.read();
        let peers = self.peers.read();
        let mut desired = self.desired.lock();

        let resolved: Vec<(Uri, Address)> = desired
            .uris
            .iter()
            .filter_map(|uri| {
                peers
                    .known_uris
                    .get(uri)
                    .and_then(|record| record.address)
                    .map(|address| (uri.clone(), address))
            })
            .collect();

        for (uri, address) in resolved {
            desired.uris.remove(&uri);
            let expiry = desired.uri_expiry.remove(&uri);
            if address == core.own_address {
                continue;
            }

            trace!("Desired uri {uri} resolved to {address}");
            desired.peers.insert(address);
            match expiry {
                Some(expiry) => {
                    desired.connection_expiry.insert(address, expiry);
                }
                None => {
                    desired.connection_expiry.remove(&address);
                }
            }
        }
    }

    pub fn desired_peers(&self) -> HashSet<Address> {
        self.desired.lock().peers.clone()
    }

    pub fn desired_uris(&self) -> HashSet<Uri> {
        self.desired.lock().uris.clone()
    }

    pub fn is_desired(&self, address: &Address) -> bool {
        self.desired.lock().peers.contains(address)
    }

    /// Returns the expiry of a desired peer, `None` if it never expires or
    /// is not desired.
    pub fn desired_expiry(&self, address: &Address) -> Option<Timestamp> {
        self.desired.lock().connection_expiry.get(address).copied()
    }

    /// Forgets every desired peer and uri.
    pub fn clear_desired(&self) {
        *self.desired.lock() = DesiredPeers::default();
    }

    /////////////////
    // PERSISTENCE
    ////////////////

    /// Sets the file used by [`KademliaTable::dump`] and
    /// [`KademliaTable::load`]. A leading `~` is expanded.
    pub fn set_cache_file(&self, path: &str) -> Result<()> {
        let path = tilde_expand(path)?;
        self.core.write().cache_file = Some(path);
        Ok(())
    }

    pub fn cache_file(&self) -> Option<PathBuf> {
        self.core.read().cache_file.clone()
    }

    /// Writes the table to the cache file, if one is set.
    pub fn dump(&self) -> Result<()> {
        match self.cache_file() {
            Some(path) => self.dump_to(&path),
            None => Ok(()),
        }
    }

    /// Reads the table back from the cache file, if one is set and exists.
    pub fn load(&self) -> Result<()> {
        match self.cache_file() {
            Some(path) if path.exists() => self.load_from(&path),
            _ => Ok(()),
        }
    }

    /// Writes the peers with a valid uri and the desired peer sets to `path`.
    pub fn dump_to(&self, path: &Path) -> Result<()> {
        let cache = {
            let _core = self.core.read();
            let peers = self.peers.read();
            let desired = self.desired.lock();

            TableCache {
                known_peers: peers
                    .known_peers
                    .values()
                    .filter(|peer| peer.valid_uri().is_some())
                    .cloned()
                    .collect(),
                desired_connection_expiry: desired
                    .connection_expiry
                    .iter()
                    .map(|(a, t)| (*a, *t))
                    .collect(),
                desired_uri_expiry: desired
                    .uri_expiry
                    .iter()
                    .map(|(u, t)| (u.clone(), *t))
                    .collect(),
                desired_peers: desired.peers.iter().copied().collect(),
                desired_uris: desired.uris.iter().cloned().collect(),
            }
        };

        cache.write(path)?;
        debug!(
            "Dumped {} peers to {}",
            cache.known_peers.len(),
            path.display()
        );
        Ok(())
    }

    /// Loads a table written by [`KademliaTable::dump_to`].
    ///
    /// Peers are reported again as existing, so their counters start fresh.
    pub fn load_from(&self, path: &Path) -> Result<()> {
        let cache = TableCache::read(path)?;
        let own_address = self.own_address();

        let mut restored = 0;
        for peer in cache.known_peers.iter() {
            let uri = match peer.valid_uri() {
                Some(uri) => uri.clone(),
                None => continue,
            };
            self.report_existence(&PeerInfo::with_uri(peer.address, uri), &own_address);
            restored += 1;
        }

        let mut desired = self.desired.lock();
        desired
            .peers
            .extend(cache.desired_peers.into_iter().filter(|a| *a != own_address));
        desired
            .uris
            .extend(cache.desired_uris.into_iter().filter(|u| u.is_valid()));
        desired
            .connection_expiry
            .extend(cache.desired_connection_expiry);
        desired.uri_expiry.extend(cache.desired_uri_expiry);

        info!("Loaded {restored} peers from {}", path.display());
        Ok(())
    }
}

impl PeerStore {
    fn buckets(&self, kind: BucketKind) -> &[Bucket] {
        match kind {
            BucketKind::Logarithm => &self.by_logarithm,
            BucketKind::Hamming => &self.by_hamming,
        }
    }

    fn report_existence(&mut self, core: &TableCore, info: &PeerInfo, reporter: &Address) {
        let address = info.address;
        if self.known_peers.contains_key(&address) {
            self.merge(info, reporter);
            return;
        }

        // Kademlia address and distance are recomputed locally, reported
        // values are not trusted.
        let mut peer = PeerInfo::new(address);
        peer.distance = core.own_kademlia_address.distance(&peer.kademlia_address);
        peer.uri = info.valid_uri().cloned();
        peer.verified = info.verified;
        peer.last_reporter = Some(*reporter);

        if let Some(uri) = &peer.uri {
            self.known_uris.entry(uri.clone()).or_default().address = Some(address);
        }

        trace!("New peer {address} reported by {reporter}");
        self.known_peers.insert(address, peer);
        self.place(core, &address);
    }

    /// Merges the non-empty fields of `info` into a known record.
    fn merge(&mut self, info: &PeerInfo, reporter: &Address) {
        let address = info.address;
        let uri = info.valid_uri().cloned();

        if let Some(peer) = self.known_peers.get_mut(&address) {
            if let Some(uri) = &uri {
                peer.uri = Some(uri.clone());
            }
            peer.verified |= info.verified;
            peer.last_reporter = Some(*reporter);
        }

        if let Some(uri) = uri {
            self.known_uris.entry(uri).or_default().address = Some(address);
        }
    }

    /// Places a known peer in its bucket of each array, if not already
    /// there.
    fn place(&mut self, core: &TableCore, address: &Address) {
        let distance = match self.known_peers.get(address) {
            Some(peer) => core.own_kademlia_address.distance(&peer.kademlia_address),
            None => return,
        };

        let size = core.config.bucket_size;
        for kind in [BucketKind::Logarithm, BucketKind::Hamming] {
            let buckets = match kind {
                BucketKind::Logarithm => &mut self.by_logarithm,
                BucketKind::Hamming => &mut self.by_hamming,
            };
            let idx = bucket_id(&distance, kind).min(buckets.len() - 1);
            if let Some(evicted) =
                insert_with_eviction(&mut buckets[idx], address, &self.known_peers, size)
            {
                debug!("Evicted {evicted} from {kind:?} bucket {idx}");
            }
        }
    }

    /// Removes a peer from both bucket arrays, the record stays known.
    fn unplace(&mut self, address: &Address) {
        for bucket in self.by_logarithm.iter_mut().chain(self.by_hamming.iter_mut()) {
            bucket.remove(address);
        }
    }
}

/// Inserts `address` into a bucket. A full bucket evicts its least useful
/// entry if the newcomer ranks above it, otherwise the newcomer stays out.
///
/// Returns the evicted address.
fn insert_with_eviction(
    bucket: &mut Bucket,
    address: &Address,
    known_peers: &HashMap<Address, PeerInfo>,
    bucket_size: usize,
) -> Option<Address> {
    if bucket.contains(address) {
        return None;
    }

    if bucket.len() < bucket_size {
        bucket.add(*address);
        return None;
    }

    let newcomer = known_peers.get(address)?.eviction_rank();
    let weakest = bucket
        .iter()
        .filter_map(|a| known_peers.get(a))
        .min_by(|a, b| a.eviction_rank().cmp(&b.eviction_rank()))
        .map(|peer| (peer.address, peer.eviction_rank()));

    match weakest {
        Some((weakest, rank)) if rank < newcomer => {
            bucket.remove(&weakest);
            bucket.add(*address);
            Some(weakest)
        }
        _ => None,
    }
}

fn bucket_id(distance: &KademliaDistance, kind: BucketKind) -> usize {
    match kind {
        BucketKind::Logarithm => bucket_by_logarithm(distance),
        BucketKind::Hamming => bucket_by_hamming(distance),
    }
}

/// Groups of bucket indexes to visit, nearest group first.
///
/// For logarithm buckets every peer in a bucket below `start` is at the same
/// order of distance from the target, so they form one group, followed by
/// the buckets above `start` in increasing order. Hamming buckets have no
/// such structure and are visited alternating around `start`.
fn scan_order(start: usize, last: usize, kind: BucketKind) -> Vec<Vec<usize>> {
    let mut groups = vec![vec![start]];
    match kind {
        BucketKind::Logarithm => {
            groups.push((0..start).rev().collect());
            groups.extend((start + 1..=last).map(|i| vec![i]));
        }
        BucketKind::Hamming => {
            for i in 1..=last {
                if start >= i {
                    groups.push(vec![start - i]);
                }
                if start + i <= last {
                    groups.push(vec![start + i]);
                }
            }
        }
    }
    groups
}

/// Delay before a uri that failed `failures` times may be dialed again.
fn retry_delay(config: &TableConfig, failures: u64) -> Timestamp {
    let exp = failures.saturating_sub(1).min(32) as u32;
    let delay = config.retry_base_delay.saturating_mul(2_u64.saturating_pow(exp));
    delay.min(config.retry_max_delay) as Timestamp
}
