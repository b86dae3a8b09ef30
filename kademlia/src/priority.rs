use std::cmp::Ordering;

use crate::{
    address::{Address, KADEMLIA_MAX_ID},
    config::TrackerConfig,
    utils::{now, Timestamp},
};

/// How far in the past a scheduled disconnect places the desired expiry.
const DISCONNECT_GRACE: Timestamp = 60;

/// Steepness of the four priority curves.
#[derive(Clone, Copy, Debug)]
pub struct PriorityCoefficients {
    pub expiry_decay: f64,
    pub bucket_decay: f64,
    pub connectivity_decay: f64,
    pub behaviour_decay: f64,
}

impl From<&TrackerConfig> for PriorityCoefficients {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            expiry_decay: config.expiry_decay,
            bucket_decay: config.bucket_decay,
            connectivity_decay: config.connectivity_decay,
            behaviour_decay: config.behaviour_decay,
        }
    }
}

impl Default for PriorityCoefficients {
    fn default() -> Self {
        (&TrackerConfig::default()).into()
    }
}

/// Connection score of one peer within a pool.
///
/// Recomputed every tick, never persisted.
#[derive(Clone, Debug)]
pub struct AddressPriority {
    pub address: Address,
    pub is_connected: bool,
    pub is_incoming: bool,
    pub priority: f64,
    /// Persistent links are kept through a restart of the transport,
    /// temporary ones are dropped once `desired_expiry` passes.
    pub persistent: bool,
    pub connected_since: Option<Timestamp>,
    /// `None` means the entry never expires.
    pub desired_expiry: Option<Timestamp>,
    /// Bucket id of the peer in the pool's bucket array.
    pub bucket: usize,
    /// Accumulated behaviour feedback, 0 is neutral.
    pub connection_value: f64,
}

impl AddressPriority {
    pub fn new(address: Address, bucket: usize) -> Self {
        Self {
            address,
            is_connected: false,
            is_incoming: false,
            priority: 0.0,
            persistent: true,
            connected_since: None,
            desired_expiry: None,
            bucket,
            connection_value: 0.0,
        }
    }

    /// Recomputes `priority` as of now.
    pub fn update_priority(&mut self, coefficients: &PriorityCoefficients) {
        self.update_priority_at(coefficients, now())
    }

    /// Recomputes `priority` as of `at`.
    ///
    /// The score is the product of four logistic curves: time left before
    /// the desired expiry, behaviour, bucket and connection time. Expired
    /// temporary entries score 0, below every live entry whatever its
    /// bucket.
    pub fn update_priority_at(&mut self, coefficients: &PriorityCoefficients, at: Timestamp) {
        if self.is_expired(at) {
            self.priority = 0.0;
            return;
        }

        let expiry = match self.desired_expiry {
            Some(expiry) => sigmoid(coefficients.expiry_decay * (expiry - at) as f64),
            None => 1.0,
        };

        let behaviour = sigmoid(coefficients.behaviour_decay * self.connection_value);

        let middle = (KADEMLIA_MAX_ID / 2) as f64;
        let bucket = sigmoid(coefficients.bucket_decay * (middle - self.bucket as f64));

        let connected_for = match (self.is_connected, self.connected_since) {
            (true, Some(since)) => (at - since).max(0) as f64,
            _ => 0.0,
        };
        let connect_time = sigmoid(coefficients.connectivity_decay * connected_for);

        self.priority = expiry * behaviour * bucket * connect_time;
    }

    /// Marks the entry for teardown on the next tick.
    pub fn schedule_disconnect(&mut self) {
        let now = now();
        self.persistent = false;
        self.connected_since = Some(now);
        self.desired_expiry = Some(now - DISCONNECT_GRACE);
        self.connection_value = 0.0;
    }

    /// Returns true if the entry should be kept as a persistent link.
    pub fn preferably_persistent(&self, threshold: f64) -> bool {
        self.persistent || self.priority > threshold
    }

    pub fn make_persistent(&mut self) {
        self.persistent = true;
        self.desired_expiry = None;
    }

    /// Turns the entry into a temporary one expiring at `expiry`.
    pub fn make_temporary(&mut self, expiry: Timestamp) {
        self.persistent = false;
        self.desired_expiry = Some(expiry);
    }

    /// Returns true if the entry is temporary and its expiry has passed.
    pub fn is_expired(&self, at: Timestamp) -> bool {
        !self.persistent && self.desired_expiry.is_some_and(|expiry| expiry < at)
    }

    /// Marks the entry as connected, keeping the earliest connection time.
    pub fn set_connected(&mut self, incoming: bool, at: Timestamp) {
        if !self.is_connected {
            self.connected_since = Some(at);
        }
        self.is_connected = true;
        self.is_incoming = incoming;
    }

    pub fn set_disconnected(&mut self) {
        self.is_connected = false;
        self.is_incoming = false;
        self.connected_since = None;
    }
}

impl PartialEq for AddressPriority {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl PartialOrd for AddressPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.priority.partial_cmp(&other.priority)
    }
}

/// Sorts the entries by decreasing priority. Equal priorities are ordered
/// by address so that consecutive ticks pick the same peers.
pub fn sort_by_priority(entries: &mut [AddressPriority]) {
    entries.sort_by(|a, b| {
        b.priority
            .total_cmp(&a.priority)
            .then_with(|| a.address.cmp(&b.address))
    });
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
