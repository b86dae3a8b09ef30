use crate::address::{Address, KademliaDistance, KADEMLIA_MAX_ID};

/// The number of entries that can be stored within a single bucket.
pub const BUCKET_SIZE: usize = 20;

/// The number of buckets in each bucket array, one per possible bucket id.
pub const BUCKET_COUNT: usize = KADEMLIA_MAX_ID + 1;

/// Bucket id by the position of the highest set bit of the distance.
///
/// Returns 0 only for the zero distance and `KADEMLIA_MAX_ID` when the most
/// significant bit is set.
pub fn bucket_by_logarithm(distance: &KademliaDistance) -> usize {
    KADEMLIA_MAX_ID - distance.leading_zeros()
}

/// Bucket id by the number of differing bits.
///
/// Uses the same convention as [`bucket_by_logarithm`]: 0 only for the zero
/// distance, smaller ids for peers that agree with us on more bits. This is
/// the popcount itself rather than the inverted `KADEMLIA_MAX_ID - popcount`,
/// so the bucket term of the priority favours close peers in both pools.
pub fn bucket_by_hamming(distance: &KademliaDistance) -> usize {
    distance.count_ones()
}

/// A Bucket holds the addresses of the peers in one distance class.
///
/// The peer records themselves live in the table, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    entries: Vec<Address>,
}

impl Bucket {
    /// Creates a new empty Bucket
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(BUCKET_SIZE),
        }
    }

    /// Add an address to the bucket.
    pub fn add(&mut self, address: Address) {
        if !self.contains(&address) {
            self.entries.push(address);
        }
    }

    /// Get the number of entries in the bucket.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns an iterator over the addresses in the bucket.
    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.entries.iter()
    }

    /// Remove an address, returns true if it was present.
    pub fn remove(&mut self, address: &Address) -> bool {
        let position = self.entries.iter().position(|e| e == address);
        match position {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Check if the bucket contains the given address.
    pub fn contains(&self, address: &Address) -> bool {
        self.entries.iter().any(|e| e == address)
    }
}
