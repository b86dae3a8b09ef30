use std::cmp::Ordering;

use base64::{engine::general_purpose::STANDARD, Engine};
use bincode::{Decode, Encode};
use sha2::{Digest, Sha256};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Error;

/// Specifies the size of a node address, in bytes.
pub const ADDRESS_SIZE: usize = 32;

/// Specifies the size of a kademlia address, in bytes.
pub const KADEMLIA_ADDRESS_SIZE: usize = 20;

/// The number of bits in a kademlia address.
pub const KADEMLIA_MAX_ID: usize = KADEMLIA_ADDRESS_SIZE * 8;

/// The unique identifier of a node, usually derived from its public key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Decode, Encode)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// Returns the raw bytes of the address.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the base64 representation of the address.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl From<[u8; ADDRESS_SIZE]> for Address {
    fn from(b: [u8; ADDRESS_SIZE]) -> Self {
        Address(b)
    }
}

impl TryFrom<&[u8]> for Address {
    type Error = Error;

    fn try_from(src: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; ADDRESS_SIZE] =
            src.try_into().map_err(|_| Error::InvalidAddressSize {
                expected: ADDRESS_SIZE,
                got: src.len(),
            })?;
        Ok(Address(bytes))
    }
}

/// Position of a node in the kademlia key space, a digest of its [`Address`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Decode, Encode)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KademliaAddress(pub [u8; KADEMLIA_ADDRESS_SIZE]);

impl KademliaAddress {
    /// Derives the kademlia address of the given node address.
    pub fn create(address: &Address) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(address.as_bytes());
        let digest = hasher.finalize();

        let mut id = [0; KADEMLIA_ADDRESS_SIZE];
        id.copy_from_slice(&digest[..KADEMLIA_ADDRESS_SIZE]);
        Self(id)
    }

    /// Calculates the XOR distance to another kademlia address.
    pub fn distance(&self, other: &KademliaAddress) -> KademliaDistance {
        let mut res = [0; KADEMLIA_ADDRESS_SIZE];
        for (i, (k, o)) in self.0.iter().zip(other.0.iter()).enumerate() {
            res[i] = k ^ o;
        }
        KademliaDistance(res)
    }
}

impl TryFrom<&[u8]> for KademliaAddress {
    type Error = Error;

    fn try_from(src: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KADEMLIA_ADDRESS_SIZE] =
            src.try_into().map_err(|_| Error::InvalidAddressSize {
                expected: KADEMLIA_ADDRESS_SIZE,
                got: src.len(),
            })?;
        Ok(KademliaAddress(bytes))
    }
}

/// The XOR distance between two kademlia addresses.
///
/// The last byte is the most significant one: distances are ordered by their
/// bytes from the last index downward.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Decode, Encode)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KademliaDistance(pub [u8; KADEMLIA_ADDRESS_SIZE]);

impl KademliaDistance {
    /// Returns true if both addresses were identical.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits, counted from the most significant byte.
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for b in self.0.iter().rev() {
            if *b != 0 {
                return zeros + b.leading_zeros() as usize;
            }
            zeros += 8;
        }
        zeros
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl Ord for KademliaDistance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl PartialOrd for KademliaDistance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Calculates the distance between two node addresses in the kademlia key
/// space.
pub fn distance(a: &Address, b: &Address) -> KademliaDistance {
    KademliaAddress::create(a).distance(&KademliaAddress::create(b))
}
