use std::{fs, path::Path};

use bincode::{Decode, Encode};

use muddle_core::util::{decode, encode};

use crate::{address::Address, utils::Timestamp, Result, Uri};

use super::PeerInfo;

/// On-disk image of a [`super::KademliaTable`].
#[derive(Debug, Default, Encode, Decode)]
pub(super) struct TableCache {
    /// Only peers with a valid uri are written.
    pub known_peers: Vec<PeerInfo>,
    pub desired_connection_expiry: Vec<(Address, Timestamp)>,
    pub desired_uri_expiry: Vec<(Uri, Timestamp)>,
    pub desired_peers: Vec<Address>,
    pub desired_uris: Vec<Uri>,
}

impl TableCache {
    /// Writes the cache next to `path` then renames it into place.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = encode(self)?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reads a cache previously written with [`TableCache::write`].
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let (cache, _) = decode::<TableCache>(&bytes)?;
        Ok(cache)
    }
}
