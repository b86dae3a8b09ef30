use bincode::Encode;

use crate::Result;

/// Encode the given type `T` into a `Vec<u8>`.
///
/// Uses fixed-width integers so that identifiers and counters always occupy
/// the same number of bytes on the wire and on disk.
pub fn encode<T: Encode>(src: &T) -> Result<Vec<u8>> {
    let vec = bincode::encode_to_vec(src, bincode::config::standard().with_fixed_int_encoding())?;
    Ok(vec)
}
