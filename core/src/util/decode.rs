use bincode::Decode;

use crate::Result;

/// The most bytes a single decode may claim, across every nested
/// collection of the value.
pub const MAX_DECODE_SIZE: usize = 8 * 1024 * 1024;

/// Decodes a `T` from `src`, returning it with the number of bytes read.
///
/// Length prefixes are checked against [`MAX_DECODE_SIZE`] before anything
/// is allocated, so bytes from a remote peer or a damaged file fail with an
/// error instead of aborting the process.
pub fn decode<T: Decode<()>>(src: &[u8]) -> Result<(T, usize)> {
    let config = bincode::config::standard()
        .with_fixed_int_encoding()
        .with_limit::<MAX_DECODE_SIZE>();
    let (result, bytes_read) = bincode::decode_from_slice::<T, _>(src, config)?;
    Ok((result, bytes_read))
}
