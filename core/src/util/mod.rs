mod decode;
mod encode;
mod path;

pub use decode::{decode, MAX_DECODE_SIZE};
pub use encode::encode;
pub use path::{home_dir, tilde_expand};
