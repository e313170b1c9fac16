//! Binary wire format shared by the transport and the channel protocol.
//!
//! Every protocol payload is an ordered sequence of byte strings, each one
//! written as a big-endian `u32` length followed by the bytes. Lengths are
//! explicit, so payloads may carry any byte value including NUL and newline.

pub mod codec;

pub use codec::{pack, unpack, unpack_strings, CodecError, CodecResult};
