//! Protocol module containing message types, the envelope codec and
//! sequence numbering.

pub mod clock;
pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_envelope, encode_envelope, ProtocolError};
pub use messages::*;
pub use sequence::{ReplayGuard, SequenceCounter};
