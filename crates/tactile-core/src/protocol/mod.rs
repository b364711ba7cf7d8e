//! Protocol module containing message types, the registration table, the
//! structural schema and the JSON wire codec.

pub mod codec;
pub mod messages;
pub mod schema;
pub mod sequence;
pub mod table;

pub use codec::{decode_messages, encode_message, encode_messages, DecodeError};
pub use messages::*;
pub use sequence::MessageIdCounter;
