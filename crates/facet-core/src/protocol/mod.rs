//! Wire protocol shared by client and server.
//!
//! - **Envelope**: the tagged message type and its fault codes
//! - **Codec**: JSON encoding and structural validation
//! - **Frame**: length-prefixed framing over a byte stream

pub mod codec;
pub mod envelope;
pub mod frame;

pub use codec::{decode, encode, DecodeFault};
pub use envelope::{new_id, Body, Envelope, FaultCode};
pub use frame::{read_frame, write_frame};
