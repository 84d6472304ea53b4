//! Wire protocol between the supervisor and its client.

pub mod codec;
pub mod types;

pub use codec::{CodecError, Encoder, Parser, Tag, MAX_ARRAY_ITEMS, MAX_FIELD_BYTES};
pub use types::{
    ClientMessage, HandshakeRequest, HandshakeResponse, LaunchResponse, LaunchSpec, ReportChild,
    ServerMessage, Termination, WaitRequest, WaitResponse, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    REJECTED_VERSION, WAIT_NOT_TERMINATED, WAIT_NO_SUCH_CHILD, WAIT_OK,
};
