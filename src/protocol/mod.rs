//! Registry wire protocol
//!
//! Sync messages and the framing used to carry them over a byte stream.

pub mod frame;
pub mod message;

pub use frame::{
    encode_frame, write_frame, write_queue, FrameDecoder, FrameReader, DEFAULT_MAX_FRAME_SIZE,
};
pub use message::{decode_node_ids, encode_node_ids, RegistryMessage, SyncMessage};
