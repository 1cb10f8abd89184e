//! RON wire protocol.
//!
//! The long-lived controller–agent session format: magic handshake,
//! self-delimiting MessagePack records, the message envelope with its
//! tagged payload variants, command/response/filter model, and the trunk
//! convention for carrying opaque byte streams inside a session.

pub mod client;
pub mod codec;
pub mod command;
pub mod error;
pub mod message;
pub mod trunk;

pub use client::{mangle_uuid, normalize_uuid, ClientSnapshot, ProcessInfo};
pub use codec::{
    from_record, handshake_accept, handshake_dial, to_record, Decoder, Sender, MAGIC,
};
pub use command::{Command, ConnTest, Filter, LogLevel, Response, SendFile};
pub use error::ProtoError;
pub use message::{
    FileChunk, Message, Payload, PipeFrame, PipeOp, UfsFrame, UfsOp, PART_SIZE, VERSION,
};
pub use trunk::{Trunk, TRUNK_CHUNK};
