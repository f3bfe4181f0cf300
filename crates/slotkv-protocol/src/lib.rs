//! Wire protocol for slotkv.
//!
//! Defines the framing and message types exchanged between clients, storage
//! nodes, and the directory, plus the async service traits every component
//! is written against. The TCP stack and the in-process test network both
//! implement these traits.

pub mod codec;
pub mod error;
pub mod message;
pub mod service;

pub use codec::{read_message, write_message, SlotkvCodec};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    CommandResponse, DirectoryRequest, DirectoryResponse, ManagementRequest, ManagementResponse,
    Message, Notification, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use service::{
    BlockConnection, ChainConnection, ChainLink, DirectoryService, StorageManagement, Transport,
    CHANNEL_CAPACITY,
};
