use serde::{Deserialize, Serialize};
use slotkv_types::{BlockId, ChainRole, DataStatus, ReplicaChain, SequenceId, SlotRange};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Response delivered by a chain tail to the client that issued the request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub seq: SequenceId,
    pub result: Vec<String>,
}

/// Published by a tail for every applied mutator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub op: String,
    pub key: String,
}

/// Directory-to-block management calls.
///
/// `block` is the block number within the receiving storage node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ManagementRequest {
    SetupBlock {
        block: u32,
        path: String,
        slot_range: SlotRange,
        chain: Vec<BlockId>,
        auto_scale: bool,
        role: ChainRole,
        next: Option<BlockId>,
    },
    SlotRange { block: u32 },
    Path { block: u32 },
    Load { block: u32, backing_path: String },
    Sync { block: u32, backing_path: String },
    Dump { block: u32, backing_path: String },
    Reset { block: u32 },
    SetExporting { block: u32, target: Vec<BlockId>, slot_range: SlotRange },
    SetupAndSetImporting {
        block: u32,
        path: String,
        slot_range: SlotRange,
        chain: Vec<BlockId>,
        role: ChainRole,
        next: Option<BlockId>,
    },
    SetImporting { block: u32, slot_range: SlotRange },
    ExportSlots { block: u32 },
    SetRegular { block: u32, slot_range: SlotRange },
    StorageCapacity { block: u32 },
    StorageSize { block: u32 },
    ResendPending { block: u32 },
    ForwardAll { block: u32 },
    Ping,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementResponse {
    Done,
    SlotRange(SlotRange),
    Path(String),
    Size(u64),
}

/// Calls served by the directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DirectoryRequest {
    Create {
        path: String,
        backing_path: String,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    },
    Open { path: String },
    OpenOrCreate {
        path: String,
        backing_path: String,
        num_blocks: usize,
        chain_length: usize,
        flags: u32,
    },
    Exists { path: String },
    Remove { path: String },
    Dstatus { path: String },
    AddBlockToFile { path: String },
    SplitSlotRange { path: String, slot_range: SlotRange },
    MergeSlotRange { path: String, slot_range: SlotRange },
    ResolveFailures { path: String, chain: ReplicaChain },
    AddReplicaToChain { path: String, chain: ReplicaChain },
    HandleLeaseExpiry { path: String },
    Dump { path: String, backing_path: String },
    Load { path: String, backing_path: String },
    Sync { path: String, backing_path: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryResponse {
    Done,
    Status(DataStatus),
    Chain(ReplicaChain),
    Exists(bool),
}

/// All message types in the slotkv protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // Client to block, on the service port.
    GetClientId { block: u32 },
    ClientId { client_id: i64 },
    RegisterClient { block: u32, client_id: i64 },
    Registered,
    CommandRequest { block: u32, seq: SequenceId, op_id: i32, args: Vec<String> },
    CommandResponse(CommandResponse),
    RunCommand { block: u32, op_id: i32, args: Vec<String> },
    CommandResult { result: Vec<String> },
    Subscribe { block: u32, ops: Vec<String> },
    Subscribed,
    Notification(Notification),

    // Block to block, on the chain port.
    ChainOpen { block: u32 },
    ChainOpened,
    ChainRequest { seq: SequenceId, op_id: i32, args: Vec<String> },
    ChainAck { seq: SequenceId },

    // Directory to block, on the management port.
    Management(ManagementRequest),
    ManagementReply(ManagementResponse),

    // Anyone to directory.
    Directory(DirectoryRequest),
    DirectoryReply(DirectoryResponse),

    Error { code: u32, message: String },
}

impl Message {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::GetClientId { .. } => 1,
            Self::ClientId { .. } => 2,
            Self::RegisterClient { .. } => 3,
            Self::Registered => 4,
            Self::CommandRequest { .. } => 5,
            Self::CommandResponse(_) => 6,
            Self::RunCommand { .. } => 7,
            Self::CommandResult { .. } => 8,
            Self::Subscribe { .. } => 9,
            Self::Subscribed => 10,
            Self::Notification(_) => 11,
            Self::ChainOpen { .. } => 20,
            Self::ChainOpened => 23,
            Self::ChainRequest { .. } => 21,
            Self::ChainAck { .. } => 22,
            Self::Management(_) => 30,
            Self::ManagementReply(_) => 31,
            Self::Directory(_) => 40,
            Self::DirectoryReply(_) => 41,
            Self::Error { .. } => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::GetClientId { .. } => "GetClientId",
            Self::ClientId { .. } => "ClientId",
            Self::RegisterClient { .. } => "RegisterClient",
            Self::Registered => "Registered",
            Self::CommandRequest { .. } => "CommandRequest",
            Self::CommandResponse(_) => "CommandResponse",
            Self::RunCommand { .. } => "RunCommand",
            Self::CommandResult { .. } => "CommandResult",
            Self::Subscribe { .. } => "Subscribe",
            Self::Subscribed => "Subscribed",
            Self::Notification(_) => "Notification",
            Self::ChainOpen { .. } => "ChainOpen",
            Self::ChainOpened => "ChainOpened",
            Self::ChainRequest { .. } => "ChainRequest",
            Self::ChainAck { .. } => "ChainAck",
            Self::Management(_) => "Management",
            Self::ManagementReply(_) => "ManagementReply",
            Self::Directory(_) => "Directory",
            Self::DirectoryReply(_) => "DirectoryReply",
            Self::Error { .. } => "Error",
        }
    }
}
