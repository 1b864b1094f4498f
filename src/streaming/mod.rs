//! Push-direction transfer streaming.
//!
//! One connection carries a single transfer session. The dispatcher
//! correlates every outgoing message with its response; writers turn
//! records pushed by the caller into batched step events.
//!
//! # Architecture
//!
//! ```text
//! +----------------+
//! | StepWriter x3  | --+
//! | (entities,     |   |     +--------------+     +--------------+
//! |  links, config)|   +-->  |  Dispatcher  | --> |  Connection  |
//! +----------------+   |     | (uuid table) | <-- | (ws / memory)|
//! |  AssetWriter   | --+     +--------------+     +--------------+
//! +----------------+
//! ```
//!
//! Each step goes `start -> stream* -> end` exactly once. Steps are
//! independent and may be driven concurrently over the shared connection.

pub mod assets;
pub mod batch;
pub mod dispatcher;
pub mod protocol;
pub mod writer;

pub use assets::{Asset, AssetWriter};
pub use batch::{AssetBatch, RecordBatch};
pub use dispatcher::{Dispatcher, TransferProperties, CLOSE_TIMEOUT};
pub use writer::{SessionSteps, StepGuard, StepWriter};

pub use protocol::{
    AssetEvent, AssetStart, AssetStats, ClientMessage, Command, EndParams, InitOptions,
    InitParams, InitResponse, ServerMessage, Step, StepAction, TransferAction, TransferKind,
    ASSET_CHUNK_SIZE, DEFAULT_BATCH_SIZE, TRANSFER_PATH,
};
