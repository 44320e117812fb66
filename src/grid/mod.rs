//! The remote grid as seen by the client: value types, the call contract,
//! gRPC channel connections and an in-memory implementation.

pub mod service;
pub mod simulator;
pub mod transport;
pub mod types;

pub use service::GridService;
pub use simulator::{InMemoryGrid, SimConnection};
pub use transport::{ChannelConnection, ChannelConnector};
pub use types::{
    ResultId, ResultStatus, ServiceConfiguration, SessionId, StatusCode, StatusCounts,
    TaskCreation, TaskDefinition, TaskId, TaskInfo, TaskOutput, TaskStatus, UploadFrame,
};
