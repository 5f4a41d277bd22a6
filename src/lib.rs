pub mod buffer;
pub mod config;
pub mod sink;
pub mod stream;
pub mod types;

pub use config::StreamConfig;
pub use sink::{BatchSink, MemorySink, SinkError, SinkGate};
pub use stream::{StreamError, WriteStream};
pub use types::{BatchOp, OperationKind, WriteItem};
