//! Remote Procedure Call module
//! Dispatcher, marshaling engine and the local and remote callers

pub mod agent;
pub mod common;
pub mod local;
pub mod marshal;
pub mod proxy;
pub mod remote;

pub use agent::{Agent, AgentState};
pub use local::{LocalCaller, LocalProxy};
pub use marshal::{Arg, Marshaler};
pub use proxy::{CallOutcome, PendingResult};
pub use remote::{RemoteClient, RemoteEvent, RemoteProxy};
