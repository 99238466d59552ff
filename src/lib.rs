//! Single-threaded, event-driven networking core: request scheduling,
//! datacenter multiplexing, and session maintenance over an encrypted
//! framed transport (§1 OVERVIEW).
//!
//! The wire codec and the actual socket/TLS layer are out of scope
//! (§1 Non-goals) — this crate owns everything "above" the bytes: what
//! to send, to which datacenter, on which connection, and how to react
//! to what comes back.

pub mod clock;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod datacenter;
pub mod dc_list;
pub mod delegate;
pub mod error;
pub mod event_loop;
pub mod gzip;
pub mod instance;
pub mod request;
pub mod wire;

pub use clock::{Clock, MessageIdGenerator, SystemClock};
pub use config::{ConfigRecord, ConfigStore};
pub use connection::{Connection, ConnectionClass, ConnectionState};
pub use coordinator::{Coordinator, DispatchBatch, NetworkMessage, Task};
pub use datacenter::{Datacenter, DcAddress};
pub use delegate::{Delegate, NullDelegate};
pub use error::RpcError;
pub use event_loop::{EventLoop, InboundFrame};
pub use instance::{Engine, InstanceRegistry};
pub use request::{CompletionCallback, RequestFlags, RequestResult, CURRENT_DATACENTER};
