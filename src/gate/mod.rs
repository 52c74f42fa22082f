//! Gate build and execution (§4.4, §4.5, §4.7).
//!
//! A gate is a self-contained executor deployed once per host: `builder`
//! assembles its archive, `resident` implements its wire-protocol dispatch
//! loop, and `lifecycle` manages the connection that runs it end to end.

pub mod builder;
pub mod lifecycle;
pub mod resident;

pub use builder::{GateBuildConfig, GateBuilder};
pub use lifecycle::{GateConnection, GateLifecycle};
pub use resident::{Dispatcher, FastPathModule, GateIdentity, ModuleTable, SyncModule};
