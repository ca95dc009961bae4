pub mod agent;
pub mod config;
pub mod error;
pub mod execution;
pub mod extcron;
pub mod fsm;
pub mod gossip;
pub mod grpc;
pub mod job;
pub mod notifier;
pub mod plugins;
pub mod raft;
pub mod sched;
pub mod shutdown;
pub mod store;
pub mod timeutil;
pub mod tls;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("cronmesh");
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CODENAME: &str = "timberline";

/// Protocol versions this agent can speak and understand.
pub const PROTOCOL_VERSION_MIN: u32 = 1;
pub const PROTOCOL_VERSION_MAX: u32 = 1;
