pub mod channels;
pub mod commands;
pub mod config;
pub mod groups;
pub mod heartbeat;
pub mod ipc;
pub mod mounts;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod shared;
pub mod store;
