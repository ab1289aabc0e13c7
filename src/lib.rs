pub mod authz;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod inbox;
pub mod ipc;
pub mod runtime;
pub mod scheduler;
pub mod shared;
pub mod store;
pub mod tenant;
pub mod worker;
