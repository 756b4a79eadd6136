//! Daemon side of autotun
//!
//! Process lifecycle, the IPC socket and the service that hosts the engine.

pub mod ipc;
pub mod process;
pub mod service;
