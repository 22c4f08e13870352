// src/lib.rs
// Whist session core: reactive orchestration of login, windows and the native client

pub mod cli;
pub mod config;
pub mod gateway;
pub mod orchestrator;
pub mod protocol;
pub mod state;
pub mod store;
pub mod trigger;
pub mod windows;
