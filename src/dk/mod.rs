pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod pid;
pub mod platform;
pub mod process;
pub mod worker;
