pub mod cli;
pub mod config;
pub mod constants;
pub mod digest;
pub mod error;
pub mod paths;
pub mod runtime;
pub mod services;
