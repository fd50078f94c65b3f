pub mod api;
pub mod config;
mod server;

pub use api::*;
pub use config::*;
pub use server::{DynLinkageApi, ServerError, build_api_router, build_router, serve};
