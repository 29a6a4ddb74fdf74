//! HTTP surface: the check endpoint and the rejection contract.

pub mod response;
mod server;
mod service;

pub use response::{Rejection, Verdict, TOO_MANY_REQUESTS};
pub use server::HttpServer;
pub use service::{router, AppState};
