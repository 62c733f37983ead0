//! Network access to the hosted backend and app origin.

pub mod client;
pub mod types;

pub use client::{ReqwestTransport, Transport};
#[cfg(test)]
pub use client::TransportError;
pub use types::{CapturedRequest, HttpRequest, HttpResponse};
