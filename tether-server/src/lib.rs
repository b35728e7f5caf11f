//! # tether-server
//!
//! The administration side of the tether suite: accepts many agent
//! connections, tracks endpoint identities, and exposes the request
//! operations (directory listing, file download/upload, sysinfo,
//! remote execution) keyed by endpoint identity.

pub mod service;

pub use service::{ServerService, ServiceDelegate};
