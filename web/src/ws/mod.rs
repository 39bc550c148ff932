//! WebSocket HTTP handler for the web layer.
//!
//! This module contains only the Axum upgrade handler. The connection
//! registry, send pump and broadcast live in the `hub` crate so that event
//! producers can reach them without depending on the web layer.

pub mod handler;
