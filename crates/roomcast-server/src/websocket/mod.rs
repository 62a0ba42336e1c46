//! Per-connection machinery: transport seam, pumps, keepalive and dispatch.

pub mod connection;
pub mod handler;
pub mod keepalive;
pub mod transport;
