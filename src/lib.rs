//! Ingestion client for the skybind radar surveillance pipeline.
//!
//! An external decoder process emits K1/K2 radar packets as text lines over a
//! local TCP socket. This crate parses those lines, stores them in an embedded
//! SQLite database, correlates K1 (callsign) packets with K2 (height/fuel)
//! packets into flight tracks, and delivers the tracks to a remote ingest API
//! with HMAC-signed requests. A separate heartbeat reports bringup and
//! connection health to a status endpoint.

pub mod api;
pub mod config;
pub mod correlator;
pub mod database;
pub mod decoder;
pub mod errors;
pub mod models;
pub mod parser;
pub mod pinger;
pub mod sender;
pub mod status;
pub mod timesync;
