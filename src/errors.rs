//! Errors for the skybind client.
use std::path::PathBuf;
use thiserror::Error;

use crate::models::PacketKind;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Database error")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Database transaction error")]
    DatabaseTransactionError(#[from] crate::database::TransactionError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("HTTP error")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Lock error")]
    LockError(String),

    #[error("Failed to open database at {path}: {origin}")]
    DatabaseOpenError { path: PathBuf, origin: String },

    #[error("Database configuration error - {message}: {origin}")]
    DatabaseConfigError { message: String, origin: String },

    #[error("Failed to create table {table}: {origin}")]
    TableCreationError { table: String, origin: String },

    #[error("Failed to create index {index}: {origin}")]
    IndexCreationError { index: String, origin: String },

    #[error("Database structure invalid: {message}")]
    DatabaseCorrupt { message: String },

    #[error("Configuration invalid: {message}")]
    ConfigurationError { message: String },

    #[error("Invalid {kind:?} packet: {reason}")]
    InvalidPacket { kind: PacketKind, reason: String },

    #[error("Unknown packet kind {0}")]
    UnknownPacketKind(i64),

    #[error("Unknown send state {0}")]
    UnknownSendState(i64),

    #[error("Packet {packet_id} is already bound to a track")]
    PacketAlreadyBound { packet_id: i64 },

    #[error("Decoder executable not found: {path}")]
    DecoderNotFound { path: PathBuf },

    #[error("Decoder failed to start: {origin}")]
    DecoderSpawnError { origin: String },

    #[error("Decoder TCP port {host}:{port} unreachable after {attempts} attempts")]
    DecoderUnreachable {
        host: String,
        port: u16,
        attempts: u32,
    },
}
