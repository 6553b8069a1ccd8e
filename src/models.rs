//! Data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ClientError;

/// Packet family emitted by the decoder.
///
/// K1 lines carry an aircraft callsign; K2 lines carry flight level and fuel
/// for an aircraft in the same airspace. The two are correlated by time into
/// a [`FlightTrack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    K1,
    K2,
}

impl PacketKind {
    /// Column encoding in `packets_raw.type`.
    pub fn as_i64(self) -> i64 {
        match self {
            PacketKind::K1 => 1,
            PacketKind::K2 => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self, ClientError> {
        match value {
            1 => Ok(PacketKind::K1),
            2 => Ok(PacketKind::K2),
            other => Err(ClientError::UnknownPacketKind(other)),
        }
    }
}

/// Delivery state shared by raw packets and flight tracks.
///
/// Stored as an integer so the database file stays inspectable with plain
/// SQL: 0 = pending, 1 = done, -1 = failed. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendState {
    Pending,
    Done,
    Failed,
}

impl SendState {
    pub fn as_i64(self) -> i64 {
        match self {
            SendState::Pending => 0,
            SendState::Done => 1,
            SendState::Failed => -1,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self, ClientError> {
        match value {
            0 => Ok(SendState::Pending),
            1 => Ok(SendState::Done),
            -1 => Ok(SendState::Failed),
            other => Err(ClientError::UnknownSendState(other)),
        }
    }
}

/// A decoded packet about to be inserted.
///
/// Invariant: K1 packets carry a callsign and no height/fuel; K2 packets
/// carry height/fuel and no callsign. [`NewPacket::validate`] enforces this
/// before the row is written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPacket {
    pub event_time: DateTime<Utc>,
    pub kind: PacketKind,
    pub callsign: Option<String>,
    pub height_m: Option<i64>,
    pub fuel_pct: Option<i64>,
    pub alarm: i64,
    pub faithfulness: i64,
}

impl NewPacket {
    /// Build a K1 packet with the decoder's default quality fields.
    pub fn k1(event_time: DateTime<Utc>, callsign: String) -> Self {
        Self {
            event_time,
            kind: PacketKind::K1,
            callsign: Some(callsign),
            height_m: None,
            fuel_pct: None,
            alarm: 0,
            faithfulness: 50,
        }
    }

    /// Build a K2 packet with the decoder's default quality fields.
    pub fn k2(event_time: DateTime<Utc>, height_m: i64, fuel_pct: i64) -> Self {
        Self {
            event_time,
            kind: PacketKind::K2,
            callsign: None,
            height_m: Some(height_m),
            fuel_pct: Some(fuel_pct),
            alarm: 0,
            faithfulness: 0,
        }
    }

    /// Check the kind/field invariant.
    pub fn validate(&self) -> Result<(), ClientError> {
        let valid = match self.kind {
            PacketKind::K1 => {
                self.callsign.as_deref().is_some_and(|c| !c.is_empty())
                    && self.height_m.is_none()
                    && self.fuel_pct.is_none()
            }
            PacketKind::K2 => {
                self.callsign.is_none() && self.height_m.is_some() && self.fuel_pct.is_some()
            }
        };
        if valid {
            Ok(())
        } else {
            Err(ClientError::InvalidPacket {
                kind: self.kind,
                reason: "kind/field invariant violated".to_string(),
            })
        }
    }
}

/// A stored raw packet row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub id: i64,
    pub event_time: DateTime<Utc>,
    pub kind: PacketKind,
    pub callsign: Option<String>,
    pub height_m: Option<i64>,
    pub fuel_pct: Option<i64>,
    pub alarm: i64,
    pub faithfulness: i64,
    pub sent: SendState,
    pub bound_to_track: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A correlated K1/K2 pair, the unit of delivery to the ingest API.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightTrack {
    pub id: i64,
    pub k1_packet_id: i64,
    pub k2_packet_id: i64,
    pub callsign: String,
    pub height_m: i64,
    pub fuel_pct: i64,
    /// The K2 event time; K2 carries the dynamic quantities.
    pub timestamp: DateTime<Utc>,
    pub sent: SendState,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}
