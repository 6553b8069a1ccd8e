//! Database functionality for packet and flight track storage
//!
//! This module provides a thread-safe interface for:
//! - Storing raw K1/K2 packets as they are parsed
//! - Creating flight tracks and binding their packets atomically
//! - Tracking delivery state of tracks handed to the ingest API
//! - An append-only, best-effort audit log

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, Transaction};
use thiserror::Error;
use tracing::{error, info};

use crate::errors::ClientError;
use crate::models::{FlightTrack, LogLevel, NewPacket, PacketKind, RawPacket, SendState};

/// A guard that ensures proper shutdown of the database.
///
/// When dropped, this guard checkpoints the WAL so everything the workers
/// wrote is on disk before the process exits.
#[derive(Debug)]
pub struct DbDropGuard {
    /// The `Db` instance that will be flushed when this guard is dropped
    db: Db,
}

/// Thread-safe database handle shared by the four workers.
///
/// This type is cheap to clone; all clones share one SQLite connection whose
/// writes are serialized through an internal mutex. Critical sections are
/// short and never await, so a `std::sync::Mutex` is deliberate here.
#[derive(Clone, Debug)]
pub struct Db {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DatabaseState>,
}

/// Database connection state, protected by the mutex in [`Shared`].
#[derive(Debug)]
struct DatabaseState {
    connection: Connection,
}

/// Transaction error wrapper for better context
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Failed to execute transaction: {context}")]
    Execute {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Failed to commit transaction: {context}")]
    Commit {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Fields of a flight track supplied by the correlator; ids and state are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrack {
    pub callsign: String,
    pub height_m: i64,
    pub fuel_pct: i64,
    pub timestamp: DateTime<Utc>,
}

impl DbDropGuard {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// Returns error if:
    /// - The file cannot be opened or is not a SQLite database
    /// - Tables or indices cannot be created
    pub fn open(path: &Path) -> Result<Self, ClientError> {
        Ok(DbDropGuard {
            db: Db::open(path)?,
        })
    }

    /// Gets a handle to the database
    ///
    /// The returned handle is cheap to clone and can be shared between tasks.
    pub fn db(&self) -> Db {
        self.db.clone()
    }
}

impl Drop for DbDropGuard {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            error!("Final database flush failed: {}", e);
        }
    }
}

/// Millisecond storage for all timestamps; keeps ordering comparisons exact.
fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl Db {
    fn open(path: &Path) -> Result<Self, ClientError> {
        info!("Opening database at {}", path.display());

        let conn = DatabaseState::open_database(path)?;
        DatabaseState::create_tables_indices(&conn)?;
        DatabaseState::verify_structure(&conn)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(DatabaseState { connection: conn }),
        });

        Ok(Self { shared })
    }

    /// Insert a parsed packet, enforcing the kind/field invariant.
    ///
    /// Returns the assigned row id.
    pub fn insert_packet(&self, packet: &NewPacket) -> Result<i64, ClientError> {
        packet.validate()?;
        self.shared.execute_mut(|state| state.insert_packet(packet))
    }

    /// Unbound, still-pending packets of one kind, oldest event first.
    pub fn select_unbound_packets(
        &self,
        kind: PacketKind,
        limit: u32,
    ) -> Result<Vec<RawPacket>, ClientError> {
        self.shared
            .execute_mut(|state| state.select_unbound_packets(kind, limit))
    }

    /// Create a flight track and bind both packets to it in one transaction.
    ///
    /// Fails with [`ClientError::PacketAlreadyBound`] if either packet is
    /// already referenced by another track; nothing is written in that case.
    pub fn create_track_and_bind(
        &self,
        k1_id: i64,
        k2_id: i64,
        track: &NewTrack,
    ) -> Result<i64, ClientError> {
        self.shared
            .execute_mut(|state| state.create_track_and_bind(k1_id, k2_id, track))
    }

    /// Batched state transition for packets (stale aging).
    pub fn mark_packets(&self, ids: &[i64], outcome: SendState) -> Result<(), ClientError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.shared
            .execute_mut(|state| state.mark_packets(ids, outcome))
    }

    /// Tracks awaiting delivery, in id order.
    pub fn select_pending_tracks(&self, limit: u32) -> Result<Vec<FlightTrack>, ClientError> {
        self.shared
            .execute_mut(|state| state.select_pending_tracks(limit))
    }

    /// Batched state transition for tracks after a delivery attempt.
    pub fn mark_tracks(
        &self,
        ids: &[i64],
        outcome: SendState,
        error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), ClientError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.shared
            .execute_mut(|state| state.mark_tracks(ids, outcome, error, sent_at))
    }

    /// Append an audit log entry. Best-effort: a failure here is reported on
    /// the console and otherwise swallowed, it must never stop a worker.
    pub fn append_log(&self, level: LogLevel, component: &str, message: &str, details: Option<&str>) {
        let result = self
            .shared
            .execute_mut(|state| state.append_log(level, component, message, details));
        if let Err(e) = result {
            error!("Failed to write audit log entry: {}", e);
        }
    }

    /// Checkpoint the WAL.
    pub fn flush(&self) -> Result<(), ClientError> {
        self.shared.execute_mut(|state| state.flush())
    }
}

impl Shared {
    /// Execute a query that requires mutable access to the database
    fn execute_mut<F, T>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(&mut DatabaseState) -> Result<T, ClientError>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|e| ClientError::LockError(e.to_string()))?;
        f(&mut state)
    }
}

impl DatabaseState {
    /// Open or create the database with optimized settings
    fn open_database(path: &Path) -> Result<Connection, ClientError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_READ_WRITE,
        )
        .map_err(|e| ClientError::DatabaseOpenError {
            path: path.to_path_buf(),
            origin: e.to_string(),
        })?;

        // Configure for performance
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| ClientError::DatabaseConfigError {
                message: "Failed to set journal_mode".to_string(),
                origin: e.to_string(),
            })?;

        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| ClientError::DatabaseConfigError {
                message: "Failed to set synchronous mode".to_string(),
                origin: e.to_string(),
            })?;

        conn.pragma_update(None, "temp_store", "MEMORY")
            .map_err(|e| ClientError::DatabaseConfigError {
                message: "Failed to set temp_store".to_string(),
                origin: e.to_string(),
            })?;

        Ok(conn)
    }

    /// Create tables `packets_raw`, `flight_tracks` and `logs`.
    ///
    /// Safe to run on every open. Indices on event_time, type and sent keep
    /// the correlator and sender scans off full-table paths.
    fn create_tables_indices(conn: &Connection) -> Result<(), ClientError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS packets_raw (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_time INTEGER NOT NULL,
                type INTEGER NOT NULL,
                callsign TEXT,
                height_m INTEGER,
                fuel_pct INTEGER,
                alarm INTEGER NOT NULL DEFAULT 0,
                faithfulness INTEGER NOT NULL DEFAULT 0,
                sent INTEGER NOT NULL DEFAULT 0,
                bound_to_track INTEGER REFERENCES flight_tracks(id),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| ClientError::TableCreationError {
            table: "packets_raw".to_string(),
            origin: e.to_string(),
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS flight_tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                k1_packet_id INTEGER NOT NULL REFERENCES packets_raw(id),
                k2_packet_id INTEGER NOT NULL REFERENCES packets_raw(id),
                callsign TEXT NOT NULL,
                height_m INTEGER NOT NULL,
                fuel_pct INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0,
                sent_at INTEGER,
                error TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| ClientError::TableCreationError {
            table: "flight_tracks".to_string(),
            origin: e.to_string(),
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                component TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| ClientError::TableCreationError {
            table: "logs".to_string(),
            origin: e.to_string(),
        })?;

        for (index, sql) in [
            (
                "idx_packets_event_time",
                "CREATE INDEX IF NOT EXISTS idx_packets_event_time ON packets_raw(event_time)",
            ),
            (
                "idx_packets_type",
                "CREATE INDEX IF NOT EXISTS idx_packets_type ON packets_raw(type)",
            ),
            (
                "idx_packets_sent",
                "CREATE INDEX IF NOT EXISTS idx_packets_sent ON packets_raw(sent)",
            ),
            (
                "idx_tracks_sent",
                "CREATE INDEX IF NOT EXISTS idx_tracks_sent ON flight_tracks(sent)",
            ),
        ] {
            conn.execute(sql, [])
                .map_err(|e| ClientError::IndexCreationError {
                    index: index.to_string(),
                    origin: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// A pre-existing file must actually contain our tables; anything else is
    /// structural corruption and fatal per the bringup contract.
    fn verify_structure(conn: &Connection) -> Result<(), ClientError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('packets_raw', 'flight_tracks', 'logs')",
                [],
                |row| row.get(0),
            )
            .map_err(|e| ClientError::DatabaseCorrupt {
                message: e.to_string(),
            })?;

        if count != 3 {
            return Err(ClientError::DatabaseCorrupt {
                message: format!("expected 3 tables, found {}", count),
            });
        }
        Ok(())
    }

    /// Execute an operation within a transaction
    fn with_transaction<F, T>(&mut self, context: &str, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(&Transaction) -> Result<T, ClientError>,
    {
        let tx = self.connection.transaction().map_err(|e| {
            ClientError::DatabaseTransactionError(TransactionError::Execute {
                context: format!("{}: failed to start transaction", context),
                source: e,
            })
        })?;

        let result = f(&tx)?;

        tx.commit().map_err(|e| {
            ClientError::DatabaseTransactionError(TransactionError::Commit {
                context: format!("{}: failed to commit", context),
                source: e,
            })
        })?;

        Ok(result)
    }

    fn insert_packet(&mut self, packet: &NewPacket) -> Result<i64, ClientError> {
        let now = to_millis(Utc::now());
        self.connection.execute(
            "INSERT INTO packets_raw (
                event_time, type, callsign, height_m, fuel_pct,
                alarm, faithfulness, sent, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
            params![
                to_millis(packet.event_time),
                packet.kind.as_i64(),
                packet.callsign.as_deref(),
                packet.height_m,
                packet.fuel_pct,
                packet.alarm,
                packet.faithfulness,
                now,
            ],
        )?;

        Ok(self.connection.last_insert_rowid())
    }

    fn select_unbound_packets(
        &mut self,
        kind: PacketKind,
        limit: u32,
    ) -> Result<Vec<RawPacket>, ClientError> {
        let mut stmt = self.connection.prepare_cached(
            "SELECT id, event_time, type, callsign, height_m, fuel_pct,
                    alarm, faithfulness, sent, bound_to_track, created_at, updated_at
             FROM packets_raw
             WHERE bound_to_track IS NULL AND sent = 0 AND type = ?1
             ORDER BY event_time ASC, id ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![kind.as_i64(), limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, Option<i64>>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, i64>(11)?,
            ))
        })?;

        let mut packets = Vec::new();
        for row in rows {
            let (id, event_time, kind, callsign, height_m, fuel_pct, alarm, faithfulness, sent, bound, created, updated) = row?;
            packets.push(RawPacket {
                id,
                event_time: from_millis(event_time),
                kind: PacketKind::from_i64(kind)?,
                callsign,
                height_m,
                fuel_pct,
                alarm,
                faithfulness,
                sent: SendState::from_i64(sent)?,
                bound_to_track: bound,
                created_at: from_millis(created),
                updated_at: from_millis(updated),
            });
        }
        Ok(packets)
    }

    fn create_track_and_bind(
        &mut self,
        k1_id: i64,
        k2_id: i64,
        track: &NewTrack,
    ) -> Result<i64, ClientError> {
        let now = to_millis(Utc::now());
        self.with_transaction("create_track_and_bind", |tx| {
            tx.execute(
                "INSERT INTO flight_tracks (
                    k1_packet_id, k2_packet_id, callsign, height_m, fuel_pct,
                    timestamp, sent, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    k1_id,
                    k2_id,
                    track.callsign,
                    track.height_m,
                    track.fuel_pct,
                    to_millis(track.timestamp),
                    now,
                ],
            )?;
            let track_id = tx.last_insert_rowid();

            for packet_id in [k1_id, k2_id] {
                let bound = tx.execute(
                    "UPDATE packets_raw SET bound_to_track = ?1, updated_at = ?2
                     WHERE id = ?3 AND bound_to_track IS NULL",
                    params![track_id, now, packet_id],
                )?;
                if bound != 1 {
                    // Rolls back the insert and the sibling bind.
                    return Err(ClientError::PacketAlreadyBound { packet_id });
                }
            }

            Ok(track_id)
        })
    }

    fn mark_packets(&mut self, ids: &[i64], outcome: SendState) -> Result<(), ClientError> {
        let now = to_millis(Utc::now());
        self.with_transaction("mark_packets", |tx| {
            let mut stmt = tx.prepare_cached(
                "UPDATE packets_raw SET sent = ?1, updated_at = ?2 WHERE id = ?3",
            )?;
            for id in ids {
                stmt.execute(params![outcome.as_i64(), now, id])?;
            }
            Ok(())
        })
    }

    fn select_pending_tracks(&mut self, limit: u32) -> Result<Vec<FlightTrack>, ClientError> {
        let mut stmt = self.connection.prepare_cached(
            "SELECT id, k1_packet_id, k2_packet_id, callsign, height_m, fuel_pct,
                    timestamp, sent, sent_at, error, created_at
             FROM flight_tracks
             WHERE sent = 0
             ORDER BY id ASC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<i64>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, i64>(10)?,
            ))
        })?;

        let mut tracks = Vec::new();
        for row in rows {
            let (id, k1, k2, callsign, height_m, fuel_pct, timestamp, sent, sent_at, err, created) = row?;
            tracks.push(FlightTrack {
                id,
                k1_packet_id: k1,
                k2_packet_id: k2,
                callsign,
                height_m,
                fuel_pct,
                timestamp: from_millis(timestamp),
                sent: SendState::from_i64(sent)?,
                sent_at: sent_at.map(from_millis),
                error: err,
                created_at: from_millis(created),
            });
        }
        Ok(tracks)
    }

    fn mark_tracks(
        &mut self,
        ids: &[i64],
        outcome: SendState,
        error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), ClientError> {
        self.with_transaction("mark_tracks", |tx| {
            let mut stmt = tx.prepare_cached(
                "UPDATE flight_tracks SET sent = ?1, error = ?2, sent_at = ?3 WHERE id = ?4",
            )?;
            for id in ids {
                stmt.execute(params![
                    outcome.as_i64(),
                    error,
                    sent_at.map(to_millis),
                    id
                ])?;
            }
            Ok(())
        })
    }

    fn append_log(
        &mut self,
        level: LogLevel,
        component: &str,
        message: &str,
        details: Option<&str>,
    ) -> Result<(), ClientError> {
        self.connection.execute(
            "INSERT INTO logs (level, component, message, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                level.as_str(),
                component,
                message,
                details,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ClientError> {
        self.connection
            .pragma_update(None, "wal_checkpoint", "PASSIVE")?;
        Ok(())
    }
}
