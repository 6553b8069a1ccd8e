//! Flight track delivery.
//!
//! On a fixed cadence, takes the oldest pending tracks in id order and POSTs
//! them to the ingest endpoint as one signed batch. The payload is
//! serialized once; those bytes are both signed and sent, so a retried batch
//! reproduces the exact body and signature of the failed attempt.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{ApiClient, PostOutcome};
use crate::config::AppConfig;
use crate::database::Db;
use crate::errors::ClientError;
use crate::models::{FlightTrack, LogLevel, SendState};

/// One POST carries at most this many tracks.
const SEND_BATCH_LIMIT: u32 = 100;

/// Backoff ceiling between failed delivery attempts.
const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(300);

/// Wire form of one track. Field order is lexicographic so the serialized
/// object has sorted keys; the signature depends on it.
#[derive(Debug, Serialize)]
struct TrackPayload {
    callsign: String,
    fuel: i64,
    height: i64,
    timestamp: String,
}

/// Wire form of one batch, sorted keys as above.
#[derive(Debug, Serialize)]
struct IngestPayload {
    client_id: i64,
    tracks: Vec<TrackPayload>,
}

/// Canonical JSON body for a batch of tracks.
pub fn build_payload(client_id: i64, tracks: &[FlightTrack]) -> Result<String, ClientError> {
    let payload = IngestPayload {
        client_id,
        tracks: tracks
            .iter()
            .map(|t| TrackPayload {
                callsign: t.callsign.clone(),
                fuel: t.fuel_pct,
                height: t.height_m,
                timestamp: t.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect(),
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Delay before the next attempt after `failures` consecutive failures.
///
/// Base interval doubled per failure, capped, then jittered by the supplied
/// factor so a fleet of clients does not retry in lockstep.
pub fn backoff_delay(
    base: std::time::Duration,
    failures: u32,
    jitter: f64,
) -> std::time::Duration {
    let doubled = base.saturating_mul(1u32 << failures.min(16));
    doubled.min(BACKOFF_CAP).mul_f64(jitter)
}

/// Apply one POST outcome to the batch. Returns true when the cycle counts
/// as a success for backoff purposes (the server was reached at all).
pub fn settle_batch(
    db: &Db,
    ids: &[i64],
    outcome: &PostOutcome,
    now: DateTime<Utc>,
) -> Result<bool, ClientError> {
    match outcome {
        PostOutcome::Accepted => {
            db.mark_tracks(ids, SendState::Done, None, Some(now))?;
            Ok(true)
        }
        PostOutcome::Rejected { status, body } => {
            let reason = format!("HTTP {}: {}", status.as_u16(), body);
            db.mark_tracks(ids, SendState::Failed, Some(&reason), None)?;
            Ok(true)
        }
        PostOutcome::Transient { .. } => Ok(false),
    }
}

/// The sender worker.
pub struct Sender {
    db: Db,
    api: ApiClient,
    url: String,
    client_id: i64,
    interval: std::time::Duration,
    timeout: std::time::Duration,
}

impl Sender {
    pub fn new(config: &AppConfig, db: Db, api: ApiClient) -> Self {
        Self {
            db,
            api,
            url: config.api.url.clone(),
            client_id: config.api.client_id,
            interval: config.cycles.sender_interval,
            timeout: config.api.timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ClientError> {
        info!("Sender started (every {:?})", self.interval);
        self.db.append_log(LogLevel::Info, "SENDER", "Sender started", None);

        let mut failures: u32 = 0;
        let mut total_sent: u64 = 0;

        loop {
            let delay = if failures == 0 {
                self.interval
            } else {
                backoff_delay(self.interval, failures, rand::thread_rng().gen_range(0.8..1.2))
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let tracks = match self.load_batch() {
                Ok(tracks) => tracks,
                Err(e) => {
                    error!("Loading pending tracks failed: {}", e);
                    continue;
                }
            };
            if tracks.is_empty() {
                continue;
            }

            let body = match build_payload(self.client_id, &tracks) {
                Ok(body) => body,
                Err(e) => {
                    error!("Batch serialization failed: {}", e);
                    continue;
                }
            };
            let ids: Vec<i64> = tracks.iter().map(|t| t.id).collect();

            info!("Sending {} tracks to {}", ids.len(), self.url);
            let outcome = self.api.post_signed(&self.url, body, self.timeout).await;

            match &outcome {
                PostOutcome::Accepted => {
                    total_sent += ids.len() as u64;
                    info!("Delivered {} tracks (total {})", ids.len(), total_sent);
                    self.db.append_log(
                        LogLevel::Info,
                        "SENDER",
                        "Batch delivered",
                        Some(&format!("count={}", ids.len())),
                    );
                }
                PostOutcome::Rejected { status, .. } => {
                    error!("Ingest rejected batch: HTTP {}", status);
                    self.db.append_log(
                        LogLevel::Error,
                        "SENDER",
                        "Batch rejected by ingest",
                        Some(&format!("status={} count={}", status, ids.len())),
                    );
                }
                PostOutcome::Transient { reason } => {
                    warn!("Delivery attempt failed, batch stays pending: {}", reason);
                    self.db.append_log(
                        LogLevel::Warn,
                        "SENDER",
                        "Delivery attempt failed",
                        Some(reason),
                    );
                }
            }

            match settle_batch(&self.db, &ids, &outcome, Utc::now()) {
                Ok(true) => failures = 0,
                Ok(false) => failures = failures.saturating_add(1),
                Err(e) => {
                    // The POST may have landed; leaving the rows pending only
                    // risks a duplicate, which the server dedupes per batch.
                    error!("Recording batch outcome failed: {}", e);
                    failures = failures.saturating_add(1);
                }
            }
        }

        info!("Sender stopped ({} tracks delivered)", total_sent);
        self.db.append_log(LogLevel::Info, "SENDER", "Sender stopped", None);
        Ok(())
    }

    /// One retry on a transient store error, then surface it.
    fn load_batch(&self) -> Result<Vec<FlightTrack>, ClientError> {
        match self.db.select_pending_tracks(SEND_BATCH_LIMIT) {
            Ok(tracks) => Ok(tracks),
            Err(first) => {
                warn!("Pending track query failed, retrying once: {}", first);
                self.db.select_pending_tracks(SEND_BATCH_LIMIT)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::StatusCode;
    use tempfile::tempdir;

    use crate::database::{DbDropGuard, NewTrack};
    use crate::models::NewPacket;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    fn track(id: i64, callsign: &str, height: i64, fuel: i64, ts: DateTime<Utc>) -> FlightTrack {
        FlightTrack {
            id,
            k1_packet_id: 1,
            k2_packet_id: 2,
            callsign: callsign.to_string(),
            height_m: height,
            fuel_pct: fuel,
            timestamp: ts,
            sent: SendState::Pending,
            sent_at: None,
            error: None,
            created_at: ts,
        }
    }

    #[test]
    fn payload_has_sorted_keys_and_exact_bytes() {
        let ts = Utc
            .with_ymd_and_hms(2024, 3, 15, 11, 11, 40)
            .single()
            .unwrap()
            + chrono::Duration::milliseconds(82);
        let body = build_payload(7, &[track(1, "10437", 5360, 40, ts)]).unwrap();

        assert_eq!(
            body,
            r#"{"client_id":7,"tracks":[{"callsign":"10437","fuel":40,"height":5360,"timestamp":"2024-03-15T11:11:40.082Z"}]}"#
        );
    }

    #[test]
    fn payload_bytes_are_reproducible() {
        let tracks = vec![
            track(1, "10437", 5360, 40, at_ms(1_700_000_000_000)),
            track(2, "14055", 6130, 35, at_ms(1_700_000_004_000)),
        ];
        assert_eq!(
            build_payload(1, &tracks).unwrap(),
            build_payload(1, &tracks).unwrap()
        );
    }

    #[test]
    fn empty_batch_serializes_to_empty_array() {
        assert_eq!(
            build_payload(3, &[]).unwrap(),
            r#"{"client_id":3,"tracks":[]}"#
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = std::time::Duration::from_secs(10);
        assert_eq!(backoff_delay(base, 0, 1.0), base);
        assert_eq!(backoff_delay(base, 1, 1.0), std::time::Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 3, 1.0), std::time::Duration::from_secs(80));
        // 10s * 2^6 = 640s, capped at 300s.
        assert_eq!(backoff_delay(base, 6, 1.0), std::time::Duration::from_secs(300));
        // Huge failure counts must not overflow.
        assert_eq!(backoff_delay(base, 40, 1.0), std::time::Duration::from_secs(300));
    }

    #[test]
    fn backoff_jitter_scales_delay() {
        let base = std::time::Duration::from_secs(10);
        assert_eq!(backoff_delay(base, 0, 1.2), std::time::Duration::from_secs(12));
        assert_eq!(backoff_delay(base, 0, 0.8), std::time::Duration::from_secs(8));
    }

    fn db_with_tracks(n: usize) -> (tempfile::TempDir, DbDropGuard, Vec<i64>) {
        let dir = tempdir().unwrap();
        let guard = DbDropGuard::open(&dir.path().join("test.db")).unwrap();
        let db = guard.db();

        let mut ids = Vec::new();
        for i in 0..n {
            let t = at_ms(1_700_000_000_000 + i as i64 * 1000);
            let k1 = db
                .insert_packet(&NewPacket::k1(t, format!("1000{}", i)))
                .unwrap();
            let k2 = db
                .insert_packet(&NewPacket::k2(t + chrono::Duration::seconds(1), 5000, 40))
                .unwrap();
            let id = db
                .create_track_and_bind(
                    k1,
                    k2,
                    &NewTrack {
                        callsign: format!("1000{}", i),
                        height_m: 5000,
                        fuel_pct: 40,
                        timestamp: t + chrono::Duration::seconds(1),
                    },
                )
                .unwrap();
            ids.push(id);
        }
        (dir, guard, ids)
    }

    #[test]
    fn accepted_batch_is_marked_done() {
        let (_dir, guard, ids) = db_with_tracks(3);
        let db = guard.db();

        let success = settle_batch(&db, &ids, &PostOutcome::Accepted, at_ms(0)).unwrap();
        assert!(success);
        assert!(db.select_pending_tracks(10).unwrap().is_empty());
    }

    #[test]
    fn rejected_batch_is_marked_failed_and_not_retried() {
        let (_dir, guard, ids) = db_with_tracks(2);
        let db = guard.db();

        let outcome = PostOutcome::Rejected {
            status: StatusCode::BAD_REQUEST,
            body: "bad payload".to_string(),
        };
        let success = settle_batch(&db, &ids, &outcome, at_ms(0)).unwrap();
        assert!(success);
        // Failed is terminal: nothing is pending anymore.
        assert!(db.select_pending_tracks(10).unwrap().is_empty());
    }

    #[test]
    fn transient_failure_keeps_batch_pending() {
        let (_dir, guard, ids) = db_with_tracks(3);
        let db = guard.db();

        let outcome = PostOutcome::Transient {
            reason: "HTTP 503".to_string(),
        };
        let success = settle_batch(&db, &ids, &outcome, at_ms(0)).unwrap();
        assert!(!success);

        // Same batch, same order, next cycle; byte-identical body.
        let pending = db.select_pending_tracks(10).unwrap();
        let again: Vec<i64> = pending.iter().map(|t| t.id).collect();
        assert_eq!(again, ids);
        assert_eq!(
            build_payload(1, &pending).unwrap(),
            build_payload(1, &pending).unwrap()
        );
    }
}
