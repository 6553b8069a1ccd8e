//! Status heartbeat.
//!
//! Posts a snapshot of bringup and connection health to the status endpoint
//! on a fixed cadence, signed the same way as track batches. The heartbeat
//! has no persistence and never escalates failures; a missed ping simply
//! shows up as a gap on the server side.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, PostOutcome};
use crate::config::AppConfig;
use crate::database::Db;
use crate::errors::ClientError;
use crate::models::LogLevel;
use crate::status::{BringupStages, StatusHandle, StatusSnapshot};

/// The status endpoint gets a tighter bound than the ingest endpoint.
const STATUS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Wire form of the heartbeat. Field order is lexicographic so the
/// serialized object has sorted keys; the signature depends on it.
#[derive(Debug, Serialize)]
struct StatusPayload {
    client_id: i64,
    stages: BringupStages,
    system_info: String,
    tcp_connected: bool,
    uptime: f64,
    version: String,
}

/// Canonical JSON body for one heartbeat.
pub fn build_status_payload(
    client_id: i64,
    version: &str,
    snapshot: &StatusSnapshot,
    now: DateTime<Utc>,
) -> Result<String, ClientError> {
    let payload = StatusPayload {
        client_id,
        stages: snapshot.stages,
        system_info: snapshot.system_info.clone(),
        tcp_connected: snapshot.tcp_connected,
        uptime: snapshot.uptime_seconds(now),
        version: version.to_string(),
    };
    Ok(serde_json::to_string(&payload)?)
}

/// The heartbeat worker.
pub struct Pinger {
    db: Db,
    api: ApiClient,
    status: StatusHandle,
    status_url: String,
    client_id: i64,
    version: String,
    interval: std::time::Duration,
}

impl Pinger {
    pub fn new(config: &AppConfig, db: Db, api: ApiClient, status: StatusHandle) -> Self {
        Self {
            db,
            api,
            status,
            status_url: config.api.status_url.clone(),
            client_id: config.api.client_id,
            version: config.app.version.clone(),
            interval: config.api.ping_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ClientError> {
        info!("Pinger started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let snapshot = self.status.snapshot();
            let body = match build_status_payload(
                self.client_id,
                &self.version,
                &snapshot,
                Utc::now(),
            ) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Status serialization failed: {}", e);
                    continue;
                }
            };

            match self
                .api
                .post_signed(&self.status_url, body, STATUS_TIMEOUT)
                .await
            {
                PostOutcome::Accepted => debug!("Status ping delivered"),
                PostOutcome::Rejected { status, .. } => {
                    warn!("Status endpoint rejected ping: HTTP {}", status);
                    self.db.append_log(
                        LogLevel::Warn,
                        "PING",
                        "Status ping rejected",
                        Some(&format!("status={}", status)),
                    );
                }
                PostOutcome::Transient { reason } => {
                    debug!("Status ping failed: {}", reason);
                }
            }
        }

        info!("Pinger stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            stages: BringupStages {
                config: true,
                database: true,
                decoder: true,
                dependencies: true,
                tcp_connection: true,
                time_sync: false,
            },
            tcp_connected: true,
            started_at: Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).single().unwrap(),
            system_info: "linux x86_64".to_string(),
        }
    }

    #[test]
    fn status_payload_has_sorted_keys_and_exact_bytes() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 30).single().unwrap();
        let body = build_status_payload(7, "1.0.0", &snapshot(), now).unwrap();

        assert_eq!(
            body,
            concat!(
                r#"{"client_id":7,"#,
                r#""stages":{"config":true,"database":true,"decoder":true,"#,
                r#""dependencies":true,"tcp_connection":true,"time_sync":false},"#,
                r#""system_info":"linux x86_64","tcp_connected":true,"#,
                r#""uptime":30.0,"version":"1.0.0"}"#
            )
        );
    }

    #[test]
    fn uptime_keeps_fractional_seconds() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 1).single().unwrap()
            + chrono::Duration::milliseconds(500);
        let body = build_status_payload(1, "1.0.0", &snapshot(), now).unwrap();
        assert!(body.contains(r#""uptime":1.5"#));
    }
}
