//! K1/K2 correlation.
//!
//! On a fixed cadence, loads unbound packets of both kinds and pairs each K1
//! with the closest K2 inside the correlation window. Matching is a greedy
//! two-pointer pass in strict event-time order, so the pairing for a given
//! set of packets is the same regardless of when batches were loaded.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::database::{Db, NewTrack};
use crate::errors::ClientError;
use crate::models::{LogLevel, PacketKind, RawPacket, SendState};

/// Maximum |Δt| between a K1 and its K2.
pub fn correlation_window() -> ChronoDuration {
    ChronoDuration::seconds(5)
}

/// Unbound packets older than this stop being scanned.
pub fn stale_threshold() -> ChronoDuration {
    ChronoDuration::seconds(60)
}

/// A pair the matcher decided on; ids plus the track fields derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrack {
    pub k1_id: i64,
    pub k2_id: i64,
    pub fields: NewTrack,
}

/// Result of one matching pass.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub pairs: Vec<PlannedTrack>,
    pub stale_k1: Vec<i64>,
    pub stale_k2: Vec<i64>,
}

/// Pair K1s with K2s inside `window`.
///
/// Both slices must be ordered by `(event_time, id)` ascending, which is how
/// the store returns them. For each K1 in order, the K2 with the smallest
/// |Δt| wins; on an exact tie the earlier K2 (then the smaller id) wins
/// because candidates are scanned in slice order and only a strictly smaller
/// Δt displaces the current best. A K2 consumed by one K1 is never offered
/// to a later K1 in the same pass.
///
/// Unmatched packets whose event time lags `stale` behind the newest
/// opposite-kind packet (or behind `now`, whichever is later) are reported
/// for aging out.
pub fn match_cycle(
    k1s: &[RawPacket],
    k2s: &[RawPacket],
    window: ChronoDuration,
    stale: ChronoDuration,
    now: DateTime<Utc>,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut consumed = vec![false; k2s.len()];
    let mut matched_k1 = vec![false; k1s.len()];
    let mut lo = 0usize;

    for (i, k1) in k1s.iter().enumerate() {
        // K2s this far behind k1 can never match it or any later K1.
        while lo < k2s.len() && k2s[lo].event_time < k1.event_time - window {
            lo += 1;
        }

        let mut best: Option<(usize, ChronoDuration)> = None;
        for (j, k2) in k2s.iter().enumerate().skip(lo) {
            if k2.event_time > k1.event_time + window {
                break;
            }
            if consumed[j] {
                continue;
            }
            let diff = (k2.event_time - k1.event_time).abs();
            if best.map_or(true, |(_, best_diff)| diff < best_diff) {
                best = Some((j, diff));
            }
        }

        let Some((j, _)) = best else { continue };
        let k2 = &k2s[j];

        let (Some(callsign), Some(height_m), Some(fuel_pct)) =
            (k1.callsign.as_ref(), k2.height_m, k2.fuel_pct)
        else {
            // Field invariant is enforced at insert; a row violating it is
            // unusable and left for the stale sweep.
            continue;
        };

        consumed[j] = true;
        matched_k1[i] = true;
        outcome.pairs.push(PlannedTrack {
            k1_id: k1.id,
            k2_id: k2.id,
            fields: NewTrack {
                callsign: callsign.clone(),
                height_m,
                fuel_pct,
                // K2 carries the dynamic quantities; its time stamps the track.
                timestamp: k2.event_time,
            },
        });
    }

    let k1_horizon = stale_horizon(k2s, now);
    for (i, k1) in k1s.iter().enumerate() {
        if !matched_k1[i] && k1_horizon - k1.event_time > stale {
            outcome.stale_k1.push(k1.id);
        }
    }

    let k2_horizon = stale_horizon(k1s, now);
    for (j, k2) in k2s.iter().enumerate() {
        if !consumed[j] && k2_horizon - k2.event_time > stale {
            outcome.stale_k2.push(k2.id);
        }
    }

    outcome
}

/// Aging reference: the newest opposite-kind packet, floored at `now`.
fn stale_horizon(opposite: &[RawPacket], now: DateTime<Utc>) -> DateTime<Utc> {
    opposite
        .iter()
        .map(|p| p.event_time)
        .max()
        .map_or(now, |newest| newest.max(now))
}

/// The correlator worker.
pub struct Correlator {
    db: Db,
    batch_size: u32,
    interval: std::time::Duration,
}

impl Correlator {
    pub fn new(config: &AppConfig, db: Db) -> Self {
        Self {
            db,
            batch_size: config.cycles.batch_size,
            interval: config.cycles.analyser_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ClientError> {
        info!("Correlator started (every {:?})", self.interval);
        self.db
            .append_log(LogLevel::Info, "ANALYSER", "Correlator started", None);

        let mut total_tracks: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            // A failed cycle leaves the store untouched beyond what already
            // committed; the next tick sees a clean state and retries.
            match self.cycle(Utc::now()) {
                Ok(created) => {
                    if created > 0 {
                        total_tracks += created as u64;
                        info!("Correlated {} pairs (total {})", created, total_tracks);
                    }
                }
                Err(e) => {
                    error!("Correlation cycle failed: {}", e);
                    self.db.append_log(
                        LogLevel::Error,
                        "ANALYSER",
                        "Correlation cycle failed",
                        Some(&e.to_string()),
                    );
                }
            }
        }

        info!("Correlator stopped");
        self.db
            .append_log(LogLevel::Info, "ANALYSER", "Correlator stopped", None);
        Ok(())
    }

    /// One load–match–commit pass.
    pub fn cycle(&self, now: DateTime<Utc>) -> Result<usize, ClientError> {
        let k1s = self.db.select_unbound_packets(PacketKind::K1, self.batch_size)?;
        let k2s = self.db.select_unbound_packets(PacketKind::K2, self.batch_size)?;

        if k1s.is_empty() && k2s.is_empty() {
            return Ok(0);
        }

        let outcome = match_cycle(&k1s, &k2s, correlation_window(), stale_threshold(), now);

        let mut created = 0usize;
        for planned in &outcome.pairs {
            match self
                .db
                .create_track_and_bind(planned.k1_id, planned.k2_id, &planned.fields)
            {
                Ok(track_id) => {
                    created += 1;
                    debug!(
                        "Bound {} -> {}m / {}% (track {})",
                        planned.fields.callsign,
                        planned.fields.height_m,
                        planned.fields.fuel_pct,
                        track_id
                    );
                }
                Err(ClientError::PacketAlreadyBound { packet_id }) => {
                    // Lost a race on this pair; the K1 is reconsidered next
                    // cycle against whatever K2s remain.
                    warn!("Packet {} already bound, skipping pair", packet_id);
                    self.db.append_log(
                        LogLevel::Warn,
                        "ANALYSER",
                        "Bind collision",
                        Some(&format!("packet {}", packet_id)),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !outcome.stale_k1.is_empty() || !outcome.stale_k2.is_empty() {
            self.db.mark_packets(&outcome.stale_k1, SendState::Failed)?;
            self.db.mark_packets(&outcome.stale_k2, SendState::Failed)?;
            info!(
                "Aged out {} K1 / {} K2 unmatched packets",
                outcome.stale_k1.len(),
                outcome.stale_k2.len()
            );
            self.db.append_log(
                LogLevel::Info,
                "ANALYSER",
                "Unmatched packets aged out",
                Some(&format!(
                    "k1={} k2={}",
                    outcome.stale_k1.len(),
                    outcome.stale_k2.len()
                )),
            );
        }

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    fn k1(id: i64, t: DateTime<Utc>) -> RawPacket {
        RawPacket {
            id,
            event_time: t,
            kind: PacketKind::K1,
            callsign: Some(format!("1{:04}", id)),
            height_m: None,
            fuel_pct: None,
            alarm: 0,
            faithfulness: 50,
            sent: SendState::Pending,
            bound_to_track: None,
            created_at: t,
            updated_at: t,
        }
    }

    fn k2(id: i64, t: DateTime<Utc>) -> RawPacket {
        RawPacket {
            id,
            event_time: t,
            kind: PacketKind::K2,
            callsign: None,
            height_m: Some(5000 + id),
            fuel_pct: Some(40),
            alarm: 0,
            faithfulness: 0,
            sent: SendState::Pending,
            bound_to_track: None,
            created_at: t,
            updated_at: t,
        }
    }

    fn window() -> ChronoDuration {
        correlation_window()
    }

    fn stale() -> ChronoDuration {
        stale_threshold()
    }

    #[test]
    fn pairs_k1_with_closest_k2_in_window() {
        let k1s = [k1(1, at(100))];
        let k2s = [k2(2, at(98)), k2(3, at(101))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(100));
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].k1_id, 1);
        assert_eq!(outcome.pairs[0].k2_id, 3);
        assert_eq!(outcome.pairs[0].fields.timestamp, at(101));
    }

    #[test]
    fn track_fields_come_from_both_sides() {
        let k1s = [k1(1, at(100))];
        let k2s = [k2(7, at(102))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(102));
        let planned = &outcome.pairs[0];
        assert_eq!(planned.fields.callsign, "10001");
        assert_eq!(planned.fields.height_m, 5007);
        assert_eq!(planned.fields.fuel_pct, 40);
        assert_eq!(planned.fields.timestamp, at(102));
    }

    #[test]
    fn no_pair_outside_window() {
        let k1s = [k1(1, at(100))];
        let k2s = [k2(2, at(110))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(110));
        assert!(outcome.pairs.is_empty());
        // Neither side is stale yet relative to a 60s threshold.
        assert!(outcome.stale_k1.is_empty());
        assert!(outcome.stale_k2.is_empty());
    }

    #[test]
    fn equidistant_tie_prefers_earlier_k2() {
        let k1s = [k1(1, at(10))];
        let k2s = [k2(2, at(8)), k2(3, at(12))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(12));
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].k2_id, 2);
    }

    #[test]
    fn equidistant_same_time_tie_prefers_smaller_id() {
        let k1s = [k1(1, at(10))];
        let k2s = [k2(5, at(12)), k2(9, at(12))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(12));
        assert_eq!(outcome.pairs[0].k2_id, 5);
    }

    #[test]
    fn consumed_k2_is_not_reused() {
        // Two K1s, one K2 between them: only the closer K1 gets it.
        let k1s = [k1(1, at(100)), k1(2, at(103))];
        let k2s = [k2(3, at(101))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(103));
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].k1_id, 1);
    }

    #[test]
    fn second_k1_takes_next_available_k2() {
        let k1s = [k1(1, at(100)), k1(2, at(101))];
        let k2s = [k2(3, at(100)), k2(4, at(102))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(102));
        assert_eq!(outcome.pairs.len(), 2);
        assert_eq!((outcome.pairs[0].k1_id, outcome.pairs[0].k2_id), (1, 3));
        assert_eq!((outcome.pairs[1].k1_id, outcome.pairs[1].k2_id), (2, 4));
    }

    #[test]
    fn pairing_uses_millisecond_precision() {
        let k1s = [k1(1, at_ms(10_000))];
        let k2s = [k2(2, at_ms(8_500)), k2(3, at_ms(11_400))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at_ms(11_400));
        // 1.4s beats 1.5s.
        assert_eq!(outcome.pairs[0].k2_id, 3);
    }

    #[test]
    fn old_unmatched_packets_age_out() {
        let k1s = [k1(1, at(0))];
        let k2s = [k2(2, at(100))];

        // 100s apart: no pair, and relative to the newest opposite packet
        // the K1 is past the 60s staleness bound. The K2 is not.
        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(100));
        assert!(outcome.pairs.is_empty());
        assert_eq!(outcome.stale_k1, vec![1]);
        assert!(outcome.stale_k2.is_empty());
    }

    #[test]
    fn quiet_stream_ages_both_sides_by_clock() {
        // Window miss at t=0/t=10; nothing else ever arrives. Once the
        // clock passes the staleness bound both are abandoned.
        let k1s = [k1(1, at(0))];
        let k2s = [k2(2, at(10))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(120));
        assert_eq!(outcome.stale_k1, vec![1]);
        assert_eq!(outcome.stale_k2, vec![2]);
    }

    #[test]
    fn matched_packets_are_never_stale() {
        let k1s = [k1(1, at(100))];
        let k2s = [k2(2, at(101))];

        let outcome = match_cycle(&k1s, &k2s, window(), stale(), at(500));
        assert_eq!(outcome.pairs.len(), 1);
        assert!(outcome.stale_k1.is_empty());
        assert!(outcome.stale_k2.is_empty());
    }

    #[test]
    fn pairing_is_stable_across_batch_boundaries() {
        // The same packets split differently across two cycles produce the
        // same pairs: cycle one sees only the first K1, cycle two the rest.
        let all_k1 = [k1(1, at(100)), k1(2, at(104))];
        let all_k2 = [k2(3, at(101)), k2(4, at(105))];

        let whole = match_cycle(&all_k1, &all_k2, window(), stale(), at(105));

        let first = match_cycle(&all_k1[..1], &all_k2, window(), stale(), at(105));
        let remaining_k2: Vec<RawPacket> = all_k2
            .iter()
            .filter(|p| p.id != first.pairs[0].k2_id)
            .cloned()
            .collect();
        let second = match_cycle(&all_k1[1..], &remaining_k2, window(), stale(), at(105));

        let mut split: Vec<(i64, i64)> = first
            .pairs
            .iter()
            .chain(second.pairs.iter())
            .map(|p| (p.k1_id, p.k2_id))
            .collect();
        split.sort_unstable();
        let mut whole_pairs: Vec<(i64, i64)> =
            whole.pairs.iter().map(|p| (p.k1_id, p.k2_id)).collect();
        whole_pairs.sort_unstable();
        assert_eq!(split, whole_pairs);
    }
}
