//! Decoder stream parser.
//!
//! Keeps a client connection to the decoder's TCP port, splits the byte
//! stream into lines and decodes the two packet forms:
//!
//! ```text
//! K1 11:11:38.370.366 [ 8832] {018} **** :10437
//! K2 11:12:54.082.632 [ 8706] {017} **** FL 5360m [F176]+  F:40%
//! ```
//!
//! Every decoded packet is written to the store before the next line is
//! taken from the buffer. Anything that matches neither form is dropped.

use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::database::Db;
use crate::errors::ClientError;
use crate::models::{LogLevel, NewPacket};
use crate::status::StatusHandle;

static K1_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^K1\s+(\d{2}):(\d{2}):(\d{2})\.(\d+)\.(\d+)\s+.*?:(\d+)$").expect("K1 pattern")
});

static K2_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^K2\s+(\d{2}):(\d{2}):(\d{2})\.(\d+)\.(\d+)\s+.*?FL\s*(\d+)m.*?F:(\d+)%")
        .expect("K2 pattern")
});

/// Connection recycled if the decoder goes quiet for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// At most one audit entry per this many dropped lines.
const DROP_LOG_EVERY: u64 = 100;

/// Progress line per this many stored packets.
const PROGRESS_EVERY: u64 = 100;

/// Result of looking at one line from the stream.
#[derive(Debug, PartialEq)]
pub enum ParsedLine {
    Packet(NewPacket),
    /// Carried a K1/K2 prefix but failed its grammar.
    Malformed,
    /// Startup banner or other chatter; not counted.
    Ignored,
}

/// Decode one line against the K1/K2 grammar.
///
/// `reference` is the local wall clock at ingest; it supplies the date the
/// decoder timestamps lack.
pub fn parse_line(line: &str, reference: DateTime<Local>) -> ParsedLine {
    let line = line.trim();
    if line.is_empty() {
        return ParsedLine::Ignored;
    }

    if line.starts_with("K1 ") {
        return match K1_PATTERN.captures(line) {
            Some(caps) => match packet_time(&caps, reference) {
                Some(event_time) => {
                    ParsedLine::Packet(NewPacket::k1(event_time, caps[6].to_string()))
                }
                None => ParsedLine::Malformed,
            },
            None => ParsedLine::Malformed,
        };
    }

    if line.starts_with("K2 ") {
        return match K2_PATTERN.captures(line) {
            Some(caps) => {
                let parsed = packet_time(&caps, reference).zip(
                    caps[6]
                        .parse::<i64>()
                        .ok()
                        .zip(caps[7].parse::<i64>().ok()),
                );
                match parsed {
                    Some((event_time, (height_m, fuel_pct))) => {
                        ParsedLine::Packet(NewPacket::k2(event_time, height_m, fuel_pct))
                    }
                    None => ParsedLine::Malformed,
                }
            }
            None => ParsedLine::Malformed,
        };
    }

    ParsedLine::Ignored
}

/// Combine the captured `HH:MM:SS.mmm` with the local date at ingest.
///
/// The decoder has no notion of date. If stitching today's date onto the
/// parsed time lands more than 12 hours in the future, the line was emitted
/// before a midnight the client has already crossed, so the previous day is
/// used instead.
fn packet_time(caps: &regex::Captures<'_>, reference: DateTime<Local>) -> Option<DateTime<Utc>> {
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    let second: u32 = caps[3].parse().ok()?;
    let milli: u32 = caps[4].parse::<u32>().ok()?.min(999);

    let time = NaiveTime::from_hms_milli_opt(hour, minute, second, milli)?;
    let naive = NaiveDateTime::new(reference.date_naive(), time);
    let local = Local.from_local_datetime(&naive).earliest()?;

    let mut event = local.with_timezone(&Utc);
    if event - reference.with_timezone(&Utc) > chrono::Duration::hours(12) {
        event -= chrono::Duration::days(1);
    }
    Some(event)
}

/// The parser worker: connect, read, decode, store, reconnect.
pub struct Parser {
    db: Db,
    status: StatusHandle,
    host: String,
    port: u16,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    read_pause: Duration,
}

impl Parser {
    pub fn new(config: &AppConfig, db: Db, status: StatusHandle) -> Self {
        Self {
            db,
            status,
            host: config.decoder.host.clone(),
            port: config.decoder.port,
            connect_timeout: config.decoder.timeout,
            reconnect_delay: config.decoder.reconnect_delay,
            read_pause: config.cycles.parser_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ClientError> {
        info!("Parser started ({}:{})", self.host, self.port);
        self.db.append_log(LogLevel::Info, "PARSER", "Parser started", None);

        let mut stored: u64 = 0;
        let mut dropped: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect((self.host.as_str(), self.port)),
                ) => match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!("Decoder connection failed: {}", e);
                        self.status.set_tcp_connected(false);
                        self.wait_reconnect(&cancel).await;
                        continue;
                    }
                    Err(_) => {
                        warn!("Decoder connection timed out");
                        self.status.set_tcp_connected(false);
                        self.wait_reconnect(&cancel).await;
                        continue;
                    }
                },
            };

            info!("Connected to decoder ({}:{})", self.host, self.port);
            self.status.set_tcp_connected(true);
            self.db
                .append_log(LogLevel::Info, "PARSER", "Connected to decoder", None);

            self.read_until_disconnect(stream, &cancel, &mut stored, &mut dropped)
                .await;

            self.status.set_tcp_connected(false);
            if !cancel.is_cancelled() {
                self.db
                    .append_log(LogLevel::Warn, "PARSER", "Decoder connection lost", None);
                self.wait_reconnect(&cancel).await;
            }
        }

        self.status.set_tcp_connected(false);
        info!("Parser stopped ({} packets stored)", stored);
        self.db.append_log(LogLevel::Info, "PARSER", "Parser stopped", None);
        Ok(())
    }

    /// Pump one connection until read error, idle timeout or cancellation.
    async fn read_until_disconnect(
        &self,
        mut stream: TcpStream,
        cancel: &CancellationToken,
        stored: &mut u64,
        dropped: &mut u64,
    ) {
        let mut chunk = [0u8; 4096];
        let mut buffer = String::new();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut chunk)) => result,
            };

            let n = match read {
                Ok(Ok(0)) => {
                    warn!("Decoder closed the connection");
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!("Decoder read error: {}", e);
                    return;
                }
                Err(_) => {
                    warn!("Decoder idle for {:?}, reconnecting", IDLE_TIMEOUT);
                    return;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                match parse_line(&line, Local::now()) {
                    ParsedLine::Packet(packet) => match self.store_with_retry(&packet) {
                        Ok(()) => {
                            *stored += 1;
                            if *stored % PROGRESS_EVERY == 0 {
                                info!("Stored {} packets", stored);
                            }
                        }
                        Err(e) => {
                            // The packet is lost, the parser is not.
                            error!("Packet insert failed after retry: {}", e);
                            self.db.append_log(
                                LogLevel::Error,
                                "PARSER",
                                "Packet insert failed",
                                Some(&e.to_string()),
                            );
                        }
                    },
                    ParsedLine::Malformed => {
                        *dropped += 1;
                        if *dropped % DROP_LOG_EVERY == 1 {
                            warn!("Dropped {} malformed lines so far", dropped);
                            self.db.append_log(
                                LogLevel::Warn,
                                "PARSER",
                                "Malformed decoder line",
                                Some(line.trim()),
                            );
                        }
                    }
                    ParsedLine::Ignored => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.read_pause) => {}
            }
        }
    }

    /// One retry on a transient store error, then surface it.
    fn store_with_retry(&self, packet: &NewPacket) -> Result<(), ClientError> {
        match self.db.insert_packet(packet) {
            Ok(_) => Ok(()),
            Err(first) => {
                warn!("Packet insert failed, retrying once: {}", first);
                self.db.insert_packet(packet).map(|_| ())
            }
        }
    }

    async fn wait_reconnect(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.reconnect_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PacketKind;
    use chrono::Timelike;

    fn reference() -> DateTime<Local> {
        // Mid-afternoon local reference, away from midnight edge cases.
        Local
            .with_ymd_and_hms(2024, 3, 15, 14, 30, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn parses_k1_line() {
        let line = "K1 11:11:38.370.366 [ 8832] {018} **** :10437";
        let ParsedLine::Packet(packet) = parse_line(line, reference()) else {
            panic!("expected packet");
        };

        assert_eq!(packet.kind, PacketKind::K1);
        assert_eq!(packet.callsign.as_deref(), Some("10437"));
        assert_eq!(packet.height_m, None);
        assert_eq!(packet.faithfulness, 50);

        let local = packet.event_time.with_timezone(&Local);
        assert_eq!((local.hour(), local.minute(), local.second()), (11, 11, 38));
        assert_eq!(local.date_naive(), reference().date_naive());
    }

    #[test]
    fn parses_k2_line() {
        let line = "K2 11:12:54.082.632 [ 8706] {017} **** FL 5360m [F176]+  F:40%";
        let ParsedLine::Packet(packet) = parse_line(line, reference()) else {
            panic!("expected packet");
        };

        assert_eq!(packet.kind, PacketKind::K2);
        assert_eq!(packet.callsign, None);
        assert_eq!(packet.height_m, Some(5360));
        assert_eq!(packet.fuel_pct, Some(40));
        assert_eq!(packet.faithfulness, 0);
    }

    #[test]
    fn parses_k2_without_space_before_height() {
        let line = "K2 10:44:45.065.415 [     ] {01B} **** FL6130m [F201]+  F:35%";
        let ParsedLine::Packet(packet) = parse_line(line, reference()) else {
            panic!("expected packet");
        };
        assert_eq!(packet.height_m, Some(6130));
        assert_eq!(packet.fuel_pct, Some(35));
    }

    #[test]
    fn keeps_milliseconds_from_the_first_subsecond_field() {
        let line = "K1 11:11:38.370.366 [ 8832] {018} **** :10437";
        let ParsedLine::Packet(packet) = parse_line(line, reference()) else {
            panic!("expected packet");
        };
        assert_eq!(packet.event_time.timestamp_subsec_millis(), 370);
    }

    #[test]
    fn k1_without_callsign_is_malformed() {
        let line = "K1 11:11:38.370.366 [ 8832] {018} ****";
        assert_eq!(parse_line(line, reference()), ParsedLine::Malformed);
    }

    #[test]
    fn k2_without_fuel_is_malformed() {
        let line = "K2 11:12:54.082.632 [ 8706] {017} **** FL 5360m";
        assert_eq!(parse_line(line, reference()), ParsedLine::Malformed);
    }

    #[test]
    fn banner_lines_are_ignored() {
        assert_eq!(
            parse_line("uvd_rtl v2.1 listening on 31003", reference()),
            ParsedLine::Ignored
        );
        assert_eq!(parse_line("", reference()), ParsedLine::Ignored);
        assert_eq!(parse_line("   ", reference()), ParsedLine::Ignored);
    }

    #[test]
    fn time_more_than_12h_ahead_rolls_to_previous_day() {
        // Client just crossed midnight; decoder line still stamped 23:59.
        let after_midnight = Local
            .with_ymd_and_hms(2024, 3, 16, 0, 5, 0)
            .single()
            .unwrap();
        let line = "K1 23:59:10.000.000 [ 8832] {018} **** :10437";
        let ParsedLine::Packet(packet) = parse_line(line, after_midnight) else {
            panic!("expected packet");
        };

        let local = packet.event_time.with_timezone(&Local);
        assert_eq!(
            local.date_naive(),
            after_midnight.date_naive().pred_opt().unwrap()
        );
        assert!(packet.event_time < after_midnight.with_timezone(&Utc));
    }

    #[test]
    fn time_slightly_ahead_stays_on_same_day() {
        // Decoder clock a few seconds ahead is normal, no date shift.
        let now = Local.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).single().unwrap();
        let line = "K1 14:30:03.000.000 [ 8832] {018} **** :10437";
        let ParsedLine::Packet(packet) = parse_line(line, now) else {
            panic!("expected packet");
        };
        assert_eq!(
            packet.event_time.with_timezone(&Local).date_naive(),
            now.date_naive()
        );
    }
}
