//! Line reader and timestamp extraction

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::messages::LineOrigin;
use crate::registry::LogStream;
use crate::source::Source;

use super::emitter::Emitter;

/// `2024-01-02T15:04:05.123456789Z`
const RFC3339_NANO_LEN: usize = 30;
/// `2024-01-02T15:04:05+07:00`
const RFC3339_LEN: usize = 25;
/// `2024-01-02T15:04:05Z`
const RFC3339_UTC_LEN: usize = 20;
/// `2024-01-02T15:04:05`
const BARE_LEN: usize = 19;

/// Split a leading timestamp off a log line
///
/// Tries fixed-length prefixes of 30, 25, 20 and 19 bytes in that order; the
/// first that parses wins and the rest of the line, without leading spaces,
/// is the content. With no recognizable prefix the whole line is returned
/// together with `fallback`.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use logstream_core::extract_timestamp;
///
/// let (ts, content) = extract_timestamp("2024-01-02T15:04:05Z rest of line", Utc::now());
/// assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 5).unwrap());
/// assert_eq!(content, "rest of line");
/// ```
#[must_use]
pub fn extract_timestamp(line: &str, fallback: DateTime<Utc>) -> (DateTime<Utc>, &str) {
    for len in [RFC3339_NANO_LEN, RFC3339_LEN, RFC3339_UTC_LEN] {
        if let Some(prefix) = prefix(line, len) {
            if let Ok(ts) = DateTime::parse_from_rfc3339(prefix) {
                return (ts.with_timezone(&Utc), line[len..].trim_start_matches(' '));
            }
        }
    }

    if let Some(prefix) = prefix(line, BARE_LEN) {
        if let Ok(ts) = NaiveDateTime::parse_from_str(prefix, "%Y-%m-%dT%H:%M:%S") {
            return (ts.and_utc(), line[BARE_LEN..].trim_start_matches(' '));
        }
    }

    (fallback, line)
}

fn prefix(line: &str, len: usize) -> Option<&str> {
    if line.len() >= len && line.is_char_boundary(len) {
        Some(&line[..len])
    } else {
        None
    }
}

/// How one read pass over a stream ended
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// The stream ended; `error` is set if it ended abnormally
    Finished {
        lines: u64,
        error: Option<String>,
    },
    /// The token fired or the consumer went away
    Cancelled,
}

/// Read `stream` to its end, forwarding every line through `emitter`
pub(crate) async fn read_lines(
    stream: LogStream,
    source: &Source,
    origin: LineOrigin,
    max_line_bytes: usize,
    emitter: &Emitter,
    token: &CancellationToken,
) -> ReadOutcome {
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_line_bytes);
    let mut frames = FramedRead::new(stream, codec);
    let mut lines = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            () = token.cancelled() => return ReadOutcome::Cancelled,
            frame = frames.next() => frame,
        };

        let chunk = match frame {
            None => return ReadOutcome::Finished { lines, error: None },
            Some(Ok(chunk)) => chunk,
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                return ReadOutcome::Finished {
                    lines,
                    error: Some(format!("line exceeds {max_line_bytes} bytes")),
                };
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => {
                return ReadOutcome::Finished {
                    lines,
                    error: Some(e.to_string()),
                };
            }
        };

        let text = String::from_utf8_lossy(&chunk);
        let text = text.strip_suffix('\r').unwrap_or(&text);
        if !emitter.source_line(token, source, text, origin).await {
            return ReadOutcome::Cancelled;
        }
        lines += 1;
    }
}
