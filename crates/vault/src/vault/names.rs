//! Physical layout of file objects in the store

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};

use crate::model::Realm;

const SEGMENT_FORMAT: &str = "%Y%m%d%H%M%S";
const SEQ_BITS: u32 = 5;
const NODE_BITS: u32 = 8;
/// How far ahead of the clock borrowed sequence numbers may run
const MAX_BORROW_MS: u64 = 1000;

/// One byte identifying this host in generated ids.
pub fn node_hash() -> u8 {
    static NODE: OnceLock<u8> = OnceLock::new();
    *NODE.get_or_init(|| {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .unwrap_or_else(|| "localhost".to_string());
        blake3::hash(host.as_bytes()).as_bytes()[0]
    })
}

/// Name of the segment directory holding files written at `time`.
pub(crate) fn segment_dir(time: DateTime<Utc>, interval: Duration) -> String {
    let interval = interval.as_secs().max(1) as i64;
    let secs = time.timestamp();
    let start = secs - secs.rem_euclid(interval);
    DateTime::from_timestamp(start, 0)
        .unwrap_or_default()
        .format(SEGMENT_FORMAT)
        .to_string()
}

/// Start time of a segment directory, `None` for anything else.
pub(crate) fn parse_segment_dir(name: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(name, SEGMENT_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// A sortable, collision resistant object name for a new file version.
///
/// Milliseconds of the day, the node hash and a per millisecond sequence,
/// base-36 encoded. Up to 32 names per millisecond per host; beyond that
/// the sequence borrows from the next millisecond.
pub(crate) fn physical_name(now: DateTime<Utc>) -> String {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let ms = now.num_seconds_from_midnight() as u64 * 1000 + now.timestamp_subsec_millis() as u64;
    let node = node_hash() as u64;
    let base = (ms << (NODE_BITS + SEQ_BITS)) | (node << SEQ_BITS);

    let mut last = LAST.load(Ordering::Relaxed);
    let value = loop {
        let ahead = last >= base && (last - base) >> (NODE_BITS + SEQ_BITS) < MAX_BORROW_MS;
        let next = if ahead && (last >> SEQ_BITS) & 0xff == node {
            // same host, same or earlier millisecond seen: bump the sequence
            let seq = (last & ((1 << SEQ_BITS) - 1)) + 1;
            if seq < 1 << SEQ_BITS {
                last + 1
            } else {
                (((last >> (NODE_BITS + SEQ_BITS)) + 1) << (NODE_BITS + SEQ_BITS))
                    | (node << SEQ_BITS)
            }
        } else {
            base
        };
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(current) => last = current,
        }
    };
    base36(value)
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn head_path(realm: &Realm, store_dir: &str, store_name: &str) -> String {
    format!("{}/{}/h/{}", realm.data_dir(), store_dir, store_name)
}

pub(crate) fn body_path(realm: &Realm, store_dir: &str, store_name: &str) -> String {
    format!("{}/{}/b/{}", realm.data_dir(), store_dir, store_name)
}

pub(crate) fn segment_path(realm: &Realm, store_dir: &str) -> String {
    format!("{}/{}", realm.data_dir(), store_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn test_segment_dir() {
        let t = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let day = Duration::from_secs(86_400);
        assert_eq!(segment_dir(t, day), "20250314000000");
        assert_eq!(segment_dir(t, Duration::from_secs(3600)), "20250314150000");
        assert_eq!(
            parse_segment_dir("20250314000000"),
            Some(Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_segment_dir(".change"), None);
    }

    #[test]
    fn test_physical_names_are_unique() {
        let now = Utc::now();
        let names: HashSet<String> = (0..200).map(|_| physical_name(now)).collect();
        assert_eq!(names.len(), 200);
        assert!(names.iter().all(|n| n.chars().all(|c| c.is_ascii_alphanumeric())));
    }

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }
}
