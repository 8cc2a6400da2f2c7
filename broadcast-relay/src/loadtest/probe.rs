//! The load-test payload: `"<send time in microseconds>|<client tag>"`.
//!
//! Clients see every broadcast on the relay, so each one scans the traffic
//! for the probe carrying its own tag. Tags are compared whole, so client
//! `7` never mistakes the probes of clients `17` or `70` for its own.

use std::{
    str,
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tokio::time::Instant;

use super::ClientOutcome;

/// Wall-clock microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
        })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("payload is not UTF-8")]
    NotUtf8,
    #[error("payload has no '|' separator")]
    MissingSeparator,
    #[error("invalid timestamp {0:?}")]
    BadTimestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub sent_at_micros: u64,
    pub tag: String,
}

impl Probe {
    pub fn new(sent_at_micros: u64, tag: impl Into<String>) -> Self {
        Self {
            sent_at_micros,
            tag: tag.into(),
        }
    }

    /// A probe stamped with the current time.
    pub fn now(tag: impl Into<String>) -> Self {
        Self::new(now_micros(), tag)
    }

    pub fn encode(&self) -> String {
        format!("{}|{}", self.sent_at_micros, self.tag)
    }

    /// Splits on the last `|`, so the timestamp is everything before it.
    /// A trailing line terminator is ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, ProbeError> {
        let text = str::from_utf8(payload).map_err(|_| ProbeError::NotUtf8)?;
        let text = text.trim_end_matches(['\r', '\n']);
        let (stamp, tag) = text.rsplit_once('|').ok_or(ProbeError::MissingSeparator)?;
        let sent_at_micros = stamp
            .parse()
            .map_err(|_| ProbeError::BadTimestamp(stamp.to_owned()))?;
        Ok(Self::new(sent_at_micros, tag))
    }
}

/// Watches incoming traffic for one client's own probe.
#[derive(Debug)]
pub struct ReplyWatch {
    tag: String,
    deadline: Instant,
    latency: Option<u64>,
}

impl ReplyWatch {
    pub fn new(tag: impl Into<String>, deadline: Instant) -> Self {
        Self {
            tag: tag.into(),
            deadline,
            latency: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Checks one received payload, timed against the current clock.
    pub fn offer(&mut self, payload: &[u8]) -> bool {
        self.offer_at(payload, now_micros())
    }

    /// Records the first payload carrying this watch's tag. Returns whether
    /// `payload` was that reply; later copies are ignored.
    pub fn offer_at(&mut self, payload: &[u8], received_at_micros: u64) -> bool {
        if self.latency.is_some() {
            return false;
        }
        match Probe::parse(payload) {
            Ok(probe) if probe.tag == self.tag => {
                self.latency = Some(received_at_micros.saturating_sub(probe.sent_at_micros));
                true
            }
            _ => false,
        }
    }

    pub fn latency(&self) -> Option<u64> {
        self.latency
    }

    pub fn outcome(&self) -> ClientOutcome {
        match self.latency {
            Some(micros) => ClientOutcome::Latency(micros),
            None => ClientOutcome::NoReply,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn watch(tag: &str) -> ReplyWatch {
        ReplyWatch::new(tag, Instant::now() + Duration::from_secs(10))
    }

    #[test]
    fn encodes_timestamp_then_tag() {
        assert_eq!(Probe::new(1_000_000, "7").encode(), "1000000|7");
    }

    #[test]
    fn parse_splits_on_last_separator_and_trims_line_end() {
        let probe = Probe::parse(b"1000000|7\r\n").unwrap();
        assert_eq!(probe, Probe::new(1_000_000, "7"));
        assert_eq!(Probe::parse(b"no separator"), Err(ProbeError::MissingSeparator));
        assert_eq!(
            Probe::parse(b"soon|7"),
            Err(ProbeError::BadTimestamp("soon".into()))
        );
        assert_eq!(Probe::parse(&[0xff, b'|', b'1']), Err(ProbeError::NotUtf8));
    }

    #[test]
    fn tag_matching_is_exact() {
        let mut seven = watch("7");
        assert!(!seven.offer_at(b"1000000|17", 1_000_500));
        assert!(!seven.offer_at(b"1000000|70", 1_000_500));
        assert!(seven.latency().is_none());

        assert!(seven.offer_at(b"1000000|7", 1_000_250));
        assert_eq!(seven.outcome(), ClientOutcome::Latency(250));
    }

    #[test]
    fn co_present_tags_each_find_their_own_probe() {
        let traffic: [&[u8]; 3] = [b"1000100|17\n", b"1000000|7\n", b"1000200|70\n"];
        let mut seven = watch("7");
        let mut seventeen = watch("17");
        for payload in traffic {
            seven.offer_at(payload, 1_001_000);
            seventeen.offer_at(payload, 1_001_000);
        }
        assert_eq!(seven.latency(), Some(1_000));
        assert_eq!(seventeen.latency(), Some(900));
    }

    #[test]
    fn only_the_first_reply_counts() {
        let mut watch = watch("3");
        assert!(watch.offer_at(b"100|3", 150));
        assert!(!watch.offer_at(b"100|3", 900));
        assert_eq!(watch.latency(), Some(50));
    }

    #[test]
    fn clock_skew_saturates_to_zero() {
        let mut watch = watch("1");
        watch.offer_at(b"2000|1", 1000);
        assert_eq!(watch.latency(), Some(0));
    }

    #[test]
    fn silence_is_no_reply() {
        assert_eq!(watch("9").outcome(), ClientOutcome::NoReply);
    }
}
