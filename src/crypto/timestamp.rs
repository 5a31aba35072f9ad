//! TAI64N timestamps for handshake initiations
//!
//! The 12-byte encoding (8-byte big-endian TAI seconds, 4-byte big-endian
//! nanoseconds) orders correctly under a plain byte comparison, which is how
//! responders decide whether an initiation is fresh.

use tai64::Tai64N;

/// Encoded timestamp length
pub const TIMESTAMP_LEN: usize = 12;

/// Raw TAI64N label
pub type Timestamp = [u8; TIMESTAMP_LEN];

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Produces strictly increasing TAI64N labels
///
/// Two calls within the clock's resolution still yield distinct,
/// increasing values.
#[derive(Debug, Default, Clone)]
pub struct TimestampGenerator {
    last: Option<Timestamp>,
}

impl TimestampGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next label, always greater than every label returned before
    pub fn next(&mut self) -> Timestamp {
        let now = Tai64N::now().to_bytes();
        let stamp = match self.last {
            Some(last) if now <= last => successor(&last),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// The label one nanosecond after `stamp`
fn successor(stamp: &Timestamp) -> Timestamp {
    let mut secs = [0u8; 8];
    secs.copy_from_slice(&stamp[..8]);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&stamp[8..]);

    let mut secs = u64::from_be_bytes(secs);
    let mut nanos = u32::from_be_bytes(nanos) + 1;
    if nanos >= NANOS_PER_SEC {
        nanos = 0;
        secs += 1;
    }

    let mut out = [0u8; TIMESTAMP_LEN];
    out[..8].copy_from_slice(&secs.to_be_bytes());
    out[8..].copy_from_slice(&nanos.to_be_bytes());
    out
}

/// True if `candidate` is strictly later than `latest`
pub fn is_newer(candidate: &Timestamp, latest: &Timestamp) -> bool {
    candidate > latest
}
