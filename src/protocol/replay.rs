//! Anti-replay window for transport counters
//!
//! RFC 6479 sliding window over 2048 bits held as 32-bit words. The newest
//! word is always partially ahead of the counters it can answer for, so the
//! usable width is 2048 - 32 counters behind the highest one seen.
//!
//! The high-water mark is mirrored in an atomic so the receive path can
//! discard hopeless counters before decrypting, without taking the lock.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Bits in the window
pub const WINDOW_BITS: u64 = 2048;

const WORD_BITS: u64 = u32::BITS as u64;
const WORDS: usize = (WINDOW_BITS / WORD_BITS) as usize;

/// How far behind the highest counter a packet may arrive
pub const WINDOW_SIZE: u64 = WINDOW_BITS - WORD_BITS;

#[derive(Debug)]
struct Bitmap {
    words: [u32; WORDS],
    highest: u64,
}

impl Bitmap {
    const fn new() -> Self {
        Self {
            words: [0; WORDS],
            highest: 0,
        }
    }

    fn update(&mut self, counter: u64) -> bool {
        if is_too_old(counter, self.highest) {
            return false;
        }

        let index = counter / WORD_BITS;
        if counter > self.highest {
            let current = self.highest / WORD_BITS;
            let advance = (index - current).min(WORDS as u64);
            for k in 0..advance {
                self.words[((current + k + 1) % WORDS as u64) as usize] = 0;
            }
            self.highest = counter;
        }

        let word = &mut self.words[(index % WORDS as u64) as usize];
        let bit = 1u32 << (counter % WORD_BITS);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        true
    }
}

fn is_too_old(counter: u64, highest: u64) -> bool {
    counter.saturating_add(WINDOW_SIZE) < highest
}

/// Receive-side replay window of one session
#[derive(Debug)]
pub struct ReplayWindow {
    highest: AtomicU64,
    bitmap: Mutex<Bitmap>,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub const fn new() -> Self {
        Self {
            highest: AtomicU64::new(0),
            bitmap: Mutex::new(Bitmap::new()),
        }
    }

    /// Lock-free pre-check: false if `counter` is certainly outside the window
    ///
    /// A true result is not a promise; [`update`](Self::update) decides.
    pub fn check_fast(&self, counter: u64) -> bool {
        !is_too_old(counter, self.highest.load(Ordering::Acquire))
    }

    /// Accept `counter` exactly once, sliding the window if it is new
    pub fn update(&self, counter: u64) -> bool {
        let mut bitmap = self.bitmap.lock();
        let accepted = bitmap.update(counter);
        self.highest.store(bitmap.highest, Ordering::Release);
        accepted
    }

    /// Highest counter accepted so far
    pub fn highest(&self) -> u64 {
        self.highest.load(Ordering::Acquire)
    }

    /// Forget everything (session reuse)
    pub fn reset(&self) {
        let mut bitmap = self.bitmap.lock();
        *bitmap = Bitmap::new();
        self.highest.store(0, Ordering::Release);
    }
}
