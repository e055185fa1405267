//! Modular counter arithmetic for the PPS delta register.
//!
//! The oscillator reports the 1PPS delta as a free-running count of crystal
//! cycles in `[0, crystal_hz)`. A reference edge slightly *ahead* of the local
//! edge shows up as a value just below the modulus, so every raw reading is
//! folded into a signed range before any arithmetic touches it.

/// Fold a raw modular reading into `(-modulus/2, modulus/2]`.
pub fn correct_rollover(raw: u64, modulus: u64) -> i64 {
    if raw > modulus / 2 {
        raw as i64 - modulus as i64
    } else {
        raw as i64
    }
}

/// Advance the archival sample counter, wrapping to zero at `limit`.
///
/// The counter only tags archived buckets; wraparound is tolerated.
pub fn advance_sample_counter(counter: u64, limit: u64) -> u64 {
    let next = counter + 1;
    if next >= limit {
        0
    } else {
        next
    }
}
