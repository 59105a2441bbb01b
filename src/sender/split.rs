//! Split planning for artifacts larger than the channel limit.

/// Per-part duration used when the source duration cannot be probed.
pub const FALLBACK_PART_SECS: f64 = 60.0;
const MIN_PART_SECS: f64 = 1.0;
const SHRINK_MARGIN: f64 = 0.95;

/// Configured limit scaled by the safety margin.
pub fn effective_limit(max_bytes: u64, safety: f64) -> u64 {
    (max_bytes as f64 * safety).floor() as u64
}

pub fn needs_split(size: u64, limit: u64) -> bool {
    size > limit
}

/// Target part duration: the share of `duration` that fits in `limit`.
pub fn part_duration(duration: Option<f64>, size: u64, limit: u64) -> f64 {
    match duration {
        Some(secs) if secs.is_finite() && secs > 0.0 && size > 0 => {
            (secs * limit as f64 / size as f64).max(MIN_PART_SECS)
        }
        _ => FALLBACK_PART_SECS,
    }
}

/// Shorter part duration after a split produced a part of `largest` bytes.
/// Targets slightly under the limit.
pub fn shrink_part_duration(secs: f64, largest: u64, limit: u64) -> f64 {
    if largest == 0 {
        return secs;
    }
    (secs * limit as f64 / largest as f64 * SHRINK_MARGIN).max(MIN_PART_SECS)
}

/// Number of parts a size-proportional split yields.
pub fn expected_parts(size: u64, limit: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    size.div_ceil(limit).max(1)
}
