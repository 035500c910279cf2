// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Step limiting and dead-band filtering of duty targets.
//!
//! Spin-up is never delayed: a rising target passes straight through. A
//! falling target drops by at most `max_step` per tick. Changes smaller than
//! the dead-band are suppressed so the device isn't rewritten for noise.

/// Limit `raw_target` against the duty last applied to the device.
///
/// - `last_applied == None`: nothing to compare against, `raw_target` is used.
/// - `max_step` of `None` or `Some(0)` disables the downward step limit.
/// - The dead-band is checked against the step-limited value.
pub fn apply(raw_target: u8, last_applied: Option<u8>, max_step: Option<u8>, dead_band: u8) -> u8 {
    let Some(last) = last_applied else {
        return raw_target;
    };

    let mut candidate = raw_target;
    if let Some(step) = max_step.filter(|s| *s > 0) {
        let floor = last.saturating_sub(step);
        if candidate < floor {
            candidate = floor;
        }
    }

    if last.abs_diff(candidate) < dead_band {
        return last;
    }

    candidate
}

/// Rate limiter settings, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimiter {
    pub max_step: Option<u8>,
    pub dead_band: u8,
}

impl RateLimiter {
    pub fn new(max_step: Option<u8>, dead_band: u8) -> Self {
        Self {
            max_step,
            dead_band,
        }
    }

    pub fn apply(&self, raw_target: u8, last_applied: Option<u8>) -> u8 {
        apply(raw_target, last_applied, self.max_step, self.dead_band)
    }
}
