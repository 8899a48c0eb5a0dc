//! Sliding-window geometry.
//!
//! The window of width W seconds is split into N segments of S seconds
//! (`N*S = W`). A segment is addressed by its bucket index `floor(t / S)`; the
//! window at instant `t` covers buckets `(floor(t/S) - N, floor(t/S)]`.

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    segment_secs: u32,
    window_secs: u32,
    sweep_deadline_secs: u32,
}

impl WindowConfig {
    /// S = 1 s, W = 60 s, T_sweep = 120 s.
    pub const DEFAULT: WindowConfig = WindowConfig {
        segment_secs: 1,
        window_secs: 60,
        sweep_deadline_secs: 120,
    };

    pub fn new(
        segment_secs: u32,
        window_secs: u32,
        sweep_deadline_secs: u32,
    ) -> Result<Self, ConfigError> {
        if segment_secs == 0 {
            return Err(ConfigError::ZeroSegment);
        }
        if window_secs == 0 || window_secs % segment_secs != 0 {
            return Err(ConfigError::UnevenSegments {
                window_secs,
                segment_secs,
            });
        }
        if sweep_deadline_secs < window_secs {
            return Err(ConfigError::SweepTooShort {
                window_secs,
                sweep_secs: sweep_deadline_secs,
            });
        }
        Ok(Self {
            segment_secs,
            window_secs,
            sweep_deadline_secs,
        })
    }

    pub fn segment_secs(&self) -> u32 {
        self.segment_secs
    }

    pub fn window_secs(&self) -> u32 {
        self.window_secs
    }

    pub fn sweep_deadline_secs(&self) -> u32 {
        self.sweep_deadline_secs
    }

    /// Number of segments N covering one window.
    pub fn segments(&self) -> i64 {
        i64::from(self.window_secs / self.segment_secs)
    }

    /// Bucket index for an instant.
    pub fn bucket(&self, now_secs: i64) -> i64 {
        now_secs.div_euclid(i64::from(self.segment_secs))
    }

    /// Oldest bucket still inside the window ending at `now_bucket`.
    pub fn oldest_live_bucket(&self, now_bucket: i64) -> i64 {
        now_bucket - self.segments() + 1
    }

    /// Segment TTL: 2*W, so counts at the window edge never expire early.
    pub fn segment_ttl_secs(&self) -> u64 {
        u64::from(self.window_secs) * 2
    }

    /// Reservation record TTL: 2*T_sweep, long enough for the sweeper to
    /// still read the triple it has to return.
    pub fn reservation_ttl_secs(&self) -> u64 {
        u64::from(self.sweep_deadline_secs) * 2
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
