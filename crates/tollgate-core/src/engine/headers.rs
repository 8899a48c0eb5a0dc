//! Outward-facing rate-limit headers.
//!
//! Requests get their own limit/remaining pair. The token pair reports the
//! tightest binding of the two token dimensions, measured as the smallest
//! remaining/ceiling ratio; ties go to output tokens because reservations
//! make output the uncertain dimension.

use crate::domain::{Dimension, KeyLimits, PerDimension};

/// Values for the `X-RateLimit-*` response headers, emitted on every
/// admission path (200 and 429 alike).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHeaders {
    pub limit_requests: u64,
    pub remaining_requests: u64,
    pub limit_tokens: u64,
    pub remaining_tokens: u64,
}

impl QuotaHeaders {
    /// Headers after an admission: `remaining = C - used - add`.
    pub fn admitted(limits: &KeyLimits, used: PerDimension<u64>, add: PerDimension<u64>) -> Self {
        Self::build(limits, |dim| {
            limits
                .ceiling(dim)
                .saturating_sub(used.get(dim))
                .saturating_sub(add.get(dim))
        })
    }

    /// Headers for a rejection: `remaining = C - used`, nothing was added.
    pub fn rejected(limits: &KeyLimits, used: PerDimension<u64>) -> Self {
        Self::build(limits, |dim| {
            limits.ceiling(dim).saturating_sub(used.get(dim))
        })
    }

    fn build(limits: &KeyLimits, remaining: impl Fn(Dimension) -> u64) -> Self {
        let tokens = tightest_token_dimension(
            limits,
            remaining(Dimension::InputTokens),
            remaining(Dimension::OutputTokens),
        );
        Self {
            limit_requests: limits.rpm,
            remaining_requests: remaining(Dimension::Requests),
            limit_tokens: limits.ceiling(tokens),
            remaining_tokens: remaining(tokens),
        }
    }
}

fn tightest_token_dimension(
    limits: &KeyLimits,
    remaining_input: u64,
    remaining_output: u64,
) -> Dimension {
    let ratio = |remaining: u64, ceiling: u64| {
        if ceiling == 0 {
            0.0
        } else {
            remaining as f64 / ceiling as f64
        }
    };
    let input = ratio(remaining_input, limits.input_tpm);
    let output = ratio(remaining_output, limits.output_tpm);
    if output <= input {
        Dimension::OutputTokens
    } else {
        Dimension::InputTokens
    }
}
