//! The three quota dimensions and a triple indexed by them.

use serde::{Deserialize, Serialize};

/// A rate-limited dimension. Every key carries one ceiling per dimension,
/// enforced over the same sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    InputTokens,
    OutputTokens,
    Requests,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [
        Dimension::InputTokens,
        Dimension::OutputTokens,
        Dimension::Requests,
    ];

    /// Short tag used in store key names (`rl:{key}:{tag}:{bucket}`).
    pub fn tag(&self) -> &'static str {
        match self {
            Dimension::InputTokens => "in",
            Dimension::OutputTokens => "out",
            Dimension::Requests => "req",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One value per dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerDimension<T> {
    pub input_tokens: T,
    pub output_tokens: T,
    pub requests: T,
}

impl<T: Copy> PerDimension<T> {
    pub fn get(&self, dim: Dimension) -> T {
        match dim {
            Dimension::InputTokens => self.input_tokens,
            Dimension::OutputTokens => self.output_tokens,
            Dimension::Requests => self.requests,
        }
    }
}

impl<T> PerDimension<T> {
    pub fn set(&mut self, dim: Dimension, value: T) {
        match dim {
            Dimension::InputTokens => self.input_tokens = value,
            Dimension::OutputTokens => self.output_tokens = value,
            Dimension::Requests => self.requests = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_distinct() {
        let tags: std::collections::HashSet<_> =
            Dimension::ALL.iter().map(|d| d.tag()).collect();
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn per_dimension_get_set() {
        let mut triple = PerDimension::<u64>::default();
        triple.set(Dimension::OutputTokens, 7);
        assert_eq!(triple.get(Dimension::OutputTokens), 7);
        assert_eq!(triple.get(Dimension::InputTokens), 0);
    }
}
