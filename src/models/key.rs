use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::models::Variable;
use crate::utils::constants::DIM_TIME;

/// Position of a fragment in the destination store: an offset along each
/// chunked dimension plus the variables it carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub offsets: BTreeMap<String, usize>,
    pub vars: BTreeSet<String>,
}

impl ChunkKey {
    pub fn for_time_chunk(start: usize, variable: &str) -> Self {
        let offsets = BTreeMap::from([(DIM_TIME.to_string(), start)]);
        let vars = BTreeSet::from([variable.to_string()]);
        Self { offsets, vars }
    }

    /// Offset along `dim`; dimensions without an entry start at zero.
    pub fn offset(&self, dim: &str) -> usize {
        self.offsets.get(dim).copied().unwrap_or(0)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offsets: Vec<String> = self
            .offsets
            .iter()
            .map(|(dim, off)| format!("{}={}", dim, off))
            .collect();
        let vars: Vec<&str> = self.vars.iter().map(String::as_str).collect();
        write!(f, "Key({}, vars={{{}}})", offsets.join(", "), vars.join(", "))
    }
}

/// One variable's values over one chunk of output timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub times: Vec<NaiveDateTime>,
    pub variable: Variable,
}

impl Fragment {
    pub fn name(&self) -> &str {
        &self.variable.name
    }

    pub fn time_len(&self) -> usize {
        self.times.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_chunk_key() {
        let key = ChunkKey::for_time_chunk(120, "t2m");
        assert_eq!(key.offset("time"), 120);
        assert_eq!(key.offset("latitude"), 0);
        assert!(key.vars.contains("t2m"));
        assert_eq!(key.to_string(), "Key(time=120, vars={t2m})");
    }

    #[test]
    fn test_keys_distinguish_variables() {
        let a = ChunkKey::for_time_chunk(0, "t2m");
        let b = ChunkKey::for_time_chunk(0, "z500");
        assert_ne!(a, b);
        assert!(a < b);
    }
}
