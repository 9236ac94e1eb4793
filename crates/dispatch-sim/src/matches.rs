use std::sync::{Mutex, PoisonError};

use dispatch_core::SearchTerm;
use rand::{Rng, SeedableRng, rngs::StdRng};

pub const DEFAULT_MATCH_COUNT: usize = 3;

/// Stand-in payload for simulated results.
///
/// Match `i` is the term followed by `i` random lowercase letters, so the
/// first match is always the term itself.
#[derive(Debug)]
pub struct MatchGenerator {
    count: usize,
    rng: Mutex<StdRng>,
}

impl MatchGenerator {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn seeded(count: usize, seed: u64) -> Self {
        Self {
            count,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn generate(&self, term: &SearchTerm) -> Vec<String> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        (0..self.count)
            .map(|suffix_len| {
                let mut candidate = String::with_capacity(term.len() + suffix_len);
                candidate.push_str(term);
                candidate.extend(
                    (0..suffix_len).map(|_| char::from(b'a' + rng.random_range(0..26_u8))),
                );
                candidate
            })
            .collect()
    }
}

impl Default for MatchGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_COUNT)
    }
}
