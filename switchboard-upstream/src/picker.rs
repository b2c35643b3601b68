//! Weighted random selection over a map of candidate weights.
//!
//! Selection only: the picker never mutates or copies the input map. The
//! router owns the weight map per request and decays entries itself.

use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Failures of a single pick.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickError {
    /// The candidate map is empty.
    #[error("no items to pick from")]
    EmptyItems,
    /// Weights sum to zero.
    #[error("total weight is not positive")]
    NonPositiveTotal,
}

/// Pick one key with probability `weight / Σweight`.
///
/// Draws `r ∈ [0, Σweight)` and walks the entries in one iteration pass,
/// subtracting weights until the draw is consumed. The iteration order is
/// whatever the map yields, which is stable for the duration of the call.
pub fn pick<K: Copy + Eq + Hash>(items: &HashMap<K, u32>) -> Result<K, PickError> {
    if items.is_empty() {
        return Err(PickError::EmptyItems);
    }
    let total: u64 = items.values().map(|&w| u64::from(w)).sum();
    if total == 0 {
        return Err(PickError::NonPositiveTotal);
    }

    let mut draw = rand::thread_rng().gen_range(0..total);
    for (&key, &weight) in items {
        let weight = u64::from(weight);
        if draw < weight {
            return Ok(key);
        }
        draw -= weight;
    }

    // draw < total and the weights sum to total, so the walk always lands.
    unreachable!("weighted pick walked past the total weight")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_is_deterministic() {
        let items = HashMap::from([(7i64, 3u32)]);
        for _ in 0..50 {
            assert_eq!(pick(&items), Ok(7));
        }
    }

    #[test]
    fn empty_map_fails() {
        let items: HashMap<i64, u32> = HashMap::new();
        assert_eq!(pick(&items), Err(PickError::EmptyItems));
    }

    #[test]
    fn zero_total_fails() {
        let items = HashMap::from([(1i64, 0u32), (2, 0)]);
        assert_eq!(pick(&items), Err(PickError::NonPositiveTotal));
    }

    #[test]
    fn always_returns_a_present_key() {
        let items = HashMap::from([(1i64, 5u32), (2, 1), (3, 9)]);
        for _ in 0..1000 {
            let picked = pick(&items).unwrap();
            assert!(items.contains_key(&picked));
        }
    }

    #[test]
    fn distribution_roughly_follows_weights() {
        let items = HashMap::from([(1i64, 3u32), (2, 1)]);
        let mut first = 0u32;
        let draws = 10_000;
        for _ in 0..draws {
            if pick(&items).unwrap() == 1 {
                first += 1;
            }
        }
        // Expected 75%; allow a wide band to keep the test stable.
        let share = f64::from(first) / f64::from(draws);
        assert!(share > 0.65 && share < 0.85, "share was {share}");
    }
}
