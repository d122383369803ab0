//! Weighted random selection over a multiset of slots.
//!
//! Every item occupies as many slots as its weight, so a uniform draw over the
//! slots picks an item with probability `weight / total`. An index from item to
//! its slot positions keeps existence checks O(1) and removal O(k) in the
//! number of slots being removed.
//!
//! The selector itself is not synchronised. [`Registry`] owns it behind the
//! same lock as the registration table so both change together.
//!
//! [`Registry`]: crate::balancer::registry::Registry

use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct WeightedSelector<T> {
    slots: Vec<T>,
    positions: HashMap<T, Vec<usize>>,
}

impl<T> Default for WeightedSelector<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> WeightedSelector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `weight` slots referencing `item`.
    ///
    /// Repeated inserts of the same item are additive. A zero weight adds
    /// nothing; callers are expected to reject it before getting here.
    pub fn insert(&mut self, item: T, weight: u32) {
        if weight == 0 {
            return;
        }

        let positions = self.positions.entry(item.clone()).or_default();
        positions.reserve(weight as usize);
        self.slots.reserve(weight as usize);
        for _ in 0..weight {
            positions.push(self.slots.len());
            self.slots.push(item.clone());
        }
    }

    /// Returns the item of a uniformly random slot, or `None` when empty.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = rng.random_range(0..self.slots.len());
        self.slots.get(idx)
    }

    /// Removes every slot referencing `item` and returns how many were removed.
    pub fn remove_all(&mut self, item: &T) -> usize {
        let Some(mut victims) = self.positions.remove(item) else {
            return 0;
        };
        let removed = victims.len();
        victims.sort_unstable();
        // Highest position first: everything after the current victim is
        // then never another victim.
        for pos in victims.into_iter().rev() {
            self.swap_out(pos);
        }
        removed
    }

    /// Removes up to `count` slots referencing `item`.
    ///
    /// Removing as many slots as the item holds (or more) is the same as
    /// [`remove_all`](Self::remove_all).
    pub fn remove(&mut self, item: &T, count: u32) -> usize {
        let Some(positions) = self.positions.get_mut(item) else {
            return 0;
        };
        let count = count as usize;
        if count >= positions.len() {
            return self.remove_all(item);
        }

        positions.sort_unstable();
        let victims = positions.split_off(positions.len() - count);
        for pos in victims.into_iter().rev() {
            self.swap_out(pos);
        }
        count
    }

    /// Number of slots currently held by `item`.
    pub fn count(&self, item: &T) -> usize {
        self.positions.get(item).map_or(0, Vec::len)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.positions.contains_key(item)
    }

    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes the slot at `pos` by moving the last slot into its place and
    /// fixing up the moved item's index entry.
    fn swap_out(&mut self, pos: usize) {
        let last = self.slots.len() - 1;
        self.slots.swap_remove(pos);
        if pos == last {
            return;
        }

        let moved = &self.slots[pos];
        if let Some(moved_positions) = self.positions.get_mut(moved) {
            if let Some(p) = moved_positions.iter_mut().find(|p| **p == last) {
                *p = pos;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Every indexed position must point back at its item, and the index must
    /// cover every slot exactly once.
    fn assert_consistent(selector: &WeightedSelector<&'static str>) {
        let mut indexed = 0;
        for (item, positions) in &selector.positions {
            assert!(!positions.is_empty());
            for &pos in positions {
                assert_eq!(selector.slots[pos], *item);
            }
            indexed += positions.len();
        }
        assert_eq!(indexed, selector.len());
    }

    #[test]
    fn test_insert_then_remove_all_leaves_nothing() {
        let mut selector = WeightedSelector::new();
        let mut rng = StdRng::seed_from_u64(1);

        selector.insert("a", 4);
        assert_eq!(selector.len(), 4);
        assert_eq!(selector.remove_all(&"a"), 4);

        assert_eq!(selector.len(), 0);
        assert!(selector.is_empty());
        assert!(selector.draw(&mut rng).is_none());
        assert!(!selector.contains(&"a"));
    }

    #[test]
    fn test_remove_all_missing_is_noop() {
        let mut selector = WeightedSelector::new();
        selector.insert("a", 2);

        assert_eq!(selector.remove_all(&"b"), 0);
        assert_eq!(selector.len(), 2);
        assert_consistent(&selector);
    }

    #[test]
    fn test_insert_is_additive() {
        let mut selector = WeightedSelector::new();
        selector.insert("a", 2);
        selector.insert("b", 1);
        selector.insert("a", 3);

        assert_eq!(selector.count(&"a"), 5);
        assert_eq!(selector.count(&"b"), 1);
        assert_eq!(selector.len(), 6);
        assert_consistent(&selector);
    }

    #[test]
    fn test_zero_weight_is_ignored() {
        let mut selector = WeightedSelector::new();
        selector.insert("a", 0);

        assert!(selector.is_empty());
        assert!(!selector.contains(&"a"));
    }

    #[test]
    fn test_remove_all_keeps_index_consistent() {
        let mut selector = WeightedSelector::new();
        selector.insert("a", 3);
        selector.insert("b", 2);
        selector.insert("a", 1);
        selector.insert("c", 4);
        selector.insert("b", 2);

        assert_eq!(selector.remove_all(&"b"), 4);
        assert_eq!(selector.len(), 8);
        assert_eq!(selector.count(&"a"), 4);
        assert_eq!(selector.count(&"c"), 4);
        assert_consistent(&selector);

        assert_eq!(selector.remove_all(&"a"), 4);
        assert_eq!(selector.len(), 4);
        assert!(selector.slots.iter().all(|s| *s == "c"));
        assert_consistent(&selector);
    }

    #[test]
    fn test_partial_remove() {
        let mut selector = WeightedSelector::new();
        selector.insert("a", 2);
        selector.insert("b", 3);
        selector.insert("a", 2);

        assert_eq!(selector.remove(&"a", 2), 2);
        assert_eq!(selector.count(&"a"), 2);
        assert_eq!(selector.len(), 5);
        assert_consistent(&selector);

        // Removing more than held drops the item entirely.
        assert_eq!(selector.remove(&"a", 10), 2);
        assert!(!selector.contains(&"a"));
        assert_eq!(selector.len(), 3);
        assert_consistent(&selector);
    }

    #[test]
    fn test_draw_never_returns_removed_item() {
        let mut selector = WeightedSelector::new();
        let mut rng = StdRng::seed_from_u64(7);
        selector.insert("a", 5);
        selector.insert("b", 5);
        selector.remove_all(&"a");

        for _ in 0..1_000 {
            assert_eq!(selector.draw(&mut rng), Some(&"b"));
        }
    }

    #[test]
    fn test_draw_frequency_follows_weights() {
        let mut selector = WeightedSelector::new();
        let mut rng = StdRng::seed_from_u64(42);
        selector.insert("a", 1);
        selector.insert("b", 2);
        selector.insert("c", 3);

        let draws = 120_000;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..draws {
            let item = selector.draw(&mut rng).copied().unwrap();
            *counts.entry(item).or_default() += 1;
        }

        for (item, weight) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            let observed = counts[item] as f64 / draws as f64;
            let expected = weight / 6.0;
            assert!(
                (observed - expected).abs() < 0.01,
                "{item}: observed {observed:.4}, expected {expected:.4}"
            );
        }
    }

    #[test]
    fn test_double_insert_doubles_share() {
        let mut selector = WeightedSelector::new();
        let mut rng = StdRng::seed_from_u64(3);
        selector.insert("a", 2);
        selector.insert("b", 2);
        selector.insert("a", 2);

        let draws = 90_000;
        let hits = (0..draws)
            .filter(|_| selector.draw(&mut rng) == Some(&"a"))
            .count();
        let share = hits as f64 / draws as f64;
        assert!((share - 2.0 / 3.0).abs() < 0.01, "share was {share:.4}");
    }
}
