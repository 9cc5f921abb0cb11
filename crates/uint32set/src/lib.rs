//! Sorted interval set over `u32`.
//!
//! Tracks which addresses of a virtual network are in use. The set is kept
//! as an ordered list of disjoint inclusive runs, so membership updates stay
//! cheap whether the set is sparse or nearly full, and picking a free value
//! out of a block with millions of addresses does not require scanning them.

/// A set of `u32` values stored as sorted, disjoint, inclusive runs.
///
/// Runs are never adjacent: `add` merges neighbors and `remove` splits a run
/// when a hole is punched in its middle.
#[derive(Debug, Clone, Default)]
pub struct UInt32Set {
    runs: Vec<(u32, u32)>,
}

impl UInt32Set {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn contains(&self, x: u32) -> bool {
        let idx = self.runs.partition_point(|&(_, end)| end < x);
        idx < self.runs.len() && self.runs[idx].0 <= x
    }

    /// Inserts `x`. Returns whether the set changed.
    pub fn add(&mut self, x: u32) -> bool {
        // First run that could contain or follow x.
        let idx = self.runs.partition_point(|&(_, end)| end < x);
        if idx < self.runs.len() && self.runs[idx].0 <= x {
            return false;
        }
        let touches_left = idx > 0 && x > 0 && self.runs[idx - 1].1 == x - 1;
        let touches_right = idx < self.runs.len() && x < u32::MAX && self.runs[idx].0 == x + 1;
        match (touches_left, touches_right) {
            (true, true) => {
                self.runs[idx - 1].1 = self.runs[idx].1;
                self.runs.remove(idx);
            }
            (true, false) => self.runs[idx - 1].1 = x,
            (false, true) => self.runs[idx].0 = x,
            (false, false) => self.runs.insert(idx, (x, x)),
        }
        true
    }

    /// Removes `x`. Returns whether the set changed.
    pub fn remove(&mut self, x: u32) -> bool {
        let idx = self.runs.partition_point(|&(_, end)| end < x);
        if idx == self.runs.len() || self.runs[idx].0 > x {
            return false;
        }
        let (start, end) = self.runs[idx];
        if start == end {
            self.runs.remove(idx);
        } else if x == start {
            self.runs[idx].0 = start + 1;
        } else if x == end {
            self.runs[idx].1 = end - 1;
        } else {
            self.runs[idx].1 = x - 1;
            self.runs.insert(idx + 1, (x + 1, end));
        }
        true
    }

    /// Picks the lowest value in `[lo, hi]` not yet in the set, inserts it,
    /// and returns it. Returns `None` when the whole range is taken.
    ///
    /// Lowest-free-first keeps the choice deterministic across processes
    /// looking at equal sets.
    pub fn add_one_in_range(&mut self, lo: u32, hi: u32) -> Option<u32> {
        if lo > hi {
            return None;
        }
        let mut candidate = lo;
        let idx = self.runs.partition_point(|&(_, end)| end < candidate);
        for &(start, end) in &self.runs[idx..] {
            if start > candidate {
                break;
            }
            if end == u32::MAX || end + 1 > hi {
                return None;
            }
            candidate = end + 1;
        }
        if candidate > hi {
            return None;
        }
        self.add(candidate);
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runs(set: &UInt32Set) -> Vec<(u32, u32)> {
        set.runs.clone()
    }

    #[test]
    fn add_merges_neighboring_runs() {
        let mut set = UInt32Set::new();
        assert!(set.add(5));
        assert!(set.add(7));
        assert_eq!(runs(&set), vec![(5, 5), (7, 7)]);
        assert!(set.add(6));
        assert_eq!(runs(&set), vec![(5, 7)]);
        assert!(!set.add(6));
    }

    #[test]
    fn remove_splits_runs() {
        let mut set = UInt32Set::new();
        for x in 10..=20 {
            set.add(x);
        }
        assert!(set.remove(15));
        assert_eq!(runs(&set), vec![(10, 14), (16, 20)]);
        assert!(set.remove(10));
        assert!(set.remove(20));
        assert_eq!(runs(&set), vec![(11, 14), (16, 19)]);
        assert!(!set.remove(15));
        assert!(!set.remove(42));
    }

    #[test]
    fn removing_last_value_empties_the_set() {
        let mut set = UInt32Set::new();
        set.add(3);
        assert!(!set.is_empty());
        assert!(set.remove(3));
        assert!(set.is_empty());
    }

    #[test]
    fn pick_prefers_lowest_free() {
        let mut set = UInt32Set::new();
        assert_eq!(set.add_one_in_range(10, 20), Some(10));
        assert_eq!(set.add_one_in_range(10, 20), Some(11));
        set.add(12);
        set.add(13);
        assert_eq!(set.add_one_in_range(10, 20), Some(14));
        assert_eq!(runs(&set), vec![(10, 14)]);
    }

    #[test]
    fn pick_skips_over_preexisting_runs() {
        let mut set = UInt32Set::new();
        for x in 0..=5 {
            set.add(x);
        }
        for x in 7..=9 {
            set.add(x);
        }
        assert_eq!(set.add_one_in_range(0, 9), Some(6));
        assert_eq!(set.add_one_in_range(0, 9), None);
    }

    #[test]
    fn pick_exhausted_range_returns_none() {
        let mut set = UInt32Set::new();
        assert_eq!(set.add_one_in_range(4, 4), Some(4));
        assert_eq!(set.add_one_in_range(4, 4), None);
        assert_eq!(set.add_one_in_range(5, 4), None);
    }

    #[test]
    fn pick_at_u32_boundary() {
        let mut set = UInt32Set::new();
        assert_eq!(set.add_one_in_range(u32::MAX - 1, u32::MAX), Some(u32::MAX - 1));
        assert_eq!(set.add_one_in_range(u32::MAX - 1, u32::MAX), Some(u32::MAX));
        assert_eq!(set.add_one_in_range(u32::MAX - 1, u32::MAX), None);
    }

    #[test]
    fn contains_tracks_membership() {
        let mut set = UInt32Set::new();
        set.add(100);
        set.add(101);
        assert!(set.contains(100));
        assert!(set.contains(101));
        assert!(!set.contains(99));
        assert!(!set.contains(102));
    }
}
