//! Bounded k-smallest selection.
//!
//! Used by callers to turn a batch of similarity values into a
//! shortlist of nearest tracks without sorting the whole batch.

use crate::TrackId;
use noisy_float::prelude::*;
use std::collections::BinaryHeap;

/// Select the `min_count` smallest entries of `values`.
///
/// Returns `(value, id)` pairs, where the id is taken from `ids` when
/// given and is the entry's index otherwise. `min_count` larger than
/// the input is clamped. Ties are broken by insertion order. With
/// `ordered`, the result is sorted by ascending value; otherwise the
/// order is unspecified (but deterministic).
///
/// NaN values are treated as +infinity, so they can never displace a
/// finite entry from the result.
pub fn find_min(
    values: &[f32],
    ids: Option<&[TrackId]>,
    min_count: usize,
    ordered: bool,
) -> Vec<(f32, TrackId)> {
    let min_count = min_count.min(values.len());
    if min_count == 0 {
        return Vec::new();
    }

    let key = |value: f32| {
        if value.is_nan() {
            n32(f32::INFINITY)
        } else {
            n32(value)
        }
    };
    let id_of = |i: usize| match ids {
        Some(ids) => ids[i],
        None => i as TrackId,
    };

    // max-heap over (value, insertion index): the root is the current
    // worst candidate, evicted whenever a strictly better entry shows
    // up later
    let mut heap: BinaryHeap<(N32, usize, TrackId)> = BinaryHeap::with_capacity(min_count);
    for i in 0..min_count {
        heap.push((key(values[i]), i, id_of(i)));
    }
    for (i, &value) in values.iter().enumerate().skip(min_count) {
        let candidate = (key(value), i, id_of(i));
        if let Some(top) = heap.peek() {
            if candidate < *top {
                heap.pop();
                heap.push(candidate);
            }
        }
    }

    let entries: Vec<(N32, usize, TrackId)> = if ordered {
        heap.into_sorted_vec()
    } else {
        heap.into_vec()
    };
    entries
        .into_iter()
        .map(|(value, _, id)| (value.raw(), id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUES: [f32; 10] = [0., -2., 3.5, 3.6, 1e10, -1e10, 4., 5., 4., 3.3];
    const IDS: [TrackId; 10] = [0, 1, 2, 3, 4, 5, 10, 9, 8, 7];

    #[test]
    fn test_unordered_matches_smallest_multiset() {
        let result = find_min(&VALUES, Some(&IDS), 5, false);
        assert_eq!(result.len(), 5);
        let mut values: Vec<f32> = result.iter().map(|(v, _)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![-1e10, -2., 0., 3.3, 3.5]);
        for id in [5, 1, 0, 7, 2] {
            assert!(result.iter().any(|(_, i)| *i == id));
        }
    }

    #[test]
    fn test_ordered_with_ids() {
        let result = find_min(&VALUES, Some(&IDS), 5, true);
        let expected = [(-1e10, 5), (-2., 1), (0., 0), (3.3, 7), (3.5, 2)];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_ordered_without_ids_returns_indices() {
        let result = find_min(&VALUES, None, 5, true);
        let expected = [(-1e10, 5), (-2., 1), (0., 0), (3.3, 9), (3.5, 2)];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_count_clamped() {
        let result = find_min(&[3., 1., 2.], None, 10, true);
        assert_eq!(result, vec![(1., 1), (2., 2), (3., 0)]);
        assert!(find_min(&[1., 2.], None, 0, true).is_empty());
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let values = [1., 1., 1., 1.];
        let result = find_min(&values, None, 2, true);
        assert_eq!(result, vec![(1., 0), (1., 1)]);
    }

    #[test]
    fn test_nan_never_selected() {
        let values = [f32::NAN, 2., 1., f32::NAN, 3.];
        let result = find_min(&values, None, 3, true);
        assert_eq!(result[0], (1., 2));
        assert_eq!(result[1], (2., 1));
        assert_eq!(result[2], (3., 4));
    }
}
