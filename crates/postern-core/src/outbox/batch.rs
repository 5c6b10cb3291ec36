//! Greedy batch packing

use std::ops::Range;

/// Pack consecutive items into batches whose summed size stays within `cap`
///
/// Items keep their order. An item larger than `cap` gets a batch of its own.
pub(crate) fn pack_batches(sizes: &[usize], cap: usize) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut used = 0;

    for (index, &size) in sizes.iter().enumerate() {
        if index > start && used + size > cap {
            batches.push(start..index);
            start = index;
            used = 0;
        }
        used += size;
    }

    if start < sizes.len() {
        batches.push(start..sizes.len());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert!(pack_batches(&[], 100).is_empty());
    }

    #[test]
    fn test_fills_up_to_cap() {
        assert_eq!(pack_batches(&[40, 40, 20, 10], 100), vec![0..3, 3..4]);
        assert_eq!(pack_batches(&[50, 50, 50], 100), vec![0..2, 2..3]);
    }

    #[test]
    fn test_oversized_item_alone() {
        assert_eq!(pack_batches(&[10, 500, 10], 100), vec![0..1, 1..2, 2..3]);
        assert_eq!(pack_batches(&[500], 100), vec![0..1]);
    }
}
