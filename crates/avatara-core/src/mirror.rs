//! Ping-pong indexing over a finite cycle.
//!
//! Avatar identities are short video loops. Walking a loop forward and then
//! backward avoids the visible jump cut of wrapping from the last frame to the
//! first. The same mapping drives base frames, renderer inputs and custom
//! clip images.

/// Map a monotonically increasing counter onto `0..size`, forward on even
/// passes and backward on odd ones.
///
/// `size` must be non-zero.
pub fn mirror_index(size: usize, index: usize) -> usize {
    debug_assert!(size > 0, "mirror_index over an empty cycle");
    let turn = index / size;
    let rem = index % size;
    if turn % 2 == 0 { rem } else { size - rem - 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_then_backward() {
        let seq: Vec<usize> = (0..12).map(|i| mirror_index(4, i)).collect();
        assert_eq!(seq, vec![0, 1, 2, 3, 3, 2, 1, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn always_in_range() {
        for size in 1..20 {
            for i in 0..500 {
                assert!(mirror_index(size, i) < size, "size={size} i={i}");
            }
        }
    }

    #[test]
    fn second_pass_mirrors_first() {
        for size in 1..16 {
            for i in size..2 * size {
                assert_eq!(mirror_index(size, i), mirror_index(size, 2 * size - 1 - i));
            }
        }
    }

    #[test]
    fn no_jump_between_neighbours() {
        for size in 2..10 {
            for i in 0..200 {
                let a = mirror_index(size, i) as isize;
                let b = mirror_index(size, i + 1) as isize;
                assert!((a - b).abs() <= 1, "size={size} i={i}");
            }
        }
    }

    #[test]
    fn single_frame_cycle() {
        assert_eq!(mirror_index(1, 0), 0);
        assert_eq!(mirror_index(1, 1), 0);
        assert_eq!(mirror_index(1, 99), 0);
    }
}
