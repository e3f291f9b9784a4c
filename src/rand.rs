use std::cell::RefCell;

use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};

thread_local! {
    /// A thread-local random number generator that is insecure but fast.
    static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Access a pre-initialized random number generator that is insecure but fast.
pub fn with_rng<F, R>(f: F) -> R
where
    F: FnOnce(&mut SmallRng) -> R,
{
    SMALL_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        f(&mut rng)
    })
}

/// Uniform pick in `0..bound`.
///
/// `bound` must be non-zero.
pub fn below(bound: usize) -> usize {
    with_rng(|rng| rng.gen_range(0..bound))
}

/// Uniform pick in `low..high`.
pub fn range(low: u32, high: u32) -> u32 {
    with_rng(|rng| rng.gen_range(low..high))
}

/// Shuffle a slice in place.
pub fn shuffle<T>(items: &mut [T]) {
    with_rng(|rng| items.shuffle(rng));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_stays_in_bounds() {
        for _ in 0..1000 {
            assert!(below(7) < 7);
        }
    }

    #[test]
    fn shuffle_keeps_elements() {
        let mut items = vec![1, 2, 3, 4, 5];
        shuffle(&mut items);
        items.sort_unstable();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }
}
