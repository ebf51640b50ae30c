use rand::Rng;

/// Uniform integer in the closed interval `[min, max]`.
///
/// Bounds are already integral, so the usual ceil/floor adjustment of the
/// endpoints is the identity here. Reversed bounds are swapped rather than
/// panicking inside the sampler.
pub fn random_in_range(min: i64, max: i64) -> i64 {
    random_in_range_with(&mut rand::rng(), min, max)
}

pub fn random_in_range_with<R: Rng + ?Sized>(rng: &mut R, min: i64, max: i64) -> i64 {
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    if low == high {
        return low;
    }
    rng.random_range(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn stays_inside_inclusive_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for (min, max) in [(-10, 10), (0, 1), (-1_000_000_000, 1_000_000_000), (5, 6)] {
            for _ in 0..500 {
                let value = random_in_range_with(&mut rng, min, max);
                assert!((min..=max).contains(&value), "{value} outside [{min}, {max}]");
            }
        }
    }

    #[test]
    fn degenerate_range_returns_the_single_value() {
        for value in [-3, 0, 42, i64::MAX, i64::MIN] {
            assert_eq!(random_in_range(value, value), value);
        }
    }

    #[test]
    fn reaches_both_endpoints() {
        let mut rng = StdRng::seed_from_u64(11);
        let samples = (0..1_000)
            .map(|_| random_in_range_with(&mut rng, 0, 2))
            .collect::<Vec<_>>();
        assert!(samples.contains(&0));
        assert!(samples.contains(&1));
        assert!(samples.contains(&2));
    }

    #[test]
    fn handles_the_full_i64_span() {
        let value = random_in_range(i64::MIN, i64::MAX);
        assert!((i64::MIN..=i64::MAX).contains(&value));
    }

    #[test]
    fn reversed_bounds_are_tolerated() {
        let value = random_in_range(10, -10);
        assert!((-10..=10).contains(&value));
    }
}
