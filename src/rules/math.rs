// Exact-decimal quantization helpers for exchange filters

use rust_decimal::Decimal;

/// Clamp `quantity` into `[min, max]`, then round down onto the step grid anchored at `min`.
///
/// A zero `max` means no upper bound and a zero `step` means no grid.
pub fn clamp_quantity(min: Decimal, max: Decimal, step: Decimal, quantity: Decimal) -> Decimal {
    let mut clamped = quantity;
    if !max.is_zero() {
        clamped = clamped.min(max);
    }
    clamped = clamped.max(min);

    if step.is_zero() {
        return clamped.normalize();
    }

    let remainder = (clamped - min) % step;
    (clamped - remainder).normalize()
}

/// Clamp `price` into `[min, max]`
pub fn clamp_price(min: Decimal, max: Decimal, price: Decimal) -> Decimal {
    price.min(max).max(min).normalize()
}

/// Round `price` down to a multiple of `tick`. A zero tick leaves the price alone.
pub fn floor_to_tick(tick: Decimal, price: Decimal) -> Decimal {
    if tick.is_zero() {
        return price.normalize();
    }
    (price - price % tick).normalize()
}

/// Smallest value `>= target` on the grid `base + k * step` (k >= 0)
pub fn ceil_to_step(base: Decimal, step: Decimal, target: Decimal) -> Decimal {
    if target <= base {
        return base.normalize();
    }
    if step.is_zero() {
        return target.normalize();
    }

    let remainder = (target - base) % step;
    if remainder.is_zero() {
        target.normalize()
    } else {
        (target - remainder + step).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_clamp_quantity_rounds_down_to_step() {
        assert_eq!(clamp_quantity(dec!(0.001), dec!(100), dec!(0.001), dec!(0.12345)), dec!(0.123));
    }

    #[test]
    fn test_clamp_quantity_bounds() {
        assert_eq!(clamp_quantity(dec!(0.001), dec!(100), dec!(0.001), dec!(150)), dec!(100));
        assert_eq!(clamp_quantity(dec!(0.001), dec!(100), dec!(0.001), dec!(0.0001)), dec!(0.001));
    }

    #[test]
    fn test_clamp_quantity_grid_anchored_at_min() {
        // grid is 0.5, 1.5, 2.5, ...
        assert_eq!(clamp_quantity(dec!(0.5), dec!(10), dec!(1), dec!(2.2)), dec!(1.5));
    }

    #[test]
    fn test_clamp_quantity_zero_max_is_unbounded() {
        assert_eq!(clamp_quantity(dec!(1), dec!(0), dec!(1), dec!(1000000.7)), dec!(1000000));
    }

    #[test]
    fn test_floor_to_tick() {
        assert_eq!(floor_to_tick(dec!(0.01), dec!(101.2378)), dec!(101.23));
        assert_eq!(floor_to_tick(dec!(0.01), dec!(101.23)), dec!(101.23));
        assert_eq!(floor_to_tick(dec!(0), dec!(101.2378)), dec!(101.2378));
    }

    #[test]
    fn test_clamp_price() {
        assert_eq!(clamp_price(dec!(1), dec!(100), dec!(150)), dec!(100));
        assert_eq!(clamp_price(dec!(1), dec!(100), dec!(0.5)), dec!(1));
        assert_eq!(clamp_price(dec!(1), dec!(100), dec!(42)), dec!(42));
    }

    #[test]
    fn test_ceil_to_step() {
        assert_eq!(ceil_to_step(dec!(0.01), dec!(0.01), dec!(5)), dec!(5.00));
        assert_eq!(ceil_to_step(dec!(0), dec!(0.01), dec!(3.333333)), dec!(3.34));
        assert_eq!(ceil_to_step(dec!(1), dec!(0.5), dec!(0.2)), dec!(1));
    }

    fn decimal(units: u64, scale: u32) -> Decimal {
        Decimal::new(units as i64, scale)
    }

    proptest! {
        #[test]
        fn prop_clamp_quantity_is_idempotent(
            q in 0u64..10_000_000,
            min in 1u64..1_000,
            span in 0u64..5_000_000,
            step in 1u64..10_000,
        ) {
            let min = decimal(min, 4);
            let max = min + decimal(span, 4);
            let step = decimal(step, 4);
            let q = decimal(q, 5);

            let once = clamp_quantity(min, max, step, q);
            let twice = clamp_quantity(min, max, step, once);
            prop_assert_eq!(once, twice);
            prop_assert!(once >= min);
            prop_assert!(once <= max);
        }

        #[test]
        fn prop_floor_to_tick_is_aligned_and_monotonic(
            a in 0u64..10_000_000,
            b in 0u64..10_000_000,
            tick in 1u64..10_000,
        ) {
            let tick = decimal(tick, 4);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo = decimal(lo, 5);
            let hi = decimal(hi, 5);

            let floor_lo = floor_to_tick(tick, lo);
            let floor_hi = floor_to_tick(tick, hi);
            prop_assert!(floor_lo <= floor_hi);
            prop_assert!(floor_lo <= lo);
            prop_assert!((floor_hi % tick).is_zero());
            prop_assert!(hi - floor_hi < tick);
        }
    }
}
