//! Property-based tests for the effect algebra.
//!
//! Uses proptest to generate random inputs and verify the algebraic laws
//! hold: identities, map fusion transparency, left-zero of raised errors,
//! bind associativity, and stack safety at arbitrary depths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use riptide::{Effect, Failure};

proptest! {
    /// Running a pure value yields the value.
    #[test]
    fn pure_identity(a in any::<i64>()) {
        prop_assert_eq!(Effect::pure(a).run_sync().unwrap(), a);
    }

    /// Mapping over a pure value applies the function.
    #[test]
    fn map_over_pure(a in any::<i64>(), addend in any::<i64>()) {
        let mapped = Effect::pure(a).map(move |x| x.wrapping_add(addend)).run_sync().unwrap();
        prop_assert_eq!(mapped, a.wrapping_add(addend));
    }

    /// Two fused maps and their composed function are observationally equal.
    #[test]
    fn map_fusion_transparency(a in any::<i64>(), x in any::<i64>(), y in any::<i64>()) {
        let fused = Effect::pure(a)
            .map(move |v| v.wrapping_add(x))
            .map(move |v| v.wrapping_mul(y))
            .run_sync()
            .unwrap();
        let composed = Effect::pure(a)
            .map(move |v| v.wrapping_add(x).wrapping_mul(y))
            .run_sync()
            .unwrap();
        prop_assert_eq!(fused, composed);
    }

    /// Fusion stays transparent past the fusion depth limit.
    #[test]
    fn long_map_chains_match_arithmetic(a in any::<i32>(), depth in 1usize..600) {
        let mut eff = Effect::pure(i64::from(a));
        for _ in 0..depth {
            eff = eff.map(|v| v.wrapping_add(1));
        }
        prop_assert_eq!(eff.run_sync().unwrap(), i64::from(a).wrapping_add(depth as i64));
    }

    /// A raised error short-circuits flat_map without invoking it.
    #[test]
    fn left_zero(message in "[a-z]{1,12}") {
        let touched = Arc::new(AtomicBool::new(false));
        let t = touched.clone();
        let eff: Effect<i64> = Effect::raise_error(Failure::msg(message.clone()))
            .flat_map(move |x: i64| {
                t.store(true, Ordering::SeqCst);
                Effect::pure(x)
            });
        let err = eff.run_sync().unwrap_err();
        prop_assert_eq!(err.to_string(), message);
        prop_assert!(!touched.load(Ordering::SeqCst));
    }

    /// flat_map is associative.
    #[test]
    fn bind_associativity(a in any::<i64>(), x in any::<i64>(), y in any::<i64>()) {
        let nested = Effect::pure(a)
            .flat_map(move |v| Effect::pure(v.wrapping_add(x)))
            .flat_map(move |v| Effect::pure(v.wrapping_mul(y)))
            .run_sync()
            .unwrap();
        let flattened = Effect::pure(a)
            .flat_map(move |v| {
                Effect::pure(v.wrapping_add(x)).flat_map(move |w| Effect::pure(w.wrapping_mul(y)))
            })
            .run_sync()
            .unwrap();
        prop_assert_eq!(nested, flattened);
    }

    /// attempt reifies both arms without losing information.
    #[test]
    fn attempt_reifies(a in any::<i64>(), fail in any::<bool>(), message in "[a-z]{1,12}") {
        let eff: Effect<i64> = if fail {
            Effect::raise_error(Failure::msg(message.clone()))
        } else {
            Effect::pure(a)
        };
        match eff.attempt().run_sync().unwrap() {
            Ok(value) => {
                prop_assert!(!fail);
                prop_assert_eq!(value, a);
            }
            Err(failure) => {
                prop_assert!(fail);
                prop_assert_eq!(failure.to_string(), message);
            }
        }
    }

    /// Recovery applies the handler only on the error arm.
    #[test]
    fn handle_error_recovers(a in any::<i64>(), fallback in any::<i64>(), fail in any::<bool>()) {
        let eff: Effect<i64> = if fail {
            Effect::raise_error(Failure::msg("boom"))
        } else {
            Effect::pure(a)
        };
        let recovered = eff.handle_error_with(move |_| Effect::pure(fallback)).run_sync().unwrap();
        prop_assert_eq!(recovered, if fail { fallback } else { a });
    }

    /// Bind chains of arbitrary depth complete with the expected value.
    #[test]
    fn stack_safety_scaled(depth in 1_000u64..5_000) {
        let mut eff = Effect::pure(0u64);
        for _ in 0..depth {
            eff = eff.flat_map(|x| Effect::pure(x + 1));
        }
        prop_assert_eq!(eff.run_sync().unwrap(), depth);
    }
}
