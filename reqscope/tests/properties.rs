//! Property-based checks of the dedup ledger and threshold classification.

use std::collections::HashSet;
use std::time::Duration;

use proptest::prelude::*;
use reqscope::dedup::{DedupPolicy, OperationLedger};
use reqscope::PerformanceThresholds;

fn arb_key() -> impl Strategy<Value = String> {
    "(api|service|domain|external)\\.(boundary|operation)\\.[a-z_]{1,12}"
}

fn arb_layer() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("api"),
        Just("service"),
        Just("domain"),
        Just("external"),
        Just("batch"),
    ]
}

proptest! {
    #[test]
    fn strict_marking_is_idempotent(keys in prop::collection::vec(arb_key(), 1..200)) {
        let ledger = OperationLedger::new(1000);
        let mut seen = HashSet::new();
        for key in &keys {
            let first = seen.insert(key.clone());
            prop_assert_eq!(ledger.try_mark(key, DedupPolicy::Strict), first);
        }
        prop_assert_eq!(ledger.len(), seen.len());
    }

    #[test]
    fn ledger_never_exceeds_capacity(
        capacity in 10_usize..200,
        count in 1_usize..2000,
    ) {
        let ledger = OperationLedger::new(capacity);
        for i in 0..count {
            let key = format!("service.operation.op_{i}");
            prop_assert!(ledger.try_mark(&key, DedupPolicy::Strict));
            prop_assert!(ledger.len() <= capacity);
        }
        prop_assert_eq!(ledger.len() + ledger.evicted(), count);
    }

    #[test]
    fn disabled_policy_always_emits(key in arb_key(), repeats in 1_usize..50) {
        let ledger = OperationLedger::new(100);
        for _ in 0..repeats {
            prop_assert!(ledger.try_mark(&key, DedupPolicy::Disabled));
        }
    }

    #[test]
    fn count_policy_emits_exactly_limit(key in arb_key(), limit in 1_u32..20, attempts in 1_u32..60) {
        let ledger = OperationLedger::new(100);
        let emitted = (0..attempts)
            .filter(|_| ledger.try_mark(&key, DedupPolicy::CountBased(limit)))
            .count();
        prop_assert_eq!(emitted, attempts.min(limit) as usize);
    }

    #[test]
    fn violation_iff_strictly_over_budget(layer in arb_layer(), millis in 0_u64..10_000) {
        let thresholds = PerformanceThresholds::default();
        let duration = Duration::from_millis(millis);
        let check = thresholds.check(layer, duration);
        prop_assert_eq!(check.threshold, thresholds.threshold_for(layer));
        prop_assert_eq!(check.exceeds_threshold, duration > check.threshold);
    }
}
