//! Property-based tests for the delta-CRDT laws.
//!
//! Every CRDT must satisfy:
//! - Idempotence: applying a delta twice equals applying it once
//! - Commutativity/associativity: any application order of the same delta
//!   set yields the same observable state
//! - Round-trip: `unpack(pack(c))` preserves the canonical bytes
//! - History replay: a fresh replica fed `history()` reads and checksums
//!   identically
//! - Clock-uuid rejection: foreign deltas are refused without mutation

use deltakit_crdt::{
    Counter, Crdt, CrdtError, LwwRegister, OrSet, Payload, PnCounter, RgArray, ScalarClock,
    StateUpdate, Value,
};
use proptest::prelude::*;

fn shared_clock(uuid: &[u8]) -> ScalarClock {
    ScalarClock::with_uuid(uuid.to_vec()).expect("non-empty uuid")
}

fn amounts_with_shuffle() -> impl Strategy<Value = (Vec<i64>, Vec<usize>)> {
    proptest::collection::vec(1i64..100, 1..8).prop_flat_map(|amounts| {
        let indices: Vec<usize> = (0..amounts.len()).collect();
        (Just(amounts), Just(indices).prop_shuffle())
    })
}

fn set_ops_with_shuffle() -> impl Strategy<Value = (Vec<(bool, i64)>, Vec<usize>)> {
    proptest::collection::vec((any::<bool>(), 0i64..20), 1..12).prop_flat_map(|ops| {
        let indices: Vec<usize> = (0..ops.len()).collect();
        (Just(ops), Just(indices).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn counter_application_order_is_irrelevant((amounts, order) in amounts_with_shuffle()) {
        let mut source = Counter::new();
        let updates: Vec<StateUpdate<u64>> = amounts
            .iter()
            .map(|amount| source.increase(*amount).expect("positive amount"))
            .collect();

        let mut replica = Counter::with_clock(shared_clock(source.clock_uuid()));
        for index in &order {
            replica.update(&updates[*index]).expect("same-instance delta");
        }

        prop_assert_eq!(replica.read(), source.read());
        prop_assert_eq!(replica.pack(), source.pack());
        prop_assert_eq!(
            replica.get_merkle_history().root,
            source.get_merkle_history().root
        );
    }

    #[test]
    fn counter_updates_are_idempotent(amounts in proptest::collection::vec(1i64..100, 1..8)) {
        let mut source = Counter::new();
        let updates: Vec<StateUpdate<u64>> = amounts
            .iter()
            .map(|amount| source.increase(*amount).expect("positive amount"))
            .collect();

        let mut replica = Counter::with_clock(shared_clock(source.clock_uuid()));
        for update in &updates {
            replica.update(update).expect("same-instance delta");
            replica.update(update).expect("duplicate application");
        }
        prop_assert_eq!(replica.read(), source.read());
    }

    #[test]
    fn counter_history_replays_exactly(amounts in proptest::collection::vec(1i64..100, 1..8)) {
        let mut source = Counter::new();
        for amount in &amounts {
            source.increase(*amount).expect("positive amount");
        }

        let mut replica = Counter::with_clock(shared_clock(source.clock_uuid()));
        for update in source.history(None, None) {
            replica.update(&update).expect("replayed delta");
        }
        prop_assert_eq!(replica.read(), source.read());
        prop_assert_eq!(replica.checksums(None, None), source.checksums(None, None));
    }

    #[test]
    fn orset_application_order_is_irrelevant((ops, order) in set_ops_with_shuffle()) {
        let mut source = OrSet::new();
        let updates: Vec<StateUpdate<u64>> = ops
            .iter()
            .map(|(observe, member)| {
                if *observe {
                    source.observe(Value::Int(*member)).expect("observe")
                } else {
                    source.remove(Value::Int(*member)).expect("remove")
                }
            })
            .collect();

        let mut replica = OrSet::with_clock(shared_clock(source.clock_uuid()));
        for index in &order {
            replica.update(&updates[*index]).expect("same-instance delta");
        }
        prop_assert_eq!(replica.read(), source.read());
        prop_assert_eq!(replica.checksums(None, None), source.checksums(None, None));
    }

    #[test]
    fn orset_round_trip_preserves_canonical_bytes(ops in proptest::collection::vec((any::<bool>(), 0i64..20), 1..12)) {
        let mut source = OrSet::new();
        for (observe, member) in &ops {
            if *observe {
                source.observe(Value::Int(*member)).expect("observe");
            } else {
                source.remove(Value::Int(*member)).expect("remove");
            }
        }
        let restored = OrSet::<ScalarClock>::unpack(&source.pack()).expect("canonical bytes");
        prop_assert_eq!(restored.pack(), source.pack());
    }

    #[test]
    fn lww_register_merge_is_commutative(
        value_a in "[a-z]{1,10}",
        value_b in "[a-z]{1,10}",
        writer_a in 0i64..50,
        writer_b in 0i64..50,
    ) {
        let uuid = b"prop-lww".to_vec();
        let mut a = LwwRegister::with_clock(Value::str("r"), shared_clock(&uuid));
        let mut b = LwwRegister::with_clock(Value::str("r"), shared_clock(&uuid));

        let wa = a.write(Value::str(value_a), Value::Int(writer_a)).expect("write");
        let wb = b.write(Value::str(value_b), Value::Int(writer_b)).expect("write");

        a.update(&wb).expect("merge");
        b.update(&wa).expect("merge");
        prop_assert_eq!(a.read(), b.read());
    }

    #[test]
    fn rga_replicas_converge_under_any_exchange_order(
        left in proptest::collection::vec("[a-z]{1,4}", 0..5),
        right in proptest::collection::vec("[a-z]{1,4}", 0..5),
    ) {
        let uuid = b"prop-rga".to_vec();
        let mut a = RgArray::with_clock(shared_clock(&uuid));
        let mut b = RgArray::with_clock(shared_clock(&uuid));

        let from_a: Vec<StateUpdate<u64>> = left
            .iter()
            .map(|item| a.append(Value::str(item.clone()), Value::Int(1)).expect("append"))
            .collect();
        let from_b: Vec<StateUpdate<u64>> = right
            .iter()
            .map(|item| b.append(Value::str(item.clone()), Value::Int(2)).expect("append"))
            .collect();

        for update in from_b.iter() {
            a.update(update).expect("cross-apply");
        }
        for update in from_a.iter().rev() {
            b.update(update).expect("cross-apply reversed");
        }

        prop_assert_eq!(a.read(), b.read());
        prop_assert_eq!(a.checksums(None, None), b.checksums(None, None));
    }

    #[test]
    fn pn_counter_history_replay_matches(
        ops in proptest::collection::vec((any::<bool>(), 1i64..50), 1..10),
    ) {
        let mut source = PnCounter::new();
        for (increase, amount) in &ops {
            if *increase {
                source.increase(*amount).expect("increase");
            } else {
                source.decrease(*amount).expect("decrease");
            }
        }

        let mut replica = PnCounter::with_clock(shared_clock(source.clock_uuid()));
        for update in source.history(None, None) {
            replica.update(&update).expect("replayed delta");
        }
        prop_assert_eq!(replica.read(), source.read());
        prop_assert_eq!(replica.checksums(None, None), source.checksums(None, None));
    }

    #[test]
    fn foreign_uuid_never_mutates(amount in 1i64..100) {
        let mut counter = Counter::new();
        counter.increase(amount).expect("increase");
        let before = counter.pack();

        let foreign = StateUpdate::new(b"someone-else".to_vec(), 1u64, Payload::Counter { amount });
        let err = counter.update(&foreign).expect_err("foreign uuid");
        prop_assert!(matches!(err, CrdtError::Mismatch { .. }), "expected CrdtError::Mismatch");
        prop_assert_eq!(counter.pack(), before);
    }
}
