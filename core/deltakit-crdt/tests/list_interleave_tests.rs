//! Cross-replica interleaving scenarios for the ordered-list CRDTs.

use deltakit_crdt::{
    CausalTree, Crdt, FiArray, ListCrdt, Packable, RgArray, ScalarClock, StateUpdate, Value,
};

#[test]
fn fi_array_concurrent_neighbors_converge() {
    // One replica seeds "first" and "last", then two replicas concurrently
    // insert after and before "last".
    let mut r1 = FiArray::new();
    r1.put_first(Value::str("first"), Value::Int(1)).unwrap();
    r1.put_last(Value::str("last"), Value::Int(1)).unwrap();

    let mut r2 = FiArray::<ScalarClock>::unpack(&r1.pack()).unwrap();
    let last_on_r1 = r1.read_full()[1].clone();
    let last_on_r2 = r2.read_full()[1].clone();

    let insert_a = r1
        .put_after(Value::str("A"), Value::Int(1), &last_on_r1)
        .unwrap();
    let insert_b = r2
        .put_before(Value::str("B"), Value::Int(2), &last_on_r2)
        .unwrap();

    r1.update(&insert_b).unwrap();
    r2.update(&insert_a).unwrap();

    let expected = vec![
        Value::str("first"),
        Value::str("B"),
        Value::str("last"),
        Value::str("A"),
    ];
    assert_eq!(r1.read(), expected);
    assert_eq!(r2.read(), expected);
    assert_eq!(r1.checksums(None, None), r2.checksums(None, None));
}

#[test]
fn fi_array_same_slot_inserts_converge_both_ways() {
    let mut r1 = FiArray::new();
    r1.put_first(Value::str("a"), Value::Int(1)).unwrap();
    r1.put_last(Value::str("z"), Value::Int(1)).unwrap();

    let mut r2 = FiArray::<ScalarClock>::unpack(&r1.pack()).unwrap();
    let (a1, z1) = {
        let items = r1.read_full();
        (items[0].clone(), items[1].clone())
    };
    let (a2, z2) = {
        let items = r2.read_full();
        (items[0].clone(), items[1].clone())
    };

    // Both replicas target the same logical slot between "a" and "z"; the
    // random offset makes the indices almost surely distinct, and the LWW
    // map makes both visible either way.
    let m1 = r1
        .put_between(Value::str("m1"), Value::Int(1), &a1, &z1)
        .unwrap();
    let m2 = r2
        .put_between(Value::str("m2"), Value::Int(2), &a2, &z2)
        .unwrap();

    r1.update(&m2).unwrap();
    r2.update(&m1).unwrap();

    assert_eq!(r1.read(), r2.read());
    assert_eq!(r1.read().len(), 4);
    assert_eq!(r1.read()[0], Value::str("a"));
    assert_eq!(r1.read()[3], Value::str("z"));
}

#[test]
fn rga_mixed_appends_and_removes_converge() {
    let uuid = b"rga-list".to_vec();
    let mut a = RgArray::with_clock(ScalarClock::with_uuid(uuid.clone()).unwrap());
    let mut b = RgArray::with_clock(ScalarClock::with_uuid(uuid).unwrap());

    let appends_a = a
        .list_append(Value::str("left"), Value::Int(1))
        .unwrap();
    let appends_b = b
        .list_append(Value::str("right"), Value::Int(2))
        .unwrap();

    for update in &appends_b {
        a.update(update).unwrap();
    }
    for update in &appends_a {
        b.update(update).unwrap();
    }
    assert_eq!(a.read(), b.read());

    // A removes its own entry; the removal replicates.
    let position = a.position_of(&Value::str("left")).unwrap();
    let removal = a.list_remove(position, Value::Int(1)).unwrap();
    b.update(&removal).unwrap();

    assert_eq!(a.read(), vec![Value::str("right")]);
    assert_eq!(a.read(), b.read());
}

#[test]
fn causal_tree_survives_interleaved_merkle_sync() {
    let mut a = CausalTree::new();
    a.append(Value::str("intro"), Value::Int(1)).unwrap();
    a.append(Value::str("body"), Value::Int(1)).unwrap();

    let mut b = CausalTree::<ScalarClock>::unpack(&a.pack()).unwrap();

    // a edits the tail while b deletes the head.
    a.append(Value::str("outro"), Value::Int(1)).unwrap();
    b.remove(0, Value::Int(2)).unwrap();

    for _ in 0..2 {
        let merkle_a = a.get_merkle_history();
        let merkle_b = b.get_merkle_history();
        for leaf in a
            .resolve_merkle_histories(&merkle_b.root, &merkle_b.leaf_ids)
            .unwrap()
        {
            let packed = merkle_b.leaf(&leaf).unwrap();
            a.update(&StateUpdate::<u64>::unpack(packed).unwrap()).unwrap();
        }
        for leaf in b
            .resolve_merkle_histories(&merkle_a.root, &merkle_a.leaf_ids)
            .unwrap()
        {
            let packed = merkle_a.leaf(&leaf).unwrap();
            b.update(&StateUpdate::<u64>::unpack(packed).unwrap()).unwrap();
        }
    }

    assert_eq!(a.read(), vec![Value::str("body"), Value::str("outro")]);
    assert_eq!(a.read(), b.read());
    assert_eq!(a.get_merkle_history().root, b.get_merkle_history().root);
}

#[test]
fn list_surface_is_uniform_across_implementations() {
    fn exercise<L: ListCrdt + Crdt<View = Vec<Value>>>(list: &mut L) {
        list.list_append(Value::str("one"), Value::Int(1)).unwrap();
        list.list_append(Value::str("two"), Value::Int(1)).unwrap();
        assert_eq!(list.position_of(&Value::str("two")).unwrap(), 1);
        list.list_remove(0, Value::Int(1)).unwrap();
        assert_eq!(list.read(), vec![Value::str("two")]);
    }

    exercise(&mut RgArray::new());
    exercise(&mut FiArray::new());
    exercise(&mut CausalTree::new());
}
