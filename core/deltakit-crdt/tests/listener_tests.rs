//! Listener dispatch semantics on the public CRDT surface.

use deltakit_crdt::{Counter, Crdt, CrdtError, LwwRegister, Payload, StateUpdate, Value};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn listeners_see_every_applied_update() {
    let seen: Rc<RefCell<Vec<StateUpdate<u64>>>> = Rc::new(RefCell::new(Vec::new()));
    let mut counter = Counter::new();

    let sink = Rc::clone(&seen);
    counter.add_listener(Box::new(move |update| {
        sink.borrow_mut().push(update.clone());
        Ok(())
    }));

    let first = counter.increase(1).unwrap();
    let second = counter.increase(2).unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], first);
    assert_eq!(seen[1], second);
}

#[test]
fn a_failing_listener_aborts_the_apply() {
    let mut counter = Counter::new();
    counter.increase(3).unwrap();
    let before = counter.pack();

    let id = counter.add_listener(Box::new(|_| Err(CrdtError::Usage("veto".into()))));

    let err = counter.increase(4).unwrap_err();
    assert!(matches!(err, CrdtError::Usage(_)));
    assert_eq!(counter.read(), 3, "vetoed update must not mutate state");
    assert_eq!(counter.pack(), before);

    // After removing the veto, updates flow again.
    assert!(counter.remove_listener(id));
    counter.increase(4).unwrap();
    assert_eq!(counter.read(), 7);
}

#[test]
fn listeners_run_after_validation() {
    let fired = Rc::new(RefCell::new(0));
    let mut counter = Counter::new();

    let sink = Rc::clone(&fired);
    counter.add_listener(Box::new(move |_| {
        *sink.borrow_mut() += 1;
        Ok(())
    }));

    // An invalid payload fails validation, so no listener fires.
    let invalid = StateUpdate::new(counter.clock_uuid().to_vec(), 1u64, Payload::Counter {
        amount: -1,
    });
    assert!(counter.update(&invalid).is_err());
    assert_eq!(*fired.borrow(), 0);

    // A foreign clock uuid is rejected before dispatch too.
    let foreign = StateUpdate::new(b"foreign".to_vec(), 1u64, Payload::Counter { amount: 1 });
    assert!(counter.update(&foreign).is_err());
    assert_eq!(*fired.borrow(), 0);

    counter.increase(1).unwrap();
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn listeners_are_not_carried_by_pack_or_clone() {
    let mut reg = LwwRegister::new(Value::str("r"));
    reg.add_listener(Box::new(|_| Ok(())));
    assert_eq!(reg.listeners().len(), 1);

    let restored = LwwRegister::<deltakit_crdt::ScalarClock>::unpack(&reg.pack()).unwrap();
    assert!(restored.listeners().is_empty());

    let cloned = reg.clone();
    assert!(cloned.listeners().is_empty());
}
