#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;

use relay_store::gc::{GarbageCollector, GcStep, Scheduler, TrackingMode};
use relay_store::query::{Field, RootQuery};
use relay_store::storage::{RecordState, StoreOptions, StoreView};
use relay_store::{DataId, Result, StoreData, StoreError};
use serde_json::{json, Value};

fn chain_query() -> RootQuery {
    RootQuery::new(
        "ChainQuery",
        Field::linked(
            "node",
            vec![
                Field::scalar("id").into(),
                Field::linked(
                    "field",
                    vec![
                        Field::scalar("id").into(),
                        Field::linked("field", vec![Field::scalar("id").into()]).into(),
                    ],
                )
                .into(),
            ],
        )
        .arg("id", json!("a")),
    )
    .identified_by("id")
}

fn chain_response() -> Value {
    json!({"node": {"id": "a", "field": {"id": "b", "field": {"id": "c"}}}})
}

fn manual_scheduler() -> (Rc<RefCell<Vec<GcStep>>>, Scheduler) {
    let steps = Rc::new(RefCell::new(Vec::new()));
    let sink = steps.clone();
    let scheduler: Scheduler = Box::new(move |step: GcStep| {
        sink.borrow_mut().push(step);
        Ok(())
    });
    (steps, scheduler)
}

fn gc(store: &StoreData) -> Result<&GarbageCollector> {
    store
        .garbage_collector()
        .ok_or_else(|| StoreError::NotFound("garbage collector".into()))
}

fn state(store: &StoreData, id: &str) -> RecordState {
    let id = DataId::from(id);
    store.record_store(|view: &StoreView<'_>| view.record_state(&id))
}

#[test]
fn subscribed_roots_protect_their_reachable_records() -> Result<()> {
    let mut store = StoreData::new(StoreOptions::new());
    store.initialize_garbage_collector(None)?;
    store.handle_query_payload(&chain_query(), &chain_response())?;
    let a = DataId::from("a");

    gc(&store)?.increase_subscriptions_for(&a);
    gc(&store)?.collect_from_node(&a, None)?;
    for id in ["a", "b", "c"] {
        assert_eq!(state(&store, id), RecordState::Existent, "{id} must survive");
    }

    gc(&store)?.decrease_subscriptions_for(&a)?;
    gc(&store)?.collect_from_node(&a, None)?;
    for id in ["a", "b", "c"] {
        assert_eq!(state(&store, id), RecordState::Unknown, "{id} must be collected");
        assert!(!gc(&store)?.is_registered(&DataId::from(id)));
    }
    assert!(!store.query_tracker().is_tracked(&a));
    Ok(())
}

#[test]
fn subscriptions_below_the_start_are_respected() -> Result<()> {
    let mut store = StoreData::new(StoreOptions::new());
    store.initialize_garbage_collector(None)?;
    store.handle_query_payload(&chain_query(), &chain_response())?;
    let b = DataId::from("b");

    gc(&store)?.increase_subscriptions_for(&b);
    gc(&store)?.collect_from_node(&DataId::from("a"), None)?;
    assert_eq!(state(&store, "a"), RecordState::Unknown);
    assert_eq!(state(&store, "b"), RecordState::Existent);
    assert_eq!(state(&store, "c"), RecordState::Existent);
    assert_eq!(gc(&store)?.is_collectible(&b), Some(false));
    Ok(())
}

#[test]
fn newer_sweeps_invalidate_older_ones() -> Result<()> {
    let (steps, scheduler) = manual_scheduler();
    let mut store = StoreData::new(StoreOptions::new());
    store.initialize_garbage_collector(Some(scheduler))?;
    store.handle_query_payload(&chain_query(), &chain_response())?;
    let collector = gc(&store)?;

    collector.schedule_collection(Some(1))?;
    collector.schedule_collection(Some(1))?;
    let (older, newer) = {
        let steps = steps.borrow();
        (steps[0].clone(), steps[1].clone())
    };
    assert_eq!(collector.tracking_mode(), TrackingMode::Direct);

    while older.run()? {}
    for id in ["a", "b", "c"] {
        assert_eq!(state(&store, id), RecordState::Existent);
        assert_eq!(collector.is_collectible(&DataId::from(id)), Some(true));
    }

    while newer.run()? {}
    for id in ["a", "b", "c"] {
        assert_eq!(state(&store, id), RecordState::Unknown);
    }
    assert_eq!(collector.tracking_mode(), TrackingMode::Buffered);
    Ok(())
}

#[test]
fn subscriptions_during_a_sweep_take_effect_immediately() -> Result<()> {
    let (steps, scheduler) = manual_scheduler();
    let mut store = StoreData::new(StoreOptions::new());
    store.initialize_garbage_collector(Some(scheduler))?;
    store.handle_query_payload(&chain_query(), &chain_response())?;
    let collector = gc(&store)?;
    let c = DataId::from("c");

    collector.schedule_collection(Some(1))?;
    let sweep = steps.borrow_mut().remove(0);
    assert!(sweep.run()?);
    assert_eq!(state(&store, "a"), RecordState::Unknown);
    assert_eq!(state(&store, "c"), RecordState::Existent);
    assert_eq!(collector.tracking_mode(), TrackingMode::Direct);

    collector.increase_subscriptions_for(&c);
    assert_eq!(collector.subscriptions(&c), 1);
    while sweep.run()? {}

    assert_eq!(state(&store, "b"), RecordState::Unknown);
    assert_eq!(state(&store, "c"), RecordState::Existent);
    assert_eq!(collector.is_collectible(&c), Some(false));
    Ok(())
}

#[test]
fn holds_pause_removal_until_released() -> Result<()> {
    let (steps, scheduler) = manual_scheduler();
    let mut store = StoreData::new(StoreOptions::new());
    store.initialize_garbage_collector(Some(scheduler))?;
    store.handle_query_payload(&chain_query(), &chain_response())?;
    let collector = gc(&store)?;
    let a = DataId::from("a");

    let hold = collector.acquire_hold();
    collector.collect_from_node(&a, None)?;
    let sweep = steps.borrow_mut().remove(0);
    while sweep.run()? {}
    assert_eq!(state(&store, "a"), RecordState::Existent);
    assert_eq!(collector.is_collectible(&a), Some(true));

    hold.release()?;
    assert!(matches!(hold.release(), Err(StoreError::Invariant(_))));
    assert_eq!(state(&store, "a"), RecordState::Existent);

    let drain = steps.borrow_mut().remove(0);
    assert!(!drain.run()?);
    for id in ["a", "b", "c"] {
        assert_eq!(state(&store, id), RecordState::Unknown);
    }
    Ok(())
}

#[test]
fn record_states_follow_puts_and_deletes() {
    let store = StoreData::default();
    let layers = store.layers();
    let id = DataId::from("9");
    assert_eq!(state(&store, "9"), RecordState::Unknown);
    layers
        .borrow_mut()
        .layer_mut(relay_store::storage::Layer::Committed)
        .put_record(&id, Some("User"), None);
    assert_eq!(state(&store, "9"), RecordState::Existent);
    layers
        .borrow_mut()
        .layer_mut(relay_store::storage::Layer::Committed)
        .delete_record(&id);
    assert_eq!(state(&store, "9"), RecordState::Nonexistent);
}
