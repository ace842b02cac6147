#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;

use relay_store::cache::{CacheManager, FsCacheManager, MemoryCacheManager, ReadCallbacks, ReadState};
use relay_store::query::{Field, Fragment, RootQuery, Selector, Variables};
use relay_store::storage::{RecordState, StoreOptions, StoreView};
use relay_store::writer::ChangeSet;
use relay_store::{DataId, Result, StoreData, StoreError};
use serde_json::{json, Value};
use tempfile::tempdir;

#[derive(Debug, PartialEq)]
enum Outcome {
    Success(ChangeSet),
    Failure,
}

fn recorder() -> (Rc<RefCell<Vec<Outcome>>>, ReadCallbacks) {
    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let ok = outcomes.clone();
    let failed = outcomes.clone();
    let callbacks = ReadCallbacks::new(
        move |changes| ok.borrow_mut().push(Outcome::Success(changes)),
        move || failed.borrow_mut().push(Outcome::Failure),
    );
    (outcomes, callbacks)
}

fn user_selections() -> Vec<relay_store::query::Selection> {
    vec![
        Field::scalar("id").into(),
        Field::scalar("name").into(),
        Field::linked("address", vec![Field::scalar("city").into()]).into(),
    ]
}

fn user_query(name: &str) -> RootQuery {
    RootQuery::new(
        name,
        Field::linked("node", user_selections()).arg("id", json!("4")),
    )
    .identified_by("id")
}

fn user_response() -> Value {
    json!({"node": {"id": "4", "name": "Zuck", "address": {"city": "Menlo Park"}}})
}

#[test]
fn committed_data_survives_a_restart_through_files() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut store = StoreData::default();
        store.inject_cache_manager(Rc::new(FsCacheManager::open(dir.path())?));
        store.handle_query_payload(&user_query("UserQuery"), &user_response())?;
    }

    let mut store = StoreData::new(StoreOptions::new());
    store.initialize_garbage_collector(None)?;
    store.inject_cache_manager(Rc::new(FsCacheManager::open(dir.path())?));
    let (outcomes, callbacks) = recorder();
    let reader = store.read_from_disk(vec![user_query("UserQuery")], callbacks)?;
    assert_eq!(reader.state(), ReadState::Completed);

    let outcomes = outcomes.borrow();
    let Some(Outcome::Success(changes)) = outcomes.first() else {
        return Err(StoreError::NotFound(format!("successful read, got {outcomes:?}")));
    };
    assert_eq!(changes.created.len(), 2);
    assert!(changes.updated.is_empty());
    let gc = store
        .garbage_collector()
        .ok_or_else(|| StoreError::NotFound("garbage collector".into()))?;
    assert!(changes.created.iter().all(|id| gc.is_registered(id)));

    let fragment = Rc::new(Fragment::new("UserFragment", user_selections()));
    let selector = Selector::new(DataId::from("4"), fragment, Variables::new());
    assert_eq!(
        store.read(&selector)?,
        Some(json!({"id": "4", "name": "Zuck", "address": {"city": "Menlo Park"}}))
    );
    Ok(())
}

#[test]
fn shared_root_calls_are_read_once() -> Result<()> {
    let cache = Rc::new(MemoryCacheManager::deferred());
    {
        let mut store = StoreData::default();
        store.inject_cache_manager(cache.clone());
        store.handle_query_payload(&user_query("UserQuery"), &user_response())?;
    }

    let mut store = StoreData::default();
    store.inject_cache_manager(cache.clone());
    let (outcomes, callbacks) = recorder();
    let reader = store.read_from_disk(
        vec![user_query("UserQuery"), user_query("OtherUserQuery")],
        callbacks,
    )?;
    assert_eq!(reader.state(), ReadState::Loading);
    assert_eq!(cache.root_call_reads(), 1);

    cache.run_pending();
    assert_eq!(cache.root_call_reads(), 1);
    assert_eq!(reader.state(), ReadState::Completed);
    assert!(matches!(outcomes.borrow().as_slice(), [Outcome::Success(_)]));
    let state = store.record_store(|view: &StoreView<'_>| view.record_state(&DataId::from("4")));
    assert_eq!(state, RecordState::Existent);
    Ok(())
}

#[test]
fn incomplete_cache_fails_the_whole_read() -> Result<()> {
    let cache = Rc::new(MemoryCacheManager::new());
    cache.write_root_call("node", "4", Some(&DataId::from("4")))?;
    let mut record = relay_store::storage::Record::new(DataId::from("4"), Some("User".into()));
    record.set_field("id", relay_store::storage::FieldValue::Scalar(json!("4")));

    cache.write_node(&DataId::from("4"), Some(&record))?;

    let mut store = StoreData::default();
    store.inject_cache_manager(cache);
    let (outcomes, callbacks) = recorder();
    store.read_from_disk(vec![user_query("UserQuery")], callbacks)?;
    assert_eq!(*outcomes.borrow(), vec![Outcome::Failure]);
    Ok(())
}

#[test]
fn aborted_reads_ignore_late_answers() -> Result<()> {
    let cache = Rc::new(MemoryCacheManager::deferred());
    cache.write_root_call("node", "4", None)?;
    let mut store = StoreData::default();
    store.inject_cache_manager(cache.clone());
    let (outcomes, callbacks) = recorder();
    let reader = store.read_from_disk(vec![user_query("UserQuery")], callbacks)?;
    reader.abort()?;
    assert!(matches!(reader.abort(), Err(StoreError::Invariant(_))));
    cache.run_pending();
    assert!(outcomes.borrow().is_empty());
    Ok(())
}
