#![allow(missing_docs)]

use proptest::prelude::*;
use relay_store::query::{read, Field, RootQuery};
use relay_store::storage::{Layer, StoreLayers};
use relay_store::types::ClientIdGenerator;
use relay_store::writer::{ChangeSet, PayloadWriter};
use relay_store::{DataId, Result};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
struct Friend {
    has_id: bool,
    name: String,
}

fn profile_query() -> RootQuery {
    RootQuery::new(
        "ProfileQuery",
        Field::linked(
            "node",
            vec![
                Field::scalar("id").into(),
                Field::scalar("name").into(),
                Field::scalar("age").into(),
                Field::plural(
                    "friends",
                    vec![Field::scalar("id").into(), Field::scalar("name").into()],
                )
                .arg("first", json!(10))
                .into(),
            ],
        )
        .arg("id", json!("4")),
    )
    .identified_by("id")
}

fn profile(name: &str, age: Option<i32>, friends: &[Friend]) -> Value {
    let friends: Vec<Value> = friends
        .iter()
        .enumerate()
        .map(|(index, friend)| {
            let mut object = Map::new();
            if friend.has_id {
                object.insert("id".into(), json!(format!("f{index}")));
            }
            object.insert("name".into(), json!(friend.name));
            Value::Object(object)
        })
        .collect();
    json!({"id": "4", "name": name, "age": age, "friends": friends})
}

fn arb_friend() -> impl Strategy<Value = Friend> {
    (any::<bool>(), "[a-zA-Z ]{0,12}").prop_map(|(has_id, name)| Friend { has_id, name })
}

fn write(layers: &mut StoreLayers, ids: &ClientIdGenerator, target: Layer, node: &Value) -> Result<ChangeSet> {
    let mut writer = PayloadWriter::new(layers, target, ids)?;
    writer.write_query_payload(&profile_query(), &json!({ "node": node }))?;
    Ok(writer.into_changes())
}

proptest! {
    #[test]
    fn prop_written_payloads_read_back_unchanged(
        name in "[a-zA-Z ]{0,12}",
        age in prop::option::of(any::<i32>()),
        friends in prop::collection::vec(arb_friend(), 0..6),
    ) {
        let mut layers = StoreLayers::new();
        let ids = ClientIdGenerator::new();
        let node = profile(&name, age, &friends);
        write(&mut layers, &ids, Layer::Committed, &node).unwrap();

        let query = profile_query();
        let read_back = read(&layers.view(), &DataId::from("4"), &query.field.selections, &query.variables).unwrap();
        prop_assert_eq!(read_back, Some(node));
    }

    #[test]
    fn prop_repeated_writes_are_no_ops_except_when_optimistic(
        name in "[a-zA-Z ]{0,12}",
        age in prop::option::of(any::<i32>()),
        friends in prop::collection::vec(arb_friend(), 0..6),
    ) {
        let mut layers = StoreLayers::new();
        let ids = ClientIdGenerator::new();
        let node = profile(&name, age, &friends);

        let first = write(&mut layers, &ids, Layer::Committed, &node).unwrap();
        prop_assert!(first.created.contains(&DataId::from("4")));
        let again = write(&mut layers, &ids, Layer::Committed, &node).unwrap();
        prop_assert!(again.is_empty());

        let shadow = write(&mut layers, &ids, Layer::Queued, &node).unwrap();
        prop_assert!(shadow.created.is_empty());
        prop_assert!(shadow.updated.contains(&DataId::from("4")));
        let shadow_again = write(&mut layers, &ids, Layer::Queued, &node).unwrap();
        prop_assert!(shadow_again.is_empty());
    }
}

#[test]
fn null_scalars_and_empty_lists_round_trip() -> Result<()> {
    let mut layers = StoreLayers::new();
    let ids = ClientIdGenerator::new();
    let node = profile("", None, &[]);
    write(&mut layers, &ids, Layer::Committed, &node)?;
    let query = profile_query();
    assert_eq!(
        read(&layers.view(), &DataId::from("4"), &query.field.selections, &query.variables)?,
        Some(node)
    );
    Ok(())
}
