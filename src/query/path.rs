use std::rc::Rc;

use serde_json::json;

use crate::types::DataId;

use super::{Field, RootQuery, Selection};

/// How to re-derive a fetchable query for a record.
///
/// Paths are immutable chains shared between records: a record with a server
/// identity restarts the chain at `node(id:)`, while a client-only record keeps
/// a reference to its parent's path plus the field that reached it.
#[derive(Clone, Debug)]
pub struct QueryPath(Rc<PathNode>);

#[derive(Debug)]
enum PathNode {
    Root {
        query: RootQuery,
    },
    Node {
        id: DataId,
        name: String,
    },
    Client {
        parent: QueryPath,
        field: Field,
    },
}

fn without_selections(field: &Field) -> Field {
    Field {
        selections: Vec::new(),
        ..field.clone()
    }
}

impl QueryPath {
    /// Path of a record reached through the root field of `query`.
    pub fn root(query: &RootQuery) -> Self {
        QueryPath(Rc::new(PathNode::Root {
            query: RootQuery {
                field: without_selections(&query.field),
                ..query.clone()
            },
        }))
    }

    /// Path of a refetchable record, reached through `node(id:)`.
    pub fn node(id: &DataId, name: &str) -> Self {
        QueryPath(Rc::new(PathNode::Node {
            id: id.clone(),
            name: name.to_owned(),
        }))
    }

    /// Path of the record `id` reached from this path through `field`.
    pub fn child(&self, field: &Field, id: &DataId) -> Self {
        if id.is_client() {
            QueryPath(Rc::new(PathNode::Client {
                parent: self.clone(),
                field: without_selections(field),
            }))
        } else {
            QueryPath::node(id, self.name())
        }
    }

    /// Name of the operation the path originates from.
    pub fn name(&self) -> &str {
        match &*self.0 {
            PathNode::Root { query } => &query.name,
            PathNode::Node { name, .. } => name,
            PathNode::Client { parent, .. } => parent.name(),
        }
    }

    /// Builds a standalone query fetching `selections` on the record this path leads to.
    pub fn query_for(&self, selections: Vec<Selection>) -> RootQuery {
        match &*self.0 {
            PathNode::Root { query } => RootQuery {
                field: Field {
                    selections,
                    ..query.field.clone()
                },
                ..query.clone()
            },
            PathNode::Node { id, name } => {
                let mut node_selections: Vec<Selection> = vec![Field::scalar("id").into()];
                node_selections.extend(selections);
                RootQuery::new(
                    name,
                    Field::linked("node", node_selections).arg("id", json!(id.as_str())),
                )
                .identified_by("id")
            }
            PathNode::Client { parent, field } => parent.query_for(vec![Selection::Field(Field {
                selections,
                ..field.clone()
            })]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{find_field, FieldKind};

    #[test]
    fn server_identities_restart_at_node() {
        let root = RootQuery::new(
            "ViewerQuery",
            Field::linked("viewer", vec![Field::scalar("x").into()]),
        );
        let viewer = QueryPath::root(&root);
        let actor = viewer.child(&Field::linked("actor", vec![]), &DataId::from("4"));
        let query = actor.query_for(vec![Field::scalar("name").into()]);
        assert_eq!(query.field.name, "node");
        assert_eq!(query.identifying_arg.as_deref(), Some("id"));
        assert_eq!(query.identifying_arg_keys().unwrap(), vec!["4".to_owned()]);
        assert!(find_field(&query.field.selections, "name").is_some());
        assert_eq!(query.name, "ViewerQuery");
    }

    #[test]
    fn client_records_nest_under_their_parent() {
        let root = RootQuery::new("ViewerQuery", Field::linked("viewer", vec![]));
        let viewer_path = QueryPath::root(&root);
        let settings = viewer_path.child(
            &Field::linked("settings", vec![Field::scalar("dropped").into()]),
            &DataId::from("client:2"),
        );
        let query = settings.query_for(vec![Field::scalar("theme").into()]);
        assert_eq!(query.field.name, "viewer");
        let settings_field = query.field.child("settings").unwrap();
        assert_eq!(settings_field.kind, FieldKind::Linked);
        assert!(settings_field.child("theme").is_some());
        assert!(settings_field.child("dropped").is_none());
    }
}
