//! Selection descriptors consumed by the store.
//!
//! A compiler outside this crate turns GraphQL documents into these trees. The
//! store only needs to know, per field, its name, response key, arguments,
//! plurality and whether it is a connection; fragments carry an optional type
//! condition used to discriminate concrete types.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::types::{DataId, Result, StoreError};

pub mod missing;
pub mod path;
pub mod reader;
pub mod selector;

pub use missing::{MissingData, MissingDataFinder, PendingNode, StoreMissingDataFinder};
pub use path::QueryPath;
pub use reader::read;
pub use selector::Selector;

/// Variable bindings applied to a selection tree.
pub type Variables = Map<String, Value>;

/// Arguments that page through a connection rather than identify it.
pub const RANGE_CALLS: &[&str] = &["first", "last", "after", "before", "find", "surrounds"];

/// Argument value: a literal or a reference to a variable.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    /// Inline literal.
    Literal(Value),
    /// `$name` resolved against the operation's variables.
    Variable(String),
}

/// A named field argument.
#[derive(Clone, Debug, PartialEq)]
pub struct Argument {
    /// Argument name.
    pub name: String,
    /// Literal or variable value.
    pub value: ArgValue,
}

impl Argument {
    /// Resolves the value; an unbound variable resolves to `None` (argument omitted).
    pub fn resolve(&self, variables: &Variables) -> Option<Value> {
        match &self.value {
            ArgValue::Literal(value) => Some(value.clone()),
            ArgValue::Variable(name) => variables.get(name).cloned(),
        }
    }
}

/// Shape of a field's value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    /// Scalar or list of scalars.
    Scalar,
    /// Single linked object.
    Linked,
    /// List of linked objects.
    PluralLinked,
    /// Paginated connection with `edges` and `pageInfo`.
    Connection,
}

/// One field in a selection tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    /// Schema name.
    pub name: String,
    /// Response alias.
    pub alias: Option<String>,
    /// Arguments in declaration order.
    pub args: Vec<Argument>,
    /// Value shape.
    pub kind: FieldKind,
    /// Child selections (empty for scalars).
    pub selections: Vec<Selection>,
}

impl Field {
    fn with_kind(name: &str, kind: FieldKind, selections: Vec<Selection>) -> Self {
        Self {
            name: name.to_owned(),
            alias: None,
            args: Vec::new(),
            kind,
            selections,
        }
    }

    /// Scalar field.
    pub fn scalar(name: &str) -> Self {
        Self::with_kind(name, FieldKind::Scalar, Vec::new())
    }

    /// Singular linked field.
    pub fn linked(name: &str, selections: Vec<Selection>) -> Self {
        Self::with_kind(name, FieldKind::Linked, selections)
    }

    /// Plural linked field.
    pub fn plural(name: &str, selections: Vec<Selection>) -> Self {
        Self::with_kind(name, FieldKind::PluralLinked, selections)
    }

    /// Connection field; `selections` select from the connection object
    /// (`edges { cursor node { .. } }`, `pageInfo { .. }`, plus any extra fields).
    pub fn connection(name: &str, selections: Vec<Selection>) -> Self {
        Self::with_kind(name, FieldKind::Connection, selections)
    }

    /// Sets the response alias.
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_owned());
        self
    }

    /// Adds a literal argument.
    pub fn arg(mut self, name: &str, value: Value) -> Self {
        self.args.push(Argument {
            name: name.to_owned(),
            value: ArgValue::Literal(value),
        });
        self
    }

    /// Adds an argument bound to `$variable`.
    pub fn var_arg(mut self, name: &str, variable: &str) -> Self {
        self.args.push(Argument {
            name: name.to_owned(),
            value: ArgValue::Variable(variable.to_owned()),
        });
        self
    }

    /// Key under which the field appears in a response payload.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Key under which the field is stored on a record.
    ///
    /// Arguments are serialized in name order; connection fields leave out
    /// range calls so every page of a connection lands on the same range.
    pub fn storage_key(&self, variables: &Variables) -> Result<String> {
        self.storage_key_excluding(variables, None)
    }

    pub(crate) fn storage_key_excluding(
        &self,
        variables: &Variables,
        excluded: Option<&str>,
    ) -> Result<String> {
        let mut args = BTreeMap::new();
        for arg in &self.args {
            if Some(arg.name.as_str()) == excluded {
                continue;
            }
            if self.kind == FieldKind::Connection && RANGE_CALLS.contains(&arg.name.as_str()) {
                continue;
            }
            if let Some(value) = arg.resolve(variables) {
                args.insert(arg.name.as_str(), value);
            }
        }
        if args.is_empty() {
            return Ok(self.name.clone());
        }
        Ok(format!("{}{}", self.name, serde_json::to_string(&args)?))
    }

    /// Looks up a direct child field by response key.
    pub fn child(&self, response_key: &str) -> Option<&Field> {
        find_field(&self.selections, response_key)
    }

    /// Whether the field can carry child selections.
    pub fn is_linked(&self) -> bool {
        self.kind != FieldKind::Scalar
    }
}

/// A fragment (named or inline) applied to the enclosing record.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    /// Fragment name.
    pub name: String,
    /// Type the fragment applies to; `None` applies unconditionally.
    pub type_condition: Option<String>,
    /// Whether the type condition names an interface or union.
    pub is_abstract: bool,
    /// Selections applied to the record.
    pub selections: Vec<Selection>,
}

impl Fragment {
    /// Creates a fragment without a type condition.
    pub fn new(name: &str, selections: Vec<Selection>) -> Self {
        Self {
            name: name.to_owned(),
            type_condition: None,
            is_abstract: false,
            selections,
        }
    }

    /// Restricts the fragment to records of concrete type `typename`.
    pub fn on(mut self, typename: &str) -> Self {
        self.type_condition = Some(typename.to_owned());
        self
    }

    /// Marks the type condition as abstract (interface or union).
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Whether the fragment applies to a record of type `typename`.
    ///
    /// Abstract conditions and unknown types are given the benefit of the doubt.
    pub fn applies_to(&self, typename: Option<&str>) -> bool {
        match (&self.type_condition, typename) {
            (Some(condition), Some(typename)) if !self.is_abstract => condition == typename,
            _ => true,
        }
    }
}

/// One entry of a selection tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// Field selection.
    Field(Field),
    /// Fragment spread or inline fragment; shared so selectors can compare by reference.
    Fragment(Rc<Fragment>),
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Selection::Field(field)
    }
}

impl From<Rc<Fragment>> for Selection {
    fn from(fragment: Rc<Fragment>) -> Self {
        Selection::Fragment(fragment)
    }
}

impl From<Fragment> for Selection {
    fn from(fragment: Fragment) -> Self {
        Selection::Fragment(Rc::new(fragment))
    }
}

/// Finds a field by response key, looking through fragments.
pub fn find_field<'a>(selections: &'a [Selection], response_key: &str) -> Option<&'a Field> {
    selections.iter().find_map(|selection| match selection {
        Selection::Field(field) if field.response_key() == response_key => Some(field),
        Selection::Field(_) => None,
        Selection::Fragment(fragment) => find_field(&fragment.selections, response_key),
    })
}

/// Flattens `selections` into the fields that apply to a record of type `typename`.
pub fn applicable_fields<'a>(selections: &'a [Selection], typename: Option<&str>) -> Vec<&'a Field> {
    let mut out = Vec::new();
    collect_fields(selections, typename, &mut out);
    out
}

fn collect_fields<'a>(selections: &'a [Selection], typename: Option<&str>, out: &mut Vec<&'a Field>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => out.push(field),
            Selection::Fragment(fragment) => {
                if fragment.applies_to(typename) {
                    collect_fields(&fragment.selections, typename, out);
                }
            }
        }
    }
}

/// A top-level operation: one root field plus the variables it runs with.
#[derive(Clone, Debug, PartialEq)]
pub struct RootQuery {
    /// Operation name.
    pub name: String,
    /// The root field, e.g. `node(id: $id)` or `viewer`.
    pub field: Field,
    /// Name of the argument identifying the root record, when there is one.
    pub identifying_arg: Option<String>,
    /// Variable bindings.
    pub variables: Variables,
}

impl RootQuery {
    /// Creates an operation without an identifying argument.
    pub fn new(name: &str, field: Field) -> Self {
        Self {
            name: name.to_owned(),
            field,
            identifying_arg: None,
            variables: Variables::new(),
        }
    }

    /// Names the argument of the root field that identifies its record(s).
    pub fn identified_by(mut self, arg: &str) -> Self {
        self.identifying_arg = Some(arg.to_owned());
        self
    }

    /// Binds `$name` to `value`.
    pub fn variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_owned(), value);
        self
    }

    /// Storage key of the root call (identifying argument excluded).
    pub fn root_call_key(&self) -> Result<String> {
        self.field
            .storage_key_excluding(&self.variables, self.identifying_arg.as_deref())
    }

    /// Index keys of the identifying argument, one per root record.
    ///
    /// Without an identifying argument there is exactly one key, `""`. A list
    /// value identifies one record per element.
    pub fn identifying_arg_keys(&self) -> Result<Vec<String>> {
        let Some(name) = self.identifying_arg.as_deref() else {
            return Ok(vec![String::new()]);
        };
        let arg = self
            .field
            .args
            .iter()
            .find(|arg| arg.name == name)
            .ok_or_else(|| {
                StoreError::invariant(format!(
                    "root field `{}` has no identifying argument `{name}`",
                    self.field.name
                ))
            })?;
        match arg.resolve(&self.variables) {
            Some(Value::Array(values)) => Ok(values.iter().map(identifying_key).collect()),
            Some(value) => Ok(vec![identifying_key(&value)]),
            None => Err(StoreError::invariant(format!(
                "identifying argument `{name}` of `{}` is unbound",
                self.name
            ))),
        }
    }

    /// Whether the identifying argument is a list (one root record per element).
    pub fn is_plural_root(&self) -> bool {
        let Some(name) = self.identifying_arg.as_deref() else {
            return false;
        };
        self.field
            .args
            .iter()
            .find(|arg| arg.name == name)
            .and_then(|arg| arg.resolve(&self.variables))
            .is_some_and(|value| value.is_array())
    }
}

/// Index key for one identifying argument value; strings are used verbatim.
pub fn identifying_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Identity carried by a payload object's `id` field, if any.
pub fn payload_id(object: &Map<String, Value>) -> Option<DataId> {
    match object.get("id") {
        Some(Value::String(id)) => Some(DataId::from(id.as_str())),
        Some(Value::Number(n)) => Some(DataId::new(n.to_string())),
        _ => None,
    }
}
