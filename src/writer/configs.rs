use crate::types::DataId;

/// Where a range add places the new edge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RangeBehavior {
    /// After the existing edges.
    Append,
    /// Before the existing edges.
    Prepend,
    /// Leave the range untouched.
    Ignore,
}

/// Describes how a mutation payload changes the graph beyond merging
/// objects that carry an `id`.
#[derive(Clone, Debug, PartialEq)]
pub enum MutationConfig {
    /// Records the mutation reports as changed.
    FieldsChange {
        /// Identities the mutation reports as changed.
        field_ids: Vec<DataId>,
    },
    /// The payload carries a new edge for a connection on `parent_id`.
    RangeAdd {
        /// Record owning the connection.
        parent_id: DataId,
        /// Schema name of the connection field.
        connection_name: String,
        /// Response key of the new edge in the payload.
        edge_name: String,
        /// Placement of the edge.
        behavior: RangeBehavior,
    },
    /// The payload names a node removed from a connection on `parent_id`.
    NodeDelete {
        /// Record owning the connection.
        parent_id: DataId,
        /// Schema name of the connection field.
        connection_name: String,
        /// Response key of the deleted identity (or list of identities).
        deleted_id_field_name: String,
    },
}

/// Options for one mutation payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateOptions {
    /// Write to the queued layer instead of the committed one.
    pub is_optimistic: bool,
    /// Graph changes described by the mutation.
    pub configs: Vec<MutationConfig>,
    /// Mutation the writes belong to; recorded on queued records.
    pub client_mutation_id: Option<String>,
}

impl UpdateOptions {
    /// Options for a server-confirmed payload.
    pub fn committed() -> Self {
        Self::default()
    }

    /// Options for an optimistic payload of mutation `client_mutation_id`.
    pub fn optimistic(client_mutation_id: &str) -> Self {
        Self {
            is_optimistic: true,
            configs: Vec::new(),
            client_mutation_id: Some(client_mutation_id.to_owned()),
        }
    }

    /// Adds a mutation config.
    pub fn config(mut self, config: MutationConfig) -> Self {
        self.configs.push(config);
        self
    }
}
