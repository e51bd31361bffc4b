use thiserror::Error;

use crate::group_id::ResourceGroupId;
use crate::query::QueryId;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Too many queued queries for \"{group}\"")]
    QueueFull { group: ResourceGroupId },

    #[error(
        "Query {query} killed: resource group \"{group}\" is using {usage_bytes} bytes of memory, over its soft limit of {limit_bytes} bytes"
    )]
    ResourceExhausted {
        query: QueryId,
        group: ResourceGroupId,
        usage_bytes: u64,
        limit_bytes: u64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Cannot add queries to {0}. It is not a leaf group.")]
    NotLeafGroup(ResourceGroupId),

    #[error("Cannot add sub group to {0} while queries are running")]
    GroupHasQueries(ResourceGroupId),

    #[error("Invalid resource group name: {0:?}")]
    InvalidGroupName(String),

    #[error("Query {0} is already tracked by the resource group tree")]
    DuplicateQuery(QueryId),

    #[error("{0} must be called on the root group")]
    NotRootGroup(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl AdmissionError {
    /// Shorthand for setter-time validation failures.
    pub fn invalid(msg: impl Into<String>) -> Self {
        AdmissionError::InvalidConfiguration(msg.into())
    }
}

pub type Result<T, E = AdmissionError> = std::result::Result<T, E>;
