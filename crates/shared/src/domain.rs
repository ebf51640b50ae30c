use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the singleton root row. Every factory hangs off this root.
pub const ROOT_ID: i64 = 1;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(FactoryId);
id_newtype!(NodeId);

/// Full snapshot of the tree as committed in storage.
///
/// Factories are ordered by id ascending and each factory's nodes are ordered
/// by id ascending. Clients rely on that ordering for positional identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub factories: Vec<Factory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Factory {
    pub id: FactoryId,
    pub name: String,
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub root_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub nodes: Vec<Node>,
}

impl Factory {
    pub fn contains(&self, number: i64) -> bool {
        (self.lower_bound..=self.upper_bound).contains(&number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub number: i64,
    pub factory_id: FactoryId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
