use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite, SqliteConnection,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

use shared::domain::{Factory, FactoryId, Node, NodeId, Root, ROOT_ID};

/// Rows per multi-row `INSERT` when replacing a factory's nodes. Keeps every
/// statement well below SQLite's bound-parameter limit.
const BULK_INSERT_CHUNK: usize = 1000;

const NODE_COLUMNS: &str = "id, number, factory_id, created_at, updated_at";
const FACTORY_COLUMNS: &str = "id, name, lower_bound, upper_bound, root_id, created_at, updated_at";

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("failed to create parent directory '{path}' for database url '{database_url}'")]
    ParentDir {
        path: PathBuf,
        database_url: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn factory_not_found(id: FactoryId) -> Self {
        Self::NotFound {
            entity: "factory",
            id: id.0,
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A factory row without its nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFactory {
    pub id: FactoryId,
    pub name: String,
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub root_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredFactory {
    fn with_nodes(self, nodes: Vec<Node>) -> Factory {
        Factory {
            id: self.id,
            name: self.name,
            lower_bound: self.lower_bound,
            upper_bound: self.upper_bound,
            root_id: self.root_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            nodes,
        }
    }
}

/// What [`Storage::edit_factory`] committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryEdit {
    pub factory: StoredFactory,
    /// Nodes that fell outside the new bounds.
    pub strays: usize,
    /// Replacement nodes; empty when nothing strayed.
    pub regenerated: Vec<Node>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `sqlite::memory:` opens its own empty database,
        // so in-memory stores are pinned to one connection that never expires.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Creates the singleton root row if it does not exist yet. Returns `true`
    /// when the row was inserted by this call.
    pub async fn ensure_root(&self) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO root (id, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(ROOT_ID)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reads the whole tree inside one transaction so the snapshot reflects a
    /// single committed state.
    pub async fn fetch_tree(&self) -> Result<Root> {
        let mut tx = self.pool.begin().await?;

        let root_row = sqlx::query("SELECT id, created_at, updated_at FROM root WHERE id = ?")
            .bind(ROOT_ID)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StorageError::NotFound {
                entity: "root",
                id: ROOT_ID,
            })?;

        let factories = sqlx::query(&format!(
            "SELECT {FACTORY_COLUMNS} FROM factory WHERE root_id = ? ORDER BY id ASC"
        ))
        .bind(ROOT_ID)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(factory_from_row)
        .collect::<Vec<_>>();

        let nodes = sqlx::query(
            "SELECT n.id, n.number, n.factory_id, n.created_at, n.updated_at
             FROM node n
             INNER JOIN factory f ON f.id = n.factory_id
             WHERE f.root_id = ?
             ORDER BY n.factory_id ASC, n.id ASC",
        )
        .bind(ROOT_ID)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut nodes_by_factory: BTreeMap<FactoryId, Vec<Node>> = BTreeMap::new();
        for row in &nodes {
            let node = node_from_row(row);
            nodes_by_factory.entry(node.factory_id).or_default().push(node);
        }

        Ok(Root {
            id: root_row.get::<i64, _>("id"),
            created_at: root_row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: root_row.get::<DateTime<Utc>, _>("updated_at"),
            factories: factories
                .into_iter()
                .map(|factory| {
                    let nodes = nodes_by_factory.remove(&factory.id).unwrap_or_default();
                    factory.with_nodes(nodes)
                })
                .collect(),
        })
    }

    pub async fn find_factory(&self, id: FactoryId) -> Result<Option<StoredFactory>> {
        let row = sqlx::query(&format!("SELECT {FACTORY_COLUMNS} FROM factory WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(factory_from_row))
    }

    /// Inserts a factory and its initial nodes as one transaction; readers
    /// never observe the factory without its nodes.
    pub async fn create_factory(
        &self,
        name: &str,
        lower_bound: i64,
        upper_bound: i64,
        node_values: &[i64],
    ) -> Result<Factory> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO factory (name, lower_bound, upper_bound, root_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING {FACTORY_COLUMNS}"
        ))
        .bind(name)
        .bind(lower_bound)
        .bind(upper_bound)
        .bind(ROOT_ID)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let factory = factory_from_row(&row);

        let nodes = insert_nodes(&mut *tx, factory.id, node_values, now).await?;
        tx.commit().await?;

        Ok(factory.with_nodes(nodes))
    }

    pub async fn update_factory(
        &self,
        id: FactoryId,
        name: &str,
        lower_bound: i64,
        upper_bound: i64,
    ) -> Result<StoredFactory> {
        let mut conn = self.pool.acquire().await?;
        update_factory_row(&mut *conn, id, name, lower_bound, upper_bound).await
    }

    /// Applies a factory edit as one transaction: the new name and bounds are
    /// written, and if any node now lies outside the bounds every node is
    /// replaced with `sample(lower_bound, upper_bound)`, keeping the count.
    /// Readers see either the old factory or the fully edited one.
    pub async fn edit_factory<F>(
        &self,
        id: FactoryId,
        name: &str,
        lower_bound: i64,
        upper_bound: i64,
        sample: F,
    ) -> Result<FactoryEdit>
    where
        F: FnMut(i64, i64) -> i64 + Send,
    {
        let mut tx = self.pool.begin().await?;

        let factory = update_factory_row(&mut *tx, id, name, lower_bound, upper_bound).await?;
        let strays = out_of_bounds_nodes(&mut *tx, id, lower_bound, upper_bound)
            .await?
            .len();
        let regenerated = if strays == 0 {
            Vec::new()
        } else {
            replace_nodes(&mut *tx, id, None, sample).await?
        };

        tx.commit().await?;
        Ok(FactoryEdit {
            factory,
            strays,
            regenerated,
        })
    }

    /// Deletes a factory and every node it owns. Nodes are removed explicitly
    /// before the factory so the cascade does not depend on the foreign-key
    /// pragma being active.
    pub async fn delete_factory(&self, id: FactoryId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM node WHERE factory_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM factory WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StorageError::factory_not_found(id));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Nodes of `factory_id` whose value is strictly below `lower_bound` or
    /// strictly above `upper_bound`.
    pub async fn find_out_of_bounds_nodes(
        &self,
        factory_id: FactoryId,
        lower_bound: i64,
        upper_bound: i64,
    ) -> Result<Vec<Node>> {
        let mut conn = self.pool.acquire().await?;
        out_of_bounds_nodes(&mut *conn, factory_id, lower_bound, upper_bound).await
    }

    pub async fn count_nodes(&self, factory_id: FactoryId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM node WHERE factory_id = ?")
            .bind(factory_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Replaces every node of a factory in one transaction.
    ///
    /// `count` defaults to the number of nodes removed. Each new value comes
    /// from `sample(lower_bound, upper_bound)` using the factory's bounds as
    /// committed at the time of the call.
    pub async fn regenerate_nodes<F>(
        &self,
        factory_id: FactoryId,
        count: Option<usize>,
        sample: F,
    ) -> Result<Vec<Node>>
    where
        F: FnMut(i64, i64) -> i64 + Send,
    {
        let mut tx = self.pool.begin().await?;
        let nodes = replace_nodes(&mut *tx, factory_id, count, sample).await?;
        tx.commit().await?;
        Ok(nodes)
    }
}

async fn update_factory_row(
    conn: &mut SqliteConnection,
    id: FactoryId,
    name: &str,
    lower_bound: i64,
    upper_bound: i64,
) -> Result<StoredFactory> {
    let row = sqlx::query(&format!(
        "UPDATE factory
         SET name = ?, lower_bound = ?, upper_bound = ?, updated_at = ?
         WHERE id = ?
         RETURNING {FACTORY_COLUMNS}"
    ))
    .bind(name)
    .bind(lower_bound)
    .bind(upper_bound)
    .bind(Utc::now())
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref()
        .map(factory_from_row)
        .ok_or(StorageError::factory_not_found(id))
}

async fn out_of_bounds_nodes(
    conn: &mut SqliteConnection,
    factory_id: FactoryId,
    lower_bound: i64,
    upper_bound: i64,
) -> Result<Vec<Node>> {
    let rows = sqlx::query(&format!(
        "SELECT {NODE_COLUMNS} FROM node
         WHERE factory_id = ? AND (number < ? OR number > ?)
         ORDER BY id ASC"
    ))
    .bind(factory_id.0)
    .bind(lower_bound)
    .bind(upper_bound)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(node_from_row).collect())
}

/// Deletes every node of a factory and inserts `count` fresh ones drawn from
/// the bounds visible on `conn`. `count` defaults to the number deleted.
async fn replace_nodes<F>(
    conn: &mut SqliteConnection,
    factory_id: FactoryId,
    count: Option<usize>,
    mut sample: F,
) -> Result<Vec<Node>>
where
    F: FnMut(i64, i64) -> i64 + Send,
{
    let now = Utc::now();

    // Delete first so the write lock is held before the bounds are read.
    let deleted = sqlx::query("DELETE FROM node WHERE factory_id = ?")
        .bind(factory_id.0)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    let bounds = sqlx::query("SELECT lower_bound, upper_bound FROM factory WHERE id = ?")
        .bind(factory_id.0)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StorageError::factory_not_found(factory_id))?;
    let lower_bound = bounds.get::<i64, _>("lower_bound");
    let upper_bound = bounds.get::<i64, _>("upper_bound");

    let count = count.unwrap_or_else(|| usize::try_from(deleted).unwrap_or(usize::MAX));
    let values = (0..count)
        .map(|_| sample(lower_bound, upper_bound))
        .collect::<Vec<_>>();

    insert_nodes(conn, factory_id, &values, now).await
}

async fn insert_nodes(
    conn: &mut SqliteConnection,
    factory_id: FactoryId,
    values: &[i64],
    now: DateTime<Utc>,
) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(values.len());
    for chunk in values.chunks(BULK_INSERT_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO node (number, factory_id, created_at, updated_at) ");
        builder.push_values(chunk, |mut row, number| {
            row.push_bind(*number)
                .push_bind(factory_id.0)
                .push_bind(now)
                .push_bind(now);
        });
        builder.push(format!(" RETURNING {NODE_COLUMNS}"));

        let rows = builder.build().fetch_all(&mut *conn).await?;
        nodes.extend(rows.iter().map(node_from_row));
    }
    nodes.sort_by_key(|node| node.id);
    Ok(nodes)
}

fn factory_from_row(row: &SqliteRow) -> StoredFactory {
    StoredFactory {
        id: FactoryId(row.get::<i64, _>("id")),
        name: row.get::<String, _>("name"),
        lower_bound: row.get::<i64, _>("lower_bound"),
        upper_bound: row.get::<i64, _>("upper_bound"),
        root_id: row.get::<i64, _>("root_id"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    }
}

fn node_from_row(row: &SqliteRow) -> Node {
    Node {
        id: NodeId(row.get::<i64, _>("id")),
        number: row.get::<i64, _>("number"),
        factory_id: FactoryId(row.get::<i64, _>("factory_id")),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|source| StorageError::ParentDir {
        path: parent.to_path_buf(),
        database_url: database_url.to_string(),
        source,
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
