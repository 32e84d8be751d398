use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::item::{Item, ItemId};
use crate::store::{ItemStore, StoreError, StoreResult};

/// An Item row as read from PostgreSQL. The status is stored as text.
#[derive(sqlx::FromRow)]
struct ItemRow {
    id: i64,
    name: String,
    description: String,
    status: String,
    email: String,
}

impl TryFrom<ItemRow> for Item {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|error| StoreError::ParseItemError { id: row.id, error })?;

        Ok(Item {
            id: Some(row.id),
            name: row.name,
            description: row.description,
            status,
            email: row.email,
        })
    }
}

/// An ItemStore implemented on top of the `items` table in PostgreSQL.
#[derive(Clone)]
pub struct PgItemStore {
    pool: PgPool,
}

impl PgItemStore {
    /// Initialize a new PgItemStore with a lazily connected pool.
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new PgItemStore from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItemStore for PgItemStore {
    async fn list_ids(&self) -> StoreResult<Vec<ItemId>> {
        sqlx::query_scalar("SELECT id FROM items ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn find_all(&self) -> StoreResult<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(
            r#"
SELECT id, name, description, status, email
FROM items
ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        rows.into_iter().map(Item::try_from).collect()
    }

    async fn find_by_id(&self, id: ItemId) -> StoreResult<Option<Item>> {
        let row: Option<ItemRow> = sqlx::query_as(
            r#"
SELECT id, name, description, status, email
FROM items
WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        row.map(Item::try_from).transpose()
    }

    async fn save(&self, item: Item) -> StoreResult<Item> {
        let row: ItemRow = match item.id {
            Some(id) => {
                sqlx::query_as::<_, ItemRow>(
                    r#"
INSERT INTO items
    (id, name, description, status, email)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT (id) DO UPDATE
SET
    name = EXCLUDED.name,
    description = EXCLUDED.description,
    status = EXCLUDED.status,
    email = EXCLUDED.email
RETURNING id, name, description, status, email
                    "#,
                )
                .bind(id)
                .bind(&item.name)
                .bind(&item.description)
                .bind(item.status.as_str())
                .bind(&item.email)
                .fetch_one(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, ItemRow>(
                    r#"
INSERT INTO items
    (name, description, status, email)
VALUES
    ($1, $2, $3, $4)
RETURNING id, name, description, status, email
                    "#,
                )
                .bind(&item.name)
                .bind(&item.description)
                .bind(item.status.as_str())
                .bind(&item.email)
                .fetch_one(&self.pool)
                .await
            }
        }
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Item::try_from(row)
    }

    async fn delete_by_id(&self, id: ItemId) -> StoreResult<()> {
        sqlx::query("DELETE FROM items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(())
    }
}
