use async_trait::async_trait;
use rand::seq::IteratorRandom;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, PoisonError},
};
use tokio_postgres::{Client, NoTls, Row};

use crate::error::StoreError;
use crate::models::{AuxiliaryFields, BenchmarkEntry, RepositoryRef};

pub const DEFAULT_TABLE: &str = "benchmark_entries";

#[async_trait]
pub trait RowStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn upsert_entries(&self, entries: &[BenchmarkEntry]) -> Result<(), StoreError>;

    async fn select_random_unconsumed(&self) -> Result<Option<BenchmarkEntry>, StoreError>;

    async fn mark_consumed(&self, id: &str) -> Result<(), StoreError>;

    async fn clear_all_consumed_markers(&self) -> Result<(), StoreError>;

    // Select and mark happen in one statement.
    async fn claim_random_unconsumed(&self) -> Result<Option<BenchmarkEntry>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn repository_refs(&self) -> Result<Vec<RepositoryRef>, StoreError>;
}

const ENTRY_COLUMNS: &str = "instance_id, text, repo, base_commit, problem_statement, \
hints_text, created_at, patch, test_patch, version, fail_to_pass, pass_to_pass, \
environment_setup_commit, consumed";

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            instance_id TEXT PRIMARY KEY,
            text TEXT NOT NULL DEFAULT '',
            repo TEXT NOT NULL,
            base_commit TEXT NOT NULL,
            problem_statement TEXT NOT NULL,
            hints_text TEXT,
            created_at TEXT NOT NULL DEFAULT '',
            patch TEXT NOT NULL DEFAULT '',
            test_patch TEXT NOT NULL DEFAULT '',
            version TEXT NOT NULL DEFAULT '',
            fail_to_pass TEXT NOT NULL DEFAULT '',
            pass_to_pass TEXT NOT NULL DEFAULT '',
            environment_setup_commit TEXT NOT NULL DEFAULT '',
            consumed BOOLEAN NOT NULL DEFAULT FALSE
        )"
    )
}

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} ({ENTRY_COLUMNS}) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, FALSE) \
ON CONFLICT (instance_id) DO UPDATE SET \
text = EXCLUDED.text, repo = EXCLUDED.repo, base_commit = EXCLUDED.base_commit, \
problem_statement = EXCLUDED.problem_statement, hints_text = EXCLUDED.hints_text, \
created_at = EXCLUDED.created_at, patch = EXCLUDED.patch, test_patch = EXCLUDED.test_patch, \
version = EXCLUDED.version, fail_to_pass = EXCLUDED.fail_to_pass, \
pass_to_pass = EXCLUDED.pass_to_pass, \
environment_setup_commit = EXCLUDED.environment_setup_commit, consumed = FALSE"
    )
}

fn select_random_sql(table: &str) -> String {
    format!("SELECT {ENTRY_COLUMNS} FROM {table} WHERE consumed = FALSE ORDER BY random() LIMIT 1")
}

fn claim_random_sql(table: &str) -> String {
    // Row lock keeps two claimers from taking the same entry.
    format!(
        "UPDATE {table} SET consumed = TRUE WHERE instance_id = (\
SELECT instance_id FROM {table} WHERE consumed = FALSE \
ORDER BY random() LIMIT 1 FOR UPDATE SKIP LOCKED) \
RETURNING {ENTRY_COLUMNS}"
    )
}

fn mark_consumed_sql(table: &str) -> String {
    format!("UPDATE {table} SET consumed = TRUE WHERE instance_id = $1")
}

fn clear_consumed_sql(table: &str) -> String {
    format!("UPDATE {table} SET consumed = FALSE WHERE consumed = TRUE")
}

fn count_sql(table: &str) -> String {
    format!("SELECT COUNT(*) AS count FROM {table}")
}

fn repository_refs_sql(table: &str) -> String {
    format!("SELECT DISTINCT repo, base_commit FROM {table} ORDER BY repo, base_commit")
}

// Each operation opens its own connection and closes it when done.
#[derive(Clone)]
pub struct PostgresRowStore {
    database_url: String,
    table: String,
}

impl PostgresRowStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            table: DEFAULT_TABLE.to_string(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    async fn connect(&self) -> Result<Client, StoreError> {
        let (client, connection) = tokio_postgres::connect(&self.database_url, NoTls)
            .await
            .map_err(StoreError::postgres("connect failed"))?;
        tokio::spawn(async move {
            // Ends once the client is dropped.
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "row store connection error");
            }
        });
        Ok(client)
    }
}

fn entry_from_row(row: &Row) -> Result<BenchmarkEntry, StoreError> {
    let text = |column: &str| -> Result<String, StoreError> {
        row.try_get::<_, String>(column)
            .map_err(|err| StoreError::Decode(format!("{column}: {err}")))
    };
    Ok(BenchmarkEntry {
        id: text("instance_id")?,
        problem_text: text("problem_statement")?,
        repository: text("repo")?,
        base_revision: text("base_commit")?,
        hints: row
            .try_get::<_, Option<String>>("hints_text")
            .map_err(|err| StoreError::Decode(format!("hints_text: {err}")))?,
        created_at: text("created_at")?,
        patch: text("patch")?,
        consumed: row
            .try_get::<_, bool>("consumed")
            .map_err(|err| StoreError::Decode(format!("consumed: {err}")))?,
        auxiliary: AuxiliaryFields {
            text: text("text")?,
            test_patch: text("test_patch")?,
            version: text("version")?,
            fail_to_pass: text("fail_to_pass")?,
            pass_to_pass: text("pass_to_pass")?,
            environment_setup_commit: text("environment_setup_commit")?,
        },
    })
}

#[async_trait]
impl RowStore for PostgresRowStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.connect().await?;
        client
            .batch_execute(create_table_sql(&self.table).as_str())
            .await
            .map_err(StoreError::postgres("create table failed"))?;
        Ok(())
    }

    async fn upsert_entries(&self, entries: &[BenchmarkEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut client = self.connect().await?;
        // One transaction per batch keeps a failed import from half-applying a page.
        let transaction = client
            .transaction()
            .await
            .map_err(StoreError::postgres("start transaction failed"))?;
        let statement = transaction
            .prepare(upsert_sql(&self.table).as_str())
            .await
            .map_err(StoreError::postgres("prepare upsert failed"))?;
        for entry in entries {
            let aux = &entry.auxiliary;
            transaction
                .execute(
                    &statement,
                    &[
                        &entry.id,
                        &aux.text,
                        &entry.repository,
                        &entry.base_revision,
                        &entry.problem_text,
                        &entry.hints,
                        &entry.created_at,
                        &entry.patch,
                        &aux.test_patch,
                        &aux.version,
                        &aux.fail_to_pass,
                        &aux.pass_to_pass,
                        &aux.environment_setup_commit,
                    ],
                )
                .await
                .map_err(StoreError::postgres("upsert entry failed"))?;
        }
        transaction
            .commit()
            .await
            .map_err(StoreError::postgres("commit failed"))?;
        Ok(())
    }

    async fn select_random_unconsumed(&self) -> Result<Option<BenchmarkEntry>, StoreError> {
        let client = self.connect().await?;
        let row = client
            .query_opt(select_random_sql(&self.table).as_str(), &[])
            .await
            .map_err(StoreError::postgres("select random entry failed"))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn mark_consumed(&self, id: &str) -> Result<(), StoreError> {
        let client = self.connect().await?;
        client
            .execute(mark_consumed_sql(&self.table).as_str(), &[&id])
            .await
            .map_err(StoreError::postgres("mark consumed failed"))?;
        Ok(())
    }

    async fn clear_all_consumed_markers(&self) -> Result<(), StoreError> {
        let client = self.connect().await?;
        client
            .execute(clear_consumed_sql(&self.table).as_str(), &[])
            .await
            .map_err(StoreError::postgres("clear consumed markers failed"))?;
        Ok(())
    }

    async fn claim_random_unconsumed(&self) -> Result<Option<BenchmarkEntry>, StoreError> {
        let client = self.connect().await?;
        let row = client
            .query_opt(claim_random_sql(&self.table).as_str(), &[])
            .await
            .map_err(StoreError::postgres("claim entry failed"))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let client = self.connect().await?;
        let row = client
            .query_one(count_sql(&self.table).as_str(), &[])
            .await
            .map_err(StoreError::postgres("count entries failed"))?;
        let count: i64 = row
            .try_get("count")
            .map_err(|err| StoreError::Decode(format!("count: {err}")))?;
        Ok(count.max(0) as u64)
    }

    async fn repository_refs(&self) -> Result<Vec<RepositoryRef>, StoreError> {
        let client = self.connect().await?;
        let rows = client
            .query(repository_refs_sql(&self.table).as_str(), &[])
            .await
            .map_err(StoreError::postgres("list repositories failed"))?;
        rows.iter()
            .map(|row| -> Result<RepositoryRef, StoreError> {
                Ok(RepositoryRef {
                    repository: row
                        .try_get("repo")
                        .map_err(|err| StoreError::Decode(format!("repo: {err}")))?,
                    base_revision: row
                        .try_get("base_commit")
                        .map_err(|err| StoreError::Decode(format!("base_commit: {err}")))?,
                })
            })
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryRowStore {
    rows: Mutex<BTreeMap<String, BenchmarkEntry>>,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_rows<T>(&self, f: impl FnOnce(&mut BTreeMap<String, BenchmarkEntry>) -> T) -> T {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rows)
    }

    fn pick_unconsumed(rows: &BTreeMap<String, BenchmarkEntry>) -> Option<String> {
        rows.values()
            .filter(|entry| !entry.consumed)
            .choose(&mut rand::thread_rng())
            .map(|entry| entry.id.clone())
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_entries(&self, entries: &[BenchmarkEntry]) -> Result<(), StoreError> {
        self.with_rows(|rows| {
            for entry in entries {
                let mut entry = entry.clone();
                entry.consumed = false;
                rows.insert(entry.id.clone(), entry);
            }
        });
        Ok(())
    }

    async fn select_random_unconsumed(&self) -> Result<Option<BenchmarkEntry>, StoreError> {
        Ok(self.with_rows(|rows| {
            Self::pick_unconsumed(rows).and_then(|id| rows.get(&id).cloned())
        }))
    }

    async fn mark_consumed(&self, id: &str) -> Result<(), StoreError> {
        self.with_rows(|rows| {
            if let Some(entry) = rows.get_mut(id) {
                entry.consumed = true;
            }
        });
        Ok(())
    }

    async fn clear_all_consumed_markers(&self) -> Result<(), StoreError> {
        self.with_rows(|rows| {
            for entry in rows.values_mut() {
                entry.consumed = false;
            }
        });
        Ok(())
    }

    async fn claim_random_unconsumed(&self) -> Result<Option<BenchmarkEntry>, StoreError> {
        Ok(self.with_rows(|rows| {
            let id = Self::pick_unconsumed(rows)?;
            let entry = rows.get_mut(&id)?;
            entry.consumed = true;
            Some(entry.clone())
        }))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.with_rows(|rows| rows.len() as u64))
    }

    async fn repository_refs(&self) -> Result<Vec<RepositoryRef>, StoreError> {
        Ok(self.with_rows(|rows| {
            rows.values()
                .map(|entry| RepositoryRef {
                    repository: entry.repository.clone(),
                    base_revision: entry.base_revision.clone(),
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    pub(crate) fn entry(id: &str) -> BenchmarkEntry {
        BenchmarkEntry {
            id: id.to_string(),
            problem_text: format!("problem {id}"),
            repository: "octo/widgets".to_string(),
            base_revision: format!("rev-{id}"),
            hints: None,
            created_at: "2023-01-01T00:00:00Z".to_string(),
            patch: String::new(),
            consumed: false,
            auxiliary: AuxiliaryFields::default(),
        }
    }

    pub(crate) async fn seeded(ids: &[&str]) -> InMemoryRowStore {
        let store = InMemoryRowStore::new();
        let entries: Vec<_> = ids.iter().map(|id| entry(id)).collect();
        store.upsert_entries(&entries).await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = seeded(&["A", "B"]).await;
        let mut replacement = entry("A");
        replacement.problem_text = "updated".to_string();
        store.upsert_entries(&[replacement]).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        store.mark_consumed("B").await.unwrap();
        let picked = store.select_random_unconsumed().await.unwrap().unwrap();
        assert_eq!(picked.id, "A");
        assert_eq!(picked.problem_text, "updated");
    }

    #[tokio::test]
    async fn reimport_resets_consumed_marker() {
        let store = seeded(&["A"]).await;
        store.mark_consumed("A").await.unwrap();
        assert!(store.select_random_unconsumed().await.unwrap().is_none());

        store.upsert_entries(&[entry("A")]).await.unwrap();
        assert!(store.select_random_unconsumed().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn select_does_not_mark() {
        let store = seeded(&["A"]).await;
        assert!(store.select_random_unconsumed().await.unwrap().is_some());
        assert!(store.select_random_unconsumed().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mark_consumed_is_idempotent_and_ignores_unknown_ids() {
        let store = seeded(&["A"]).await;
        store.mark_consumed("A").await.unwrap();
        store.mark_consumed("A").await.unwrap();
        store.mark_consumed("missing").await.unwrap();
        assert!(store.select_random_unconsumed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_marks_atomically() {
        let store = seeded(&["A", "B", "C"]).await;
        let mut seen = HashSet::new();
        while let Some(entry) = store.claim_random_unconsumed().await.unwrap() {
            assert!(entry.consumed);
            assert!(seen.insert(entry.id));
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn clear_makes_every_row_eligible() {
        let store = seeded(&["A", "B"]).await;
        store.mark_consumed("A").await.unwrap();
        store.mark_consumed("B").await.unwrap();
        store.clear_all_consumed_markers().await.unwrap();

        let mut seen = HashSet::new();
        while let Some(entry) = store.claim_random_unconsumed().await.unwrap() {
            seen.insert(entry.id);
        }
        assert_eq!(seen, HashSet::from(["A".to_string(), "B".to_string()]));
    }

    #[tokio::test]
    async fn repository_refs_are_distinct() {
        let store = InMemoryRowStore::new();
        let mut first = entry("A");
        first.base_revision = "same".to_string();
        let mut second = entry("B");
        second.base_revision = "same".to_string();
        store
            .upsert_entries(&[first, second, entry("C")])
            .await
            .unwrap();

        let refs = store.repository_refs().await.unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn claim_sql_locks_the_candidate_row() {
        let sql = claim_random_sql("entries_test");
        assert!(sql.starts_with("UPDATE entries_test SET consumed = TRUE"));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("RETURNING instance_id"));
    }

    // Runs only against a live database: TEST_DATABASE_URL=postgres://...
    #[tokio::test]
    async fn postgres_round_trip() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let store = PostgresRowStore::new(url).with_table("benchmark_entries_test");
        store.ensure_schema().await.unwrap();
        store.upsert_entries(&[entry("pg-A"), entry("pg-B")]).await.unwrap();
        store.clear_all_consumed_markers().await.unwrap();

        let first = store.claim_random_unconsumed().await.unwrap().unwrap();
        assert!(first.consumed);
        let mut remaining = 0;
        while store.claim_random_unconsumed().await.unwrap().is_some() {
            remaining += 1;
        }
        assert!(remaining >= 1);
        assert!(store.select_random_unconsumed().await.unwrap().is_none());
        assert!(store.count().await.unwrap() >= 2);
    }
}
