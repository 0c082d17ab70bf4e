//! PostgreSQL access for history cleanup with SQLx

use crate::error::{CleanupError, Result};
use crate::models::{FinishedBatchCount, RetentionPolicy};
use crate::store::{BatchHistoryStore, BatchReportSource, CleanableHistory, InstanceHistoryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Statements run ahead of deleting process instances, as (table, sql) with the
/// instance ids bound to `$1`.
///
/// Byte arrays go first, while the rows pointing at them still exist.
/// Identity links are reached through their task, so they precede the tasks.
const PROCESS_INSTANCE_CASCADE: &[(&str, &str)] = &[
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT bytearray_id_ FROM act_hi_varinst WHERE proc_inst_id_ = ANY($1))",
    ),
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT bytearray_id_ FROM act_hi_detail WHERE proc_inst_id_ = ANY($1))",
    ),
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT job_exception_stack_id_ FROM act_hi_job_log WHERE process_instance_id_ = ANY($1))",
    ),
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT error_details_id_ FROM act_hi_ext_task_log WHERE proc_inst_id_ = ANY($1))",
    ),
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT content_id_ FROM act_hi_attachment WHERE proc_inst_id_ = ANY($1))",
    ),
    (
        "act_hi_identitylink",
        "DELETE FROM act_hi_identitylink WHERE task_id_ IN \
         (SELECT id_ FROM act_hi_taskinst WHERE proc_inst_id_ = ANY($1))",
    ),
    ("act_hi_detail", "DELETE FROM act_hi_detail WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_varinst", "DELETE FROM act_hi_varinst WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_job_log", "DELETE FROM act_hi_job_log WHERE process_instance_id_ = ANY($1)"),
    ("act_hi_ext_task_log", "DELETE FROM act_hi_ext_task_log WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_attachment", "DELETE FROM act_hi_attachment WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_comment", "DELETE FROM act_hi_comment WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_incident", "DELETE FROM act_hi_incident WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_op_log", "DELETE FROM act_hi_op_log WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_actinst", "DELETE FROM act_hi_actinst WHERE proc_inst_id_ = ANY($1)"),
    ("act_hi_taskinst", "DELETE FROM act_hi_taskinst WHERE proc_inst_id_ = ANY($1)"),
];

/// Ahead of decision instances; `$1` holds the selected roots and their children
const DECISION_INSTANCE_CASCADE: &[(&str, &str)] = &[
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT bytearray_id_ FROM act_hi_dec_in WHERE dec_inst_id_ = ANY($1))",
    ),
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT bytearray_id_ FROM act_hi_dec_out WHERE dec_inst_id_ = ANY($1))",
    ),
    ("act_hi_dec_in", "DELETE FROM act_hi_dec_in WHERE dec_inst_id_ = ANY($1)"),
    ("act_hi_dec_out", "DELETE FROM act_hi_dec_out WHERE dec_inst_id_ = ANY($1)"),
];

const CASE_INSTANCE_CASCADE: &[(&str, &str)] = &[
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT bytearray_id_ FROM act_hi_varinst WHERE case_inst_id_ = ANY($1))",
    ),
    (
        "act_ge_bytearray",
        "DELETE FROM act_ge_bytearray WHERE id_ IN \
         (SELECT bytearray_id_ FROM act_hi_detail WHERE case_inst_id_ = ANY($1))",
    ),
    ("act_hi_detail", "DELETE FROM act_hi_detail WHERE case_inst_id_ = ANY($1)"),
    ("act_hi_varinst", "DELETE FROM act_hi_varinst WHERE case_inst_id_ = ANY($1)"),
    ("act_hi_caseactinst", "DELETE FROM act_hi_caseactinst WHERE case_inst_id_ = ANY($1)"),
];

/// Job definitions a historic batch is linked to; incidents and job logs reference these
const BATCH_JOB_DEFINITIONS: &str = r#"
    SELECT seed_job_def_id_ FROM act_hi_batch WHERE id_ = ANY($1)
    UNION SELECT monitor_job_def_id_ FROM act_hi_batch WHERE id_ = ANY($1)
    UNION SELECT batch_job_def_id_ FROM act_hi_batch WHERE id_ = ANY($1)
"#;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(connection_string)
            .await
            .map_err(|e| CleanupError::DatabaseError(format!("Failed to connect: {}", e)))?;

        info!("Database connection pool established");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start the transaction one cleanup cycle runs in.
    ///
    /// Rows returned by the cleanup queries stay locked until the transaction
    /// ends, and concurrent cycles on other nodes skip them.
    pub async fn begin_cleanup(&self) -> Result<CleanupTransaction> {
        let tx = self.pool.begin().await?;
        Ok(CleanupTransaction { tx: Mutex::new(tx) })
    }
}

/// A cleanup cycle's open transaction; dropped without commit it rolls back
pub struct CleanupTransaction {
    tx: Mutex<Transaction<'static, Postgres>>,
}

impl CleanupTransaction {
    pub async fn commit(self) -> Result<()> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.into_inner().rollback().await?;
        Ok(())
    }

    async fn fetch_ids(&self, query: &str, limit: usize, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut tx = self.tx.lock().await;
        let ids = sqlx::query_scalar::<_, String>(query)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&mut **tx)
            .await?;
        Ok(ids)
    }

    /// Run the cascade statements, then delete the rows of `table` themselves
    async fn delete_with_dependents(
        &self,
        table: &str,
        cascade: &[(&str, &str)],
        ids: &[String],
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.tx.lock().await;
        for (dependent, statement) in cascade {
            let result = sqlx::query(statement).bind(ids).execute(&mut **tx).await?;
            debug!(table = *dependent, deleted = result.rows_affected(), "Deleted dependent history");
        }

        let query = format!("DELETE FROM {} WHERE id_ = ANY($1)", table);
        let result = sqlx::query(&query).bind(ids).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    /// The given decision instance ids plus every instance evaluated under them
    async fn with_child_decisions(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut tx = self.tx.lock().await;
        let children = sqlx::query_scalar::<_, String>(
            "SELECT id_ FROM act_hi_decinst WHERE root_dec_inst_id_ = ANY($1) AND NOT (id_ = ANY($1))",
        )
        .bind(ids)
        .fetch_all(&mut **tx)
        .await?;

        let mut all = ids.to_vec();
        all.extend(children);
        Ok(all)
    }

    async fn delete_by_batch_job_definitions(&self, table: &str, ids: &[String]) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE job_def_id_ IN ({})",
            table, BATCH_JOB_DEFINITIONS
        );
        let mut tx = self.tx.lock().await;
        let result = sqlx::query(&query).bind(ids).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    /// Exception stacks of the job logs written by a batch's jobs
    async fn delete_batch_job_log_byte_arrays(&self, ids: &[String]) -> Result<u64> {
        let query = format!(
            "DELETE FROM act_ge_bytearray WHERE id_ IN \
             (SELECT job_exception_stack_id_ FROM act_hi_job_log WHERE job_def_id_ IN ({}))",
            BATCH_JOB_DEFINITIONS
        );
        let mut tx = self.tx.lock().await;
        let result = sqlx::query(&query).bind(ids).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CleanableHistory for CleanupTransaction {
    async fn find_process_instance_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.fetch_ids(
            r#"
            SELECT pi.id_
            FROM act_hi_procinst pi
            JOIN act_re_procdef pd ON pd.id_ = pi.proc_def_id_
            WHERE pi.end_time_ IS NOT NULL
              AND pd.history_ttl_ IS NOT NULL
              AND pi.end_time_ + make_interval(days => pd.history_ttl_) <= $1
            ORDER BY pi.end_time_ ASC
            LIMIT $2
            FOR UPDATE OF pi SKIP LOCKED
            "#,
            limit,
            now,
        )
        .await
    }

    async fn find_decision_instance_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.fetch_ids(
            r#"
            SELECT di.id_
            FROM act_hi_decinst di
            JOIN act_re_decision_def dd ON dd.id_ = di.dec_def_id_
            WHERE dd.history_ttl_ IS NOT NULL
              AND di.eval_time_ + make_interval(days => dd.history_ttl_) <= $1
            ORDER BY di.eval_time_ ASC
            LIMIT $2
            FOR UPDATE OF di SKIP LOCKED
            "#,
            limit,
            now,
        )
        .await
    }

    async fn find_case_instance_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.fetch_ids(
            r#"
            SELECT ci.id_
            FROM act_hi_caseinst ci
            JOIN act_re_case_def cd ON cd.id_ = ci.case_def_id_
            WHERE ci.close_time_ IS NOT NULL
              AND cd.history_ttl_ IS NOT NULL
              AND ci.close_time_ + make_interval(days => cd.history_ttl_) <= $1
            ORDER BY ci.close_time_ ASC
            LIMIT $2
            FOR UPDATE OF ci SKIP LOCKED
            "#,
            limit,
            now,
        )
        .await
    }

    async fn find_batch_ids_for_cleanup(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> Result<Vec<String>> {
        let (types, ttls) = retention_columns(retention);

        let mut tx = self.tx.lock().await;
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT b.id_
            FROM act_hi_batch b
            JOIN UNNEST($1::text[], $2::int4[]) AS r(type_, ttl_) ON r.type_ = b.type_
            WHERE b.end_time_ IS NOT NULL
              AND b.end_time_ + make_interval(days => r.ttl_) <= $3
            ORDER BY b.end_time_ ASC
            LIMIT $4
            FOR UPDATE OF b SKIP LOCKED
            "#,
        )
        .bind(types)
        .bind(ttls)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut **tx)
        .await?;

        Ok(ids)
    }
}

#[async_trait]
impl InstanceHistoryStore for CleanupTransaction {
    async fn delete_process_instances(&self, ids: &[String]) -> Result<u64> {
        self.delete_with_dependents("act_hi_procinst", PROCESS_INSTANCE_CASCADE, ids)
            .await
    }

    async fn delete_decision_instances(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = self.with_child_decisions(ids).await?;
        self.delete_with_dependents("act_hi_decinst", DECISION_INSTANCE_CASCADE, &ids)
            .await
    }

    async fn delete_case_instances(&self, ids: &[String]) -> Result<u64> {
        self.delete_with_dependents("act_hi_caseinst", CASE_INSTANCE_CASCADE, ids)
            .await
    }
}

#[async_trait]
impl BatchHistoryStore for CleanupTransaction {
    async fn delete_incidents_by_batch_ids(&self, ids: &[String]) -> Result<u64> {
        self.delete_by_batch_job_definitions("act_hi_incident", ids).await
    }

    async fn delete_job_logs_by_batch_ids(&self, ids: &[String]) -> Result<u64> {
        let stacks = self.delete_batch_job_log_byte_arrays(ids).await?;
        debug!(table = "act_ge_bytearray", deleted = stacks, "Deleted dependent history");
        self.delete_by_batch_job_definitions("act_hi_job_log", ids).await
    }

    async fn delete_batches_preserving_order(&self, ids: &[String]) -> Result<u64> {
        let mut tx = self.tx.lock().await;
        let mut deleted = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM act_hi_batch WHERE id_ = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }
}

#[async_trait]
impl BatchReportSource for Database {
    async fn count_finished_batches(
        &self,
        now: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> Result<Vec<FinishedBatchCount>> {
        let (types, ttls) = retention_columns(retention);

        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            SELECT b.type_,
                   COUNT(*) AS finished,
                   COUNT(*) FILTER (
                       WHERE r.ttl_ IS NOT NULL
                         AND b.end_time_ + make_interval(days => r.ttl_) <= $3
                   ) AS cleanable
            FROM act_hi_batch b
            LEFT JOIN UNNEST($1::text[], $2::int4[]) AS r(type_, ttl_) ON r.type_ = b.type_
            WHERE b.end_time_ IS NOT NULL
            GROUP BY b.type_
            ORDER BY b.type_ ASC
            "#,
        )
        .bind(types)
        .bind(ttls)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(batch_type, finished, cleanable)| FinishedBatchCount {
                batch_type,
                finished: finished.max(0) as u64,
                cleanable: cleanable.max(0) as u64,
            })
            .collect())
    }
}

/// Split a retention map into parallel arrays for `UNNEST`
fn retention_columns(retention: &RetentionPolicy) -> (Vec<String>, Vec<i32>) {
    retention
        .iter()
        .map(|(operation, days)| (operation.clone(), *days))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted_table(statement: &str) -> &str {
        statement
            .strip_prefix("DELETE FROM ")
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap()
    }

    /// Tables a statement selects from in its sub-query
    fn source_tables(statement: &str) -> Vec<&str> {
        statement
            .split("(SELECT ")
            .skip(1)
            .filter_map(|sub| sub.split(" FROM ").nth(1))
            .filter_map(|rest| rest.split_whitespace().next())
            .collect()
    }

    #[test]
    fn test_cascades_read_rows_before_deleting_them() {
        for cascade in [
            PROCESS_INSTANCE_CASCADE,
            DECISION_INSTANCE_CASCADE,
            CASE_INSTANCE_CASCADE,
        ] {
            for (position, (table, statement)) in cascade.iter().enumerate() {
                assert_eq!(deleted_table(statement), *table);
                for source in source_tables(statement) {
                    let deleted_earlier = cascade[..position]
                        .iter()
                        .any(|(_, earlier)| deleted_table(earlier) == source);
                    assert!(!deleted_earlier, "{statement} reads {source} after it was deleted");
                }
            }
        }
    }

    #[test]
    fn test_process_cascade_covers_dependent_history() {
        let tables: Vec<&str> = PROCESS_INSTANCE_CASCADE.iter().map(|(t, _)| *t).collect();
        for table in [
            "act_ge_bytearray",
            "act_hi_identitylink",
            "act_hi_comment",
            "act_hi_attachment",
            "act_hi_ext_task_log",
            "act_hi_varinst",
            "act_hi_detail",
            "act_hi_job_log",
            "act_hi_taskinst",
        ] {
            assert!(tables.contains(&table), "{table}");
        }
        let byte_arrays = PROCESS_INSTANCE_CASCADE
            .iter()
            .filter(|(t, _)| *t == "act_ge_bytearray")
            .count();
        assert_eq!(byte_arrays, 5);
    }

    #[test]
    fn test_every_statement_binds_only_the_ids() {
        let all = PROCESS_INSTANCE_CASCADE
            .iter()
            .chain(DECISION_INSTANCE_CASCADE)
            .chain(CASE_INSTANCE_CASCADE);
        for (_, statement) in all {
            assert!(statement.contains("ANY($1)"));
            assert!(!statement.contains("$2"));
        }
    }

    #[test]
    fn test_retention_columns_stay_aligned() {
        let retention: RetentionPolicy = [("migration".to_string(), 5), ("removal".to_string(), 9)]
            .into_iter()
            .collect();
        let (types, ttls) = retention_columns(&retention);
        for (operation, days) in types.iter().zip(&ttls) {
            assert_eq!(retention.get(operation), Some(days));
        }
        assert_eq!(types.len(), 2);
    }
}
