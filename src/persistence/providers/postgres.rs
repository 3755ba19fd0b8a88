use crate::domain::events::{EventRecord, RunEvent};
use crate::domain::files::ChunkResult;
use crate::domain::runs::{Run, RunStatus, RunUpdate};
use crate::domain::threads::{Assistant, Thread, ThreadFilter, ThreadStatus};
use crate::persistence::PersistenceLayer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

const THREAD_COLUMNS: &str =
    "thread_id, user_id, assistant_id, status, metadata, created_at, updated_at";
const RUN_COLUMNS: &str = "run_id, thread_id, assistant_id, user_id, status, input, config, \
                           context, output, error_message, created_at, updated_at";

#[derive(Debug)]
pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_thread(row: &PgRow) -> Result<Thread> {
    let status: String = row.try_get("status")?;
    Ok(Thread {
        thread_id: row.try_get("thread_id")?,
        user_id: row.try_get("user_id")?,
        assistant_id: row.try_get("assistant_id")?,
        status: status.parse::<ThreadStatus>().map_err(anyhow::Error::msg)?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_run(row: &PgRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        run_id: row.try_get("run_id")?,
        thread_id: row.try_get("thread_id")?,
        assistant_id: row.try_get("assistant_id")?,
        user_id: row.try_get("user_id")?,
        status: status.parse::<RunStatus>().map_err(anyhow::Error::msg)?,
        input: row.try_get("input")?,
        config: row.try_get("config")?,
        context: row.try_get("context")?,
        output: row.try_get("output")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_event(row: &PgRow) -> Result<EventRecord> {
    let mode: String = row.try_get("mode")?;
    let seq: i64 = row.try_get("seq")?;
    Ok(EventRecord {
        run_id: row.try_get("run_id")?,
        event_id: row.try_get("event_id")?,
        seq: u64::try_from(seq).context("negative event sequence")?,
        event: RunEvent {
            mode: mode.parse().map_err(anyhow::Error::msg)?,
            data: row.try_get("data")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn push_thread_filter(builder: &mut QueryBuilder<'_, Postgres>, user_id: &str, filter: &ThreadFilter) {
    builder.push(" WHERE user_id = ").push_bind(user_id.to_string());
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(metadata) = &filter.metadata {
        for (key, value) in metadata {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            builder
                .push(" AND metadata ->> ")
                .push_bind(key.clone())
                .push(" = ")
                .push_bind(text);
        }
    }
}

#[async_trait]
impl PersistenceLayer for PostgresProvider {
    // =========================================================================
    // Threads
    // =========================================================================

    async fn create_thread(&self, thread: &Thread) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, user_id, assistant_id, status, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&thread.thread_id)
        .bind(&thread.user_id)
        .bind(&thread.assistant_id)
        .bind(thread.status.as_str())
        .bind(&thread.metadata)
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id = $1"
        ))
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_thread).transpose()
    }

    async fn search_threads(
        &self,
        user_id: &str,
        filter: &ThreadFilter,
    ) -> Result<(Vec<Thread>, usize)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM threads");
        push_thread_filter(&mut count, user_id, filter);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {THREAD_COLUMNS} FROM threads"));
        push_thread_filter(&mut select, user_id, filter);
        select
            .push(" ORDER BY created_at DESC OFFSET ")
            .push_bind(i64::try_from(filter.offset.unwrap_or(0)).unwrap_or(i64::MAX));
        if let Some(limit) = filter.limit {
            select
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = select.build().fetch_all(&self.pool).await?;
        let threads = rows.iter().map(row_to_thread).collect::<Result<Vec<_>>>()?;
        Ok((threads, usize::try_from(total).unwrap_or_default()))
    }

    async fn update_thread(
        &self,
        thread_id: &str,
        assistant_id: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<Option<Thread>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE threads SET
                assistant_id = COALESCE($2, assistant_id),
                metadata = $3,
                updated_at = NOW()
            WHERE thread_id = $1
            RETURNING {THREAD_COLUMNS}
            "#
        ))
        .bind(thread_id)
        .bind(assistant_id)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_thread).transpose()
    }

    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()> {
        sqlx::query("UPDATE threads SET status = $2, updated_at = NOW() WHERE thread_id = $1")
            .bind(thread_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        // runs, run_events and file uploads cascade
        let result = sqlx::query("DELETE FROM threads WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Assistants
    // =========================================================================

    async fn upsert_assistant(&self, assistant: &Assistant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assistants (assistant_id, graph_id, name, user_id, config, context, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (assistant_id) DO UPDATE SET
                graph_id = EXCLUDED.graph_id,
                name = EXCLUDED.name,
                config = EXCLUDED.config,
                context = EXCLUDED.context,
                updated_at = NOW()
            "#,
        )
        .bind(&assistant.assistant_id)
        .bind(&assistant.graph_id)
        .bind(&assistant.name)
        .bind(&assistant.user_id)
        .bind(&assistant.config)
        .bind(&assistant.context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_assistant(&self, assistant_id: &str) -> Result<Option<Assistant>> {
        let row = sqlx::query(
            "SELECT assistant_id, graph_id, name, user_id, config, context FROM assistants WHERE assistant_id = $1",
        )
        .bind(assistant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Assistant {
            assistant_id: row.try_get("assistant_id")?,
            graph_id: row.try_get("graph_id")?,
            name: row.try_get("name")?,
            user_id: row.try_get("user_id")?,
            config: row.try_get("config")?,
            context: row.try_get("context")?,
        }))
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, thread_id, assistant_id, user_id, status, input, config,
                              context, output, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.thread_id)
        .bind(&run.assistant_id)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(&run.input)
        .bind(&run.config)
        .bind(&run.context)
        .bind(&run.output)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = $1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_runs(&self, thread_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE thread_id = $1 ORDER BY created_at DESC"
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    async fn list_active_runs(&self, thread_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE thread_id = $1 AND status IN ('pending', 'running') ORDER BY created_at DESC"
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<bool> {
        let allowed: Vec<&str> = RunStatus::predecessors_of(update.status)
            .into_iter()
            .map(RunStatus::as_str)
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = $2,
                output = COALESCE($3, output),
                error_message = COALESCE($4, error_message),
                updated_at = NOW()
            WHERE run_id = $1 AND status = ANY($5)
            "#,
        )
        .bind(run_id)
        .bind(update.status.as_str())
        .bind(&update.output)
        .bind(&update.error_message)
        .bind(&allowed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Run Events
    // =========================================================================

    async fn append_event(&self, record: &EventRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_events (run_id, event_id, seq, mode, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.run_id)
        .bind(&record.event_id)
        .bind(i64::try_from(record.seq)?)
        .bind(record.event.mode.as_str())
        .bind(&record.event.data)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, event_id, seq, mode, data, created_at
            FROM run_events
            WHERE run_id = $1 AND seq > $2
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(run_id)
        .bind(i64::try_from(after_seq)?)
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    // =========================================================================
    // Documents
    // =========================================================================

    async fn thread_has_documents(&self, thread_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM file_upload WHERE thread_id = $1 LIMIT 1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn search_file_chunks(
        &self,
        thread_id: &str,
        query_vec: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkResult>> {
        let embedding_vector = Vector::from(query_vec.to_vec());
        let limit_i64 = i64::try_from(top_k)?;

        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.file_id, f.filename, c.chunk_index, c.text, c.metadata_json,
                   1 - (c.embedding <=> $1) AS score
            FROM file_chunk c
            JOIN file_upload f ON c.file_id = f.id
            WHERE f.thread_id = $2 AND c.embedding IS NOT NULL
            ORDER BY c.embedding <=> $1
            LIMIT $3
            "#,
        )
        .bind(embedding_vector)
        .bind(thread_id)
        .bind(limit_i64)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::new();
        for row in rows {
            // pgvector's distance operator yields f64
            let score: f64 = row.try_get("score")?;
            #[allow(clippy::cast_possible_truncation)]
            let score = score as f32;
            if score < min_score {
                continue;
            }
            matches.push(ChunkResult {
                chunk_id: row.try_get("chunk_id")?,
                file_id: row.try_get("file_id")?,
                filename: row.try_get("filename")?,
                chunk_index: row.try_get("chunk_index")?,
                text: row.try_get("text")?,
                similarity_score: score,
                metadata: row.try_get("metadata_json")?,
            });
        }
        Ok(matches)
    }
}
