//! Embedded relational store for long-lived pipeline records
//!
//! A single SQLite file with WAL journalling holds instances, pods,
//! coredump records, analysis results, and the event streams. All
//! multi-row writes run inside one transaction. Steady-state write
//! failures are logged and skipped by callers; the filesystem remains
//! the source of truth.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::models::{
    AIAnalysisResult, AnalysisResults, CleanupEvent, CoredumpFile, FileStatus, MilvusInstance,
    RestartEvent, StorageEvent,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Handle to the embedded database
pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

impl Database {
    /// Open (or create) the database at the configured path
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(dir) = Path::new(&config.path).parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create database directory {:?}", dir))?;
        }

        let conn = Connection::open(&config.path)
            .with_context(|| format!("failed to open database at {}", config.path))?;
        Self::initialize(&conn)?;

        info!(path = %config.path, "Database initialized");
        Ok(Self {
            conn: Mutex::new(conn),
            path: config.path.clone(),
        })
    }

    /// In-memory database, used by tests and the controller's dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: ":memory:".to_string(),
        })
    }

    fn initialize(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journalling")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply database schema")?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `f` inside a transaction, committing on success
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("database lock poisoned: {}", e))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` with the raw connection (reads, single statements)
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("database lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Read a value from the system_stats key/value table
    pub fn get_stat(&self, name: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT stat_value FROM system_stats WHERE stat_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Upsert a value into the system_stats key/value table
    pub fn set_stat(&self, name: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO system_stats (stat_name, stat_value, updated_at) \
                 VALUES (?1, ?2, datetime('now'))",
                params![name, value],
            )?;
            Ok(())
        })
    }

    /// Delete event rows older than the retention horizon
    pub fn cleanup_old_records(&self, retention_days: u32) -> Result<()> {
        if retention_days == 0 {
            return Ok(());
        }

        // Match sqlite's datetime('now') text format for lexicographic comparison
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM restart_events WHERE created_at < ?1",
                params![cutoff],
            )?;
            tx.execute(
                "DELETE FROM storage_events WHERE created_at < ?1",
                params![cutoff],
            )?;
            tx.execute(
                "DELETE FROM cleanup_events WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(())
        })?;

        info!(retention_days, "Cleaned up old database records");
        Ok(())
    }
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Persistence of discovered instances and their pods
pub struct InstanceStore<'a> {
    db: &'a Database,
}

impl<'a> InstanceStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Upsert an instance and its pods in one transaction
    pub fn save(&self, instance: &MilvusInstance) -> Result<()> {
        self.db.with_transaction(|tx| {
            let labels = serde_json::to_string(&instance.labels).unwrap_or_else(|_| "{}".into());
            tx.execute(
                "INSERT INTO milvus_instances (name, namespace, deployment_type, labels, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(name) DO UPDATE SET \
                   namespace = excluded.namespace, \
                   deployment_type = excluded.deployment_type, \
                   labels = excluded.labels, \
                   status = excluded.status, \
                   updated_at = datetime('now'), \
                   last_seen = datetime('now')",
                params![
                    instance.name,
                    instance.namespace,
                    instance.deployment_type.to_string(),
                    labels,
                    instance.status.to_string(),
                    fmt_ts(&instance.created_at),
                ],
            )?;

            let instance_id: i64 = tx.query_row(
                "SELECT id FROM milvus_instances WHERE name = ?1",
                params![instance.name],
                |row| row.get(0),
            )?;

            for pod in &instance.pods {
                let statuses =
                    serde_json::to_string(&pod.container_statuses).unwrap_or_else(|_| "[]".into());
                tx.execute(
                    "INSERT INTO pods (instance_id, name, namespace, status, restart_count, last_restart, container_statuses) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(name, namespace) DO UPDATE SET \
                       instance_id = excluded.instance_id, \
                       status = excluded.status, \
                       restart_count = excluded.restart_count, \
                       last_restart = excluded.last_restart, \
                       container_statuses = excluded.container_statuses, \
                       updated_at = datetime('now')",
                    params![
                        instance_id,
                        pod.name,
                        pod.namespace,
                        pod.status,
                        pod.restart_count,
                        pod.last_restart.as_ref().map(fmt_ts),
                        statuses,
                    ],
                )?;
            }

            Ok(())
        })
    }

    /// Remove an instance; pod rows cascade
    pub fn delete(&self, name: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM milvus_instances WHERE name = ?1",
                params![name],
            )?;
            Ok(())
        })
    }

    pub fn count(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM milvus_instances", [], |row| {
                row.get(0)
            })
            .map_err(Into::into)
        })
    }
}

/// Persistence of coredump records and their analyses
pub struct CoredumpStore<'a> {
    db: &'a Database,
}

impl<'a> CoredumpStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Upsert a coredump record together with its analysis rows
    pub fn save(&self, file: &CoredumpFile) -> Result<()> {
        self.db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO coredump_files (\
                   path, file_name, size, mod_time, pid, uid, gid, signal, timestamp, \
                   executable, boot_id, pod_name, pod_namespace, container_name, instance_name, \
                   is_analyzed, value_score, analysis_time, status, error_message, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21) \
                 ON CONFLICT(path) DO UPDATE SET \
                   size = excluded.size, \
                   mod_time = excluded.mod_time, \
                   pod_name = excluded.pod_name, \
                   pod_namespace = excluded.pod_namespace, \
                   container_name = excluded.container_name, \
                   instance_name = excluded.instance_name, \
                   is_analyzed = excluded.is_analyzed, \
                   value_score = excluded.value_score, \
                   analysis_time = excluded.analysis_time, \
                   status = excluded.status, \
                   error_message = excluded.error_message, \
                   updated_at = datetime('now')",
                params![
                    file.path,
                    file.file_name,
                    file.size,
                    fmt_ts(&file.mod_time),
                    file.pid,
                    file.uid,
                    file.gid,
                    file.signal,
                    fmt_ts(&file.timestamp),
                    file.executable,
                    file.boot_id,
                    file.pod_name,
                    file.pod_namespace,
                    file.container_name,
                    file.instance_name,
                    file.is_analyzed,
                    file.value_score,
                    file.analysis_time.as_ref().map(fmt_ts),
                    file.status.to_string(),
                    file.error_message,
                    fmt_ts(&file.created_at),
                ],
            )?;

            let file_id: i64 = tx.query_row(
                "SELECT id FROM coredump_files WHERE path = ?1",
                params![file.path],
                |row| row.get(0),
            )?;

            if let Some(results) = &file.analysis_results {
                save_analysis_results(tx, file_id, results)?;
            }

            Ok(())
        })
    }

    /// Load a single record by path, with analysis rows when present
    pub fn load(&self, path: &str) -> Result<Option<CoredumpFile>> {
        let file = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT path, file_name, size, mod_time, pid, uid, gid, signal, timestamp, \
                        executable, boot_id, pod_name, pod_namespace, container_name, instance_name, \
                        is_analyzed, value_score, analysis_time, status, error_message, created_at, updated_at \
                 FROM coredump_files WHERE path = ?1",
                params![path],
                scan_coredump_file,
            )
            .optional()
            .map_err(Into::into)
        })?;

        let Some(mut file) = file else {
            return Ok(None);
        };

        file.analysis_results = self.load_analysis_results(path)?;
        Ok(Some(file))
    }

    /// Paths already recorded, used to seed the collector's processed-set
    pub fn processed_paths(&self) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT path FROM coredump_files")?;
            let paths = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(paths)
        })
    }

    pub fn count(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM coredump_files", [], |row| row.get(0))
                .map_err(Into::into)
        })
    }

    /// Dumps whose value score reached the high-value bar (>= 7.0)
    pub fn high_value_count(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM coredump_files WHERE value_score >= 7.0",
                [],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM coredump_files WHERE path = ?1", params![path])?;
            Ok(())
        })
    }

    fn load_analysis_results(&self, path: &str) -> Result<Option<AnalysisResults>> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT ar.stack_trace, ar.crash_reason, ar.crash_address, ar.thread_count, \
                        ar.library_versions, ar.memory_info, ar.register_info, ar.shared_libraries \
                 FROM analysis_results ar \
                 JOIN coredump_files cf ON ar.coredump_file_id = cf.id \
                 WHERE cf.path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i32>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(Into::into)
        })?;

        let Some((stack, reason, address, threads, libs, mem, regs, shared)) = row else {
            return Ok(None);
        };

        let mut results = AnalysisResults {
            stack_trace: stack,
            crash_reason: reason,
            crash_address: address,
            thread_count: threads,
            library_versions: serde_json::from_str(&libs).unwrap_or_default(),
            memory_info: serde_json::from_str(&mem).unwrap_or_default(),
            register_info: serde_json::from_str(&regs).unwrap_or_default(),
            shared_libraries: serde_json::from_str(&shared).unwrap_or_default(),
            ai_analysis: None,
        };

        results.ai_analysis = self.load_ai_results(path)?;
        Ok(Some(results))
    }

    fn load_ai_results(&self, path: &str) -> Result<Option<AIAnalysisResult>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT ai.enabled, ai.provider, ai.model, ai.analysis_time, ai.summary, \
                        ai.root_cause, ai.impact, ai.recommendations, ai.confidence, \
                        ai.tokens_used, ai.cost_usd, ai.error_message, ai.related_issues, \
                        ai.code_suggestions \
                 FROM ai_analysis_results ai \
                 JOIN coredump_files cf ON ai.coredump_file_id = cf.id \
                 WHERE cf.path = ?1",
                params![path],
                |row| {
                    Ok(AIAnalysisResult {
                        enabled: row.get(0)?,
                        provider: row.get(1)?,
                        model: row.get(2)?,
                        analysis_time: row
                            .get::<_, Option<String>>(3)?
                            .map(|s| parse_ts(&s)),
                        summary: row.get(4)?,
                        root_cause: row.get(5)?,
                        impact: row.get(6)?,
                        recommendations: serde_json::from_str(&row.get::<_, String>(7)?)
                            .unwrap_or_default(),
                        confidence: row.get(8)?,
                        tokens_used: row.get(9)?,
                        cost_usd: row.get(10)?,
                        error_message: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
                        related_issues: serde_json::from_str(&row.get::<_, String>(12)?)
                            .unwrap_or_default(),
                        code_suggestions: serde_json::from_str(&row.get::<_, String>(13)?)
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }
}

fn save_analysis_results(
    tx: &rusqlite::Transaction<'_>,
    file_id: i64,
    results: &AnalysisResults,
) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO analysis_results (\
           coredump_file_id, stack_trace, crash_reason, crash_address, thread_count, \
           library_versions, memory_info, register_info, shared_libraries) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            file_id,
            results.stack_trace,
            results.crash_reason,
            results.crash_address,
            results.thread_count,
            serde_json::to_string(&results.library_versions).unwrap_or_else(|_| "{}".into()),
            serde_json::to_string(&results.memory_info).unwrap_or_else(|_| "{}".into()),
            serde_json::to_string(&results.register_info).unwrap_or_else(|_| "{}".into()),
            serde_json::to_string(&results.shared_libraries).unwrap_or_else(|_| "[]".into()),
        ],
    )?;

    if let Some(ai) = &results.ai_analysis {
        tx.execute(
            "INSERT OR REPLACE INTO ai_analysis_results (\
               coredump_file_id, enabled, provider, model, analysis_time, summary, root_cause, \
               impact, recommendations, confidence, tokens_used, cost_usd, error_message, \
               related_issues, code_suggestions) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                file_id,
                ai.enabled,
                ai.provider,
                ai.model,
                ai.analysis_time.as_ref().map(fmt_ts),
                ai.summary,
                ai.root_cause,
                ai.impact,
                serde_json::to_string(&ai.recommendations).unwrap_or_else(|_| "[]".into()),
                ai.confidence,
                ai.tokens_used,
                ai.cost_usd,
                ai.error_message,
                serde_json::to_string(&ai.related_issues).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&ai.code_suggestions).unwrap_or_else(|_| "[]".into()),
            ],
        )?;
    }

    Ok(())
}

fn scan_coredump_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoredumpFile> {
    Ok(CoredumpFile {
        path: row.get(0)?,
        file_name: row.get(1)?,
        size: row.get(2)?,
        mod_time: parse_ts(&row.get::<_, String>(3)?),
        pid: row.get(4)?,
        uid: row.get(5)?,
        gid: row.get(6)?,
        signal: row.get(7)?,
        timestamp: parse_ts(&row.get::<_, String>(8)?),
        executable: row.get(9)?,
        boot_id: row.get(10)?,
        pod_name: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        pod_namespace: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        container_name: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
        instance_name: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        is_analyzed: row.get(15)?,
        value_score: row.get(16)?,
        analysis_time: row.get::<_, Option<String>>(17)?.map(|s| parse_ts(&s)),
        analysis_results: None,
        status: row
            .get::<_, String>(18)?
            .parse()
            .unwrap_or(FileStatus::Error),
        error_message: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>(20)?),
        updated_at: parse_ts(&row.get::<_, String>(21)?),
    })
}

/// Append-only persistence of pipeline event streams
pub struct EventStore<'a> {
    db: &'a Database,
}

impl<'a> EventStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn record_restart(&self, event: &RestartEvent) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO restart_events (\
                   pod_name, pod_namespace, container_name, restart_time, reason, message, \
                   exit_code, signal, instance_name, is_panic) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.pod_name,
                    event.pod_namespace,
                    event.container_name,
                    fmt_ts(&event.restart_time),
                    event.reason,
                    event.message,
                    event.exit_code,
                    event.signal,
                    event.instance_name,
                    event.is_panic,
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_storage(&self, event: &StorageEvent) -> Result<()> {
        let (event_type, dump_path, detail) = match event {
            StorageEvent::FileStored { file } => ("file_stored", Some(file.path.clone()), None),
            StorageEvent::FileDeleted { path } => ("file_deleted", None, Some(path.clone())),
            StorageEvent::StorageError { error } => ("storage_error", None, Some(error.clone())),
            StorageEvent::CleanupDone => ("cleanup_done", None, None),
        };

        self.db.with_conn(|conn| {
            let file_id: Option<i64> = match dump_path {
                Some(path) => conn
                    .query_row(
                        "SELECT id FROM coredump_files WHERE path = ?1",
                        params![path],
                        |row| row.get(0),
                    )
                    .optional()?,
                None => None,
            };

            conn.execute(
                "INSERT INTO storage_events (event_type, coredump_file_id, detail) \
                 VALUES (?1, ?2, ?3)",
                params![event_type, file_id, detail],
            )?;
            Ok(())
        })
    }

    pub fn record_cleanup(&self, event: &CleanupEvent) -> Result<()> {
        let (event_type, instance, namespace, reason, error) = match event {
            CleanupEvent::InstanceUninstalled {
                instance_name,
                namespace,
                reason,
            } => (
                "instance_uninstalled",
                instance_name.clone(),
                namespace.clone(),
                Some(reason.clone()),
                None,
            ),
            CleanupEvent::CleanupSkipped {
                instance_name,
                namespace,
                reason,
            } => (
                "cleanup_skipped",
                instance_name.clone(),
                namespace.clone(),
                Some(reason.clone()),
                None,
            ),
            CleanupEvent::CleanupError {
                instance_name,
                namespace,
                error,
            } => (
                "cleanup_error",
                instance_name.clone(),
                namespace.clone(),
                None,
                Some(error.clone()),
            ),
            CleanupEvent::RestartThresholdExceeded {
                instance_name,
                namespace,
                count,
            } => (
                "restart_threshold_exceeded",
                instance_name.clone(),
                namespace.clone(),
                Some(format!("{} restarts", count)),
                None,
            ),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cleanup_events (event_type, instance_name, namespace, reason, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event_type, instance, namespace, reason, error],
            )?;
            Ok(())
        })
    }
}
