//! SQLite-backed `StoragePort`.
//!
//! Grounded in the teacher's `SqliteTaskQueue` (`orchestrator/queue.rs`):
//! schema created with `CREATE TABLE IF NOT EXISTS`, every operation run on
//! `tokio::task::spawn_blocking`. One adaptation from the teacher's
//! pattern: rather than opening a fresh `rusqlite::Connection` per call (the
//! teacher does this because `SqliteTaskQueue` never needs cross-call
//! serialization), this port holds one connection behind a
//! `std::sync::Mutex` so the `ArmStat` compare-and-swap in §4.3 — "two
//! concurrent updates to the same arm MUST be serialized by the storage
//! layer" — is actually true, and so `storage_dsn = ":memory:"` works.

use crate::domain::{Arm, ArmParams, ArmStat, Cluster, Evaluation, EvaluationParams, EvaluationRun, Log, LockPurpose, LockState, Skill, SkillConfig};
use crate::error::{CoreError, CoreResult};
use crate::ports::storage::{LockGrant, StoragePort};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tokio::task;

pub struct SqliteStoragePort {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStoragePort {
    pub async fn new(dsn: impl Into<String>) -> CoreResult<Self> {
        let dsn = dsn.into();
        let conn = task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&dsn)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS skills (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    config_json TEXT NOT NULL,
                    default_system_prompt TEXT NOT NULL,
                    evaluations_regenerated_at TEXT,
                    optimize_lock_json TEXT NOT NULL,
                    reflect_lock_json TEXT NOT NULL,
                    last_clustering_at TEXT,
                    last_clustering_log_start_time TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS clusters (
                    id TEXT PRIMARY KEY,
                    skill_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    centroid_json TEXT NOT NULL,
                    total_steps INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_clusters_skill ON clusters(skill_id);
                CREATE TABLE IF NOT EXISTS arms (
                    id TEXT PRIMARY KEY,
                    skill_id TEXT NOT NULL,
                    cluster_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    params_json TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_arms_cluster ON arms(cluster_id);
                CREATE TABLE IF NOT EXISTS arm_stats (
                    arm_id TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    n INTEGER NOT NULL,
                    mean REAL NOT NULL,
                    m2 REAL NOT NULL,
                    total_reward REAL NOT NULL
                );
                CREATE TABLE IF NOT EXISTS evaluations (
                    id TEXT PRIMARY KEY,
                    skill_id TEXT NOT NULL,
                    params_json TEXT NOT NULL,
                    weight REAL NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_evaluations_skill ON evaluations(skill_id);
                CREATE TABLE IF NOT EXISTS logs (
                    id TEXT PRIMARY KEY,
                    skill_id TEXT NOT NULL,
                    cluster_id TEXT NOT NULL,
                    arm_id TEXT NOT NULL,
                    request_json TEXT NOT NULL,
                    response_json TEXT NOT NULL,
                    embedding_json TEXT,
                    start_time TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_logs_skill_time ON logs(skill_id, start_time);
                CREATE TABLE IF NOT EXISTS evaluation_runs (
                    id TEXT PRIMARY KEY,
                    log_id TEXT NOT NULL,
                    arm_id TEXT NOT NULL,
                    cluster_id TEXT NOT NULL,
                    results_json TEXT NOT NULL,
                    reward REAL NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_runs_arm ON evaluation_runs(arm_id);
                CREATE TABLE IF NOT EXISTS fencing_tokens (
                    id INTEGER PRIMARY KEY AUTOINCREMENT
                );
                "#,
            )?;
            Ok(conn)
        })
        .await
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?
        .map_err(CoreError::from)?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?
        .map_err(CoreError::from)
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

fn to_json<T: serde::Serialize>(v: &T) -> rusqlite::Result<String> {
    serde_json::to_string(v).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_skill(row: &rusqlite::Row) -> rusqlite::Result<Skill> {
    let config_json: String = row.get(3)?;
    let optimize_lock_json: String = row.get(6)?;
    let reflect_lock_json: String = row.get(7)?;
    Ok(Skill {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        name: row.get(2)?,
        config: from_json::<SkillConfig>(&config_json)?,
        default_system_prompt: row.get(4)?,
        evaluations_regenerated_at: opt_ts(row.get(5)?)?,
        optimize_lock: from_json::<LockState>(&optimize_lock_json)?,
        reflect_lock: from_json::<LockState>(&reflect_lock_json)?,
        last_clustering_at: opt_ts(row.get(8)?)?,
        last_clustering_log_start_time: opt_ts(row.get(9)?)?,
        created_at: parse_ts(&row.get::<_, String>(10)?)?,
        updated_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

const SKILL_COLUMNS: &str = "id, agent_id, name, config_json, default_system_prompt, evaluations_regenerated_at, optimize_lock_json, reflect_lock_json, last_clustering_at, last_clustering_log_start_time, created_at, updated_at";

fn bind_skill(skill: &Skill) -> rusqlite::Result<(String, String, String, String, String, Option<String>, String, String, Option<String>, Option<String>, String, String)> {
    Ok((
        skill.id.clone(),
        skill.agent_id.clone(),
        skill.name.clone(),
        to_json(&skill.config)?,
        skill.default_system_prompt.clone(),
        skill.evaluations_regenerated_at.map(ts),
        to_json(&skill.optimize_lock)?,
        to_json(&skill.reflect_lock)?,
        skill.last_clustering_at.map(ts),
        skill.last_clustering_log_start_time.map(ts),
        ts(skill.created_at),
        ts(skill.updated_at),
    ))
}

#[async_trait]
impl StoragePort for SqliteStoragePort {
    async fn get_skill(&self, skill_id: &str) -> CoreResult<Skill> {
        let skill_id = skill_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(&format!("SELECT {SKILL_COLUMNS} FROM skills WHERE id = ?1"), params![skill_id], row_to_skill)
        })
        .await
    }

    async fn upsert_skill(&self, skill: &Skill) -> CoreResult<()> {
        let bound = bind_skill(skill)?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO skills ({SKILL_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
                     ON CONFLICT(id) DO UPDATE SET agent_id=excluded.agent_id, name=excluded.name, config_json=excluded.config_json,
                         default_system_prompt=excluded.default_system_prompt, evaluations_regenerated_at=excluded.evaluations_regenerated_at,
                         optimize_lock_json=excluded.optimize_lock_json, reflect_lock_json=excluded.reflect_lock_json,
                         last_clustering_at=excluded.last_clustering_at, last_clustering_log_start_time=excluded.last_clustering_log_start_time,
                         updated_at=excluded.updated_at"
                ),
                params![bound.0, bound.1, bound.2, bound.3, bound.4, bound.5, bound.6, bound.7, bound.8, bound.9, bound.10, bound.11],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_skill(&self, skill_id: &str) -> CoreResult<()> {
        let skill_id = skill_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM skills WHERE id = ?1", params![skill_id])?;
            Ok(())
        })
        .await
    }

    async fn get_cluster(&self, cluster_id: &str) -> CoreResult<Cluster> {
        let cluster_id = cluster_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, skill_id, name, centroid_json, total_steps, created_at, updated_at FROM clusters WHERE id = ?1",
                params![cluster_id],
                row_to_cluster,
            )
        })
        .await
    }

    async fn get_clusters_for_skill(&self, skill_id: &str) -> CoreResult<Vec<Cluster>> {
        let skill_id = skill_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id, skill_id, name, centroid_json, total_steps, created_at, updated_at FROM clusters WHERE skill_id = ?1")?;
            let rows = stmt.query_map(params![skill_id], row_to_cluster)?;
            rows.collect()
        })
        .await
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> CoreResult<()> {
        let id = cluster.id.clone();
        let skill_id = cluster.skill_id.clone();
        let name = cluster.name.clone();
        let centroid_json = to_json(&cluster.centroid)?;
        let total_steps = cluster.total_steps as i64;
        let created_at = ts(cluster.created_at);
        let updated_at = ts(cluster.updated_at);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO clusters (id, skill_id, name, centroid_json, total_steps, created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6,?7)
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name, centroid_json=excluded.centroid_json, total_steps=excluded.total_steps, updated_at=excluded.updated_at",
                params![id, skill_id, name, centroid_json, total_steps, created_at, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_cluster(&self, cluster_id: &str) -> CoreResult<()> {
        let cluster_id = cluster_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM clusters WHERE id = ?1", params![cluster_id])?;
            Ok(())
        })
        .await
    }

    async fn increment_cluster_steps(&self, cluster_id: &str) -> CoreResult<()> {
        let cluster_id = cluster_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("UPDATE clusters SET total_steps = total_steps + 1 WHERE id = ?1", params![cluster_id])?;
            if changed == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            Ok(())
        })
        .await
    }

    async fn get_arm(&self, arm_id: &str) -> CoreResult<Arm> {
        let arm_id = arm_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, skill_id, cluster_id, name, params_json, created_at, updated_at FROM arms WHERE id = ?1",
                params![arm_id],
                row_to_arm,
            )
        })
        .await
    }

    async fn get_arms_for_cluster(&self, cluster_id: &str) -> CoreResult<Vec<Arm>> {
        let cluster_id = cluster_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id, skill_id, cluster_id, name, params_json, created_at, updated_at FROM arms WHERE cluster_id = ?1")?;
            let rows = stmt.query_map(params![cluster_id], row_to_arm)?;
            rows.collect()
        })
        .await
    }

    async fn upsert_arm(&self, arm: &Arm) -> CoreResult<()> {
        let id = arm.id.clone();
        let skill_id = arm.skill_id.clone();
        let cluster_id = arm.cluster_id.clone();
        let name = arm.name.clone();
        let params_json = to_json(&arm.params)?;
        let created_at = ts(arm.created_at);
        let updated_at = ts(arm.updated_at);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO arms (id, skill_id, cluster_id, name, params_json, created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6,?7)
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name, params_json=excluded.params_json, updated_at=excluded.updated_at",
                params![id, skill_id, cluster_id, name, params_json, created_at, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_arm(&self, arm_id: &str) -> CoreResult<()> {
        let arm_id = arm_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM arms WHERE id = ?1", params![arm_id])?;
            conn.execute("DELETE FROM arm_stats WHERE arm_id = ?1", params![arm_id])?;
            Ok(())
        })
        .await
    }

    async fn get_arm_stat(&self, arm_id: &str) -> CoreResult<ArmStat> {
        let arm_id = arm_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT version, n, mean, m2, total_reward FROM arm_stats WHERE arm_id = ?1",
                params![arm_id],
                |row| {
                    Ok(ArmStat {
                        version: row.get(0)?,
                        n: row.get(1)?,
                        mean: row.get(2)?,
                        m2: row.get(3)?,
                        total_reward: row.get(4)?,
                    })
                },
            )
            .optional()
            .map(|opt| opt.unwrap_or_default())
        })
        .await
    }

    async fn cas_arm_stat(&self, arm_id: &str, expected_version: u64, new_stat: &ArmStat) -> CoreResult<()> {
        let arm_id = arm_id.to_string();
        let new_stat = *new_stat;
        let conn = self.conn.clone();
        task::spawn_blocking(move || -> CoreResult<()> {
            let conn = conn.lock().expect("sqlite mutex poisoned");
            let current_version: Option<i64> = conn
                .query_row("SELECT version FROM arm_stats WHERE arm_id = ?1", params![arm_id], |row| row.get(0))
                .optional()
                .map_err(CoreError::from)?;
            let current_version = current_version.unwrap_or(0) as u64;
            if current_version != expected_version {
                return Err(CoreError::ConflictingUpdate { entity: format!("arm_stat:{arm_id}") });
            }
            conn.execute(
                "INSERT INTO arm_stats (arm_id, version, n, mean, m2, total_reward) VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(arm_id) DO UPDATE SET version=excluded.version, n=excluded.n, mean=excluded.mean, m2=excluded.m2, total_reward=excluded.total_reward",
                params![arm_id, new_stat.version as i64, new_stat.n as i64, new_stat.mean, new_stat.m2, new_stat.total_reward],
            )
            .map_err(CoreError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?
    }

    async fn reset_arm_stats(&self, arm_id: &str) -> CoreResult<()> {
        let arm_id = arm_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO arm_stats (arm_id, version, n, mean, m2, total_reward) VALUES (?1,0,0,0,0,0)
                 ON CONFLICT(arm_id) DO UPDATE SET version=0, n=0, mean=0, m2=0, total_reward=0",
                params![arm_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_evaluations_for_skill(&self, skill_id: &str) -> CoreResult<Vec<Evaluation>> {
        let skill_id = skill_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id, skill_id, params_json, weight, created_at, updated_at FROM evaluations WHERE skill_id = ?1")?;
            let rows = stmt.query_map(params![skill_id], row_to_evaluation)?;
            rows.collect()
        })
        .await
    }

    async fn replace_evaluations(&self, skill_id: &str, evaluations: &[Evaluation]) -> CoreResult<()> {
        let skill_id = skill_id.to_string();
        let evaluations = evaluations.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM evaluations WHERE skill_id = ?1", params![skill_id])?;
            for evaluation in &evaluations {
                tx.execute(
                    "INSERT INTO evaluations (id, skill_id, params_json, weight, created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        evaluation.id,
                        evaluation.skill_id,
                        to_json(&evaluation.params)?,
                        evaluation.weight,
                        ts(evaluation.created_at),
                        ts(evaluation.updated_at),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn upsert_log(&self, log: &Log) -> CoreResult<()> {
        let id = log.id.clone();
        let skill_id = log.skill_id.clone();
        let cluster_id = log.cluster_id.clone();
        let arm_id = log.arm_id.clone();
        let request_json = to_json(&log.request_body)?;
        let response_json = to_json(&log.response_body)?;
        let embedding_json = log.embedding.as_ref().map(to_json).transpose()?;
        let start_time = ts(log.start_time);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO logs (id, skill_id, cluster_id, arm_id, request_json, response_json, embedding_json, start_time) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                 ON CONFLICT(id) DO UPDATE SET embedding_json=excluded.embedding_json",
                params![id, skill_id, cluster_id, arm_id, request_json, response_json, embedding_json, start_time],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_log(&self, log_id: &str) -> CoreResult<Log> {
        let log_id = log_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, skill_id, cluster_id, arm_id, request_json, response_json, embedding_json, start_time FROM logs WHERE id = ?1",
                params![log_id],
                row_to_log,
            )
        })
        .await
    }

    async fn count_logs_with_embedding(&self, skill_id: &str) -> CoreResult<u64> {
        let skill_id = skill_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE skill_id = ?1 AND embedding_json IS NOT NULL",
                params![skill_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn get_logs_for_skill(
        &self,
        skill_id: &str,
        after_start_time: Option<DateTime<Utc>>,
        embedding_not_null: bool,
        limit: usize,
    ) -> CoreResult<Vec<Log>> {
        let skill_id = skill_id.to_string();
        let after = after_start_time.map(ts);
        let limit = limit as i64;
        self.with_conn(move |conn| {
            let mut sql = "SELECT id, skill_id, cluster_id, arm_id, request_json, response_json, embedding_json, start_time FROM logs WHERE skill_id = ?".to_string();
            if embedding_not_null {
                sql.push_str(" AND embedding_json IS NOT NULL");
            }
            if after.is_some() {
                sql.push_str(" AND start_time > ?");
            }
            sql.push_str(" ORDER BY start_time ASC LIMIT ?");

            let mut binds: Vec<&dyn rusqlite::ToSql> = vec![&skill_id];
            if let Some(after) = &after {
                binds.push(after);
            }
            binds.push(&limit);

            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(binds.as_slice(), row_to_log)?.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    async fn append_evaluation_run(&self, run: &EvaluationRun) -> CoreResult<()> {
        let id = run.id.clone();
        let log_id = run.log_id.clone();
        let arm_id = run.arm_id.clone();
        let cluster_id = run.cluster_id.clone();
        let results_json = to_json(&run.results)?;
        let reward = run.reward;
        let created_at = ts(run.created_at);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO evaluation_runs (id, log_id, arm_id, cluster_id, results_json, reward, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![id, log_id, arm_id, cluster_id, results_json, reward, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_evaluation_runs_for_arm(&self, arm_id: &str) -> CoreResult<u64> {
        let arm_id = arm_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM evaluation_runs WHERE arm_id = ?1", params![arm_id], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn get_evaluation_runs_for_arm(&self, arm_id: &str) -> CoreResult<Vec<EvaluationRun>> {
        let arm_id = arm_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, log_id, arm_id, cluster_id, results_json, reward, created_at FROM evaluation_runs WHERE arm_id = ?1",
            )?;
            let rows = stmt.query_map(params![arm_id], row_to_evaluation_run)?;
            rows.collect()
        })
        .await
    }

    async fn try_acquire_lock(&self, skill_id: &str, purpose: LockPurpose, ttl_secs: u64, now: DateTime<Utc>) -> CoreResult<LockGrant> {
        let skill_id = skill_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut skill = tx.query_row(&format!("SELECT {SKILL_COLUMNS} FROM skills WHERE id = ?1"), params![&skill_id], row_to_skill)?;

            let lock = skill.lock_state(purpose).clone();
            if let Some(acquired_at) = lock.acquired_at {
                if (now - acquired_at).num_seconds() < ttl_secs as i64 {
                    return Ok(LockGrant { acquired: false, fencing_token: lock.fencing_token.unwrap_or(0) });
                }
            }

            tx.execute("INSERT INTO fencing_tokens DEFAULT VALUES", [])?;
            let token = tx.last_insert_rowid() as u64;

            skill.lock_state_mut(purpose).acquired_at = Some(now);
            skill.lock_state_mut(purpose).fencing_token = Some(token);
            let bound = bind_skill(&skill)?;
            tx.execute(
                "UPDATE skills SET optimize_lock_json = ?1, reflect_lock_json = ?2 WHERE id = ?3",
                params![bound.6, bound.7, skill_id],
            )?;
            tx.commit()?;
            Ok(LockGrant { acquired: true, fencing_token: token })
        })
        .await
    }

    async fn release_lock(&self, skill_id: &str, purpose: LockPurpose, token: u64, updated_skill: &Skill) -> CoreResult<()> {
        let skill_id = skill_id.to_string();
        let mut updated_skill = updated_skill.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let current = tx.query_row(&format!("SELECT {SKILL_COLUMNS} FROM skills WHERE id = ?1"), params![&skill_id], row_to_skill)?;

            if current.lock_state(purpose).fencing_token != Some(token) {
                // Stale holder: ignored, per spec §4.1.
                return Ok(());
            }

            updated_skill.lock_state_mut(purpose).acquired_at = None;
            let bound = bind_skill(&updated_skill)?;
            tx.execute(
                "UPDATE skills SET agent_id=?2, name=?3, config_json=?4, default_system_prompt=?5, evaluations_regenerated_at=?6,
                    optimize_lock_json=?7, reflect_lock_json=?8, last_clustering_at=?9, last_clustering_log_start_time=?10, created_at=?11, updated_at=?12
                 WHERE id = ?1",
                params![bound.0, bound.1, bound.2, bound.3, bound.4, bound.5, bound.6, bound.7, bound.8, bound.9, bound.10, bound.11],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn row_to_cluster(row: &rusqlite::Row) -> rusqlite::Result<Cluster> {
    let centroid_json: String = row.get(3)?;
    Ok(Cluster {
        id: row.get(0)?,
        skill_id: row.get(1)?,
        name: row.get(2)?,
        centroid: from_json(&centroid_json)?,
        total_steps: row.get::<_, i64>(4)? as u64,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
        updated_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

fn row_to_arm(row: &rusqlite::Row) -> rusqlite::Result<Arm> {
    let params_json: String = row.get(4)?;
    Ok(Arm {
        id: row.get(0)?,
        skill_id: row.get(1)?,
        cluster_id: row.get(2)?,
        name: row.get(3)?,
        params: from_json::<ArmParams>(&params_json)?,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
        updated_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

fn row_to_evaluation(row: &rusqlite::Row) -> rusqlite::Result<Evaluation> {
    let params_json: String = row.get(2)?;
    Ok(Evaluation {
        id: row.get(0)?,
        skill_id: row.get(1)?,
        params: from_json::<EvaluationParams>(&params_json)?,
        weight: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?)?,
        updated_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<Log> {
    let request_json: String = row.get(4)?;
    let response_json: String = row.get(5)?;
    let embedding_json: Option<String> = row.get(6)?;
    Ok(Log {
        id: row.get(0)?,
        skill_id: row.get(1)?,
        cluster_id: row.get(2)?,
        arm_id: row.get(3)?,
        request_body: from_json(&request_json)?,
        response_body: from_json(&response_json)?,
        embedding: embedding_json.map(|s| from_json::<Vec<f32>>(&s)).transpose()?,
        start_time: parse_ts(&row.get::<_, String>(7)?)?,
    })
}

fn row_to_evaluation_run(row: &rusqlite::Row) -> rusqlite::Result<EvaluationRun> {
    let results_json: String = row.get(4)?;
    Ok(EvaluationRun {
        id: row.get(0)?,
        log_id: row.get(1)?,
        arm_id: row.get(2)?,
        cluster_id: row.get(3)?,
        results: from_json(&results_json)?,
        reward: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{new_id, Arm, ArmParams, Cluster, LockPurpose, Skill, SkillConfig};
    use std::collections::BTreeSet;
    use tempfile::NamedTempFile;

    fn skill_config() -> SkillConfig {
        SkillConfig {
            configuration_count: 3,
            clustering_interval: 100,
            reflection_min_requests_per_arm: 10,
            exploration_temperature: 1.0,
            allowed_template_variables: BTreeSet::new(),
            optimize: true,
        }
    }

    #[tokio::test]
    async fn upsert_and_read_skill_round_trips() {
        let temp = NamedTempFile::new().unwrap();
        let storage = SqliteStoragePort::new(temp.path().to_str().unwrap()).await.unwrap();

        let skill = Skill::new(new_id(), "greeter".to_string(), skill_config(), "You are a greeter.".to_string());
        storage.upsert_skill(&skill).await.unwrap();

        let fetched = storage.get_skill(&skill.id).await.unwrap();
        assert_eq!(fetched.name, "greeter");
        assert_eq!(fetched.config.configuration_count, 3);
    }

    #[tokio::test]
    async fn cas_arm_stat_rejects_stale_version() {
        let temp = NamedTempFile::new().unwrap();
        let storage = SqliteStoragePort::new(temp.path().to_str().unwrap()).await.unwrap();

        let arm_id = new_id();
        let stat = storage.get_arm_stat(&arm_id).await.unwrap();
        assert_eq!(stat.version, 0);

        let updated = stat.with_reward(0.8);
        storage.cas_arm_stat(&arm_id, 0, &updated).await.unwrap();

        // Retrying with the now-stale expected_version must fail.
        let err = storage.cas_arm_stat(&arm_id, 0, &updated.with_reward(0.5)).await.unwrap_err();
        assert!(matches!(err, CoreError::ConflictingUpdate { .. }));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_expired() {
        let temp = NamedTempFile::new().unwrap();
        let storage = SqliteStoragePort::new(temp.path().to_str().unwrap()).await.unwrap();

        let skill = Skill::new(new_id(), "greeter".to_string(), skill_config(), "prompt".to_string());
        storage.upsert_skill(&skill).await.unwrap();

        let now = Utc::now();
        let grant = storage.try_acquire_lock(&skill.id, LockPurpose::Optimize, 600, now).await.unwrap();
        assert!(grant.acquired);

        let second = storage.try_acquire_lock(&skill.id, LockPurpose::Optimize, 600, now).await.unwrap();
        assert!(!second.acquired);

        storage.release_lock(&skill.id, LockPurpose::Optimize, grant.fencing_token, &skill).await.unwrap();
        let reacquired = storage.try_acquire_lock(&skill.id, LockPurpose::Optimize, 600, now).await.unwrap();
        assert!(reacquired.acquired);
        assert_ne!(reacquired.fencing_token, grant.fencing_token);
    }

    #[tokio::test]
    async fn arm_and_cluster_round_trip() {
        let temp = NamedTempFile::new().unwrap();
        let storage = SqliteStoragePort::new(temp.path().to_str().unwrap()).await.unwrap();

        let skill_id = new_id();
        let cluster = Cluster::new(skill_id.clone(), "default".to_string(), vec![0.0; 8]);
        storage.upsert_cluster(&cluster).await.unwrap();
        storage.increment_cluster_steps(&cluster.id).await.unwrap();

        let fetched_cluster = storage.get_cluster(&cluster.id).await.unwrap();
        assert_eq!(fetched_cluster.total_steps, 1);

        let arm = Arm::new(skill_id, cluster.id.clone(), "seed".to_string(), ArmParams::seed("prompt".to_string(), "gpt".to_string()));
        storage.upsert_arm(&arm).await.unwrap();
        let arms = storage.get_arms_for_cluster(&cluster.id).await.unwrap();
        assert_eq!(arms.len(), 1);
        assert_eq!(arms[0].params.model_id, "gpt");
    }
}
