use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::errors::EngineError;
use crate::metrics::{normalize_rate, reduce};
use crate::model::{
    ClaimOutcome, CostRecord, CustomScoringFunction, EvaluationRun, EvaluationSuite,
    FunctionMetadata, NotificationEvent, RunMetrics, RunStatus, TenantMetrics, TestCaseResult,
};

/// Adapter over the backing document store. All run lifecycle transitions go
/// through single-transaction read-modify-writes here; that is the engine's
/// only concurrency-safety mechanism, so no method may split a status check
/// and its write across two transactions.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// A stored fire-and-forget notification, as read back for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct StoredNotification {
    pub id: i64,
    pub tenant: String,
    pub kind: String,
    pub resource_type: String,
    pub resource_id: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(crate::storage::schema::DDL)?;
        Ok(())
    }

    // --- suites ---

    /// Insert or update a suite keyed by `(tenant, name)`. Returns the suite id.
    pub fn put_suite(&self, suite: &EvaluationSuite) -> Result<i64, EngineError> {
        suite.validate()?;
        let conn = self.conn.lock().unwrap();
        let now = now();
        conn.execute(
            "INSERT INTO suites(tenant, name, cases_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(tenant, name) DO UPDATE SET
               cases_json=excluded.cases_json, updated_at=excluded.updated_at",
            params![
                suite.tenant,
                suite.name,
                serde_json::to_string(&suite.test_cases)?,
                now
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM suites WHERE tenant=?1 AND name=?2",
            params![suite.tenant, suite.name],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn get_suite(&self, tenant: &str, id: i64) -> Result<EvaluationSuite, EngineError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT name, cases_json FROM suites WHERE id=?1 AND tenant=?2",
                params![id, tenant],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((name, cases_json)) = row else {
            return Err(EngineError::not_found("suite", id));
        };
        Ok(EvaluationSuite {
            id,
            tenant: tenant.to_string(),
            name,
            test_cases: serde_json::from_str(&cases_json)?,
        })
    }

    pub fn suite_by_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<EvaluationSuite>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, cases_json FROM suites WHERE tenant=?1 AND name=?2",
                params![tenant, name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, cases_json)) => Ok(Some(EvaluationSuite {
                id,
                tenant: tenant.to_string(),
                name: name.to_string(),
                test_cases: serde_json::from_str(&cases_json)?,
            })),
        }
    }

    // --- run lifecycle ---

    /// Create a PENDING run against an existing suite of the same tenant.
    pub fn create_run(
        &self,
        tenant: &str,
        suite_id: i64,
        version_id: &str,
        triggered_by: Option<&str>,
    ) -> Result<i64, EngineError> {
        if version_id.trim().is_empty() {
            return Err(EngineError::Validation("version_id is empty".into()));
        }
        let conn = self.conn.lock().unwrap();
        let suite: Option<i64> = conn
            .query_row(
                "SELECT id FROM suites WHERE id=?1 AND tenant=?2",
                params![suite_id, tenant],
                |r| r.get(0),
            )
            .optional()?;
        if suite.is_none() {
            return Err(EngineError::not_found("suite", suite_id));
        }
        conn.execute(
            "INSERT INTO runs(tenant, suite_id, version_id, status, triggered_by, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
            params![tenant, suite_id, version_id, triggered_by, now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, id: i64) -> Result<EvaluationRun, EngineError> {
        let conn = self.conn.lock().unwrap();
        let raw = fetch_run_raw(&conn, id)?;
        let Some(raw) = raw else {
            return Err(EngineError::not_found("run", id));
        };
        raw.into_run()
    }

    /// Take a PENDING run for execution. One transactional read-modify-write:
    /// writes RUNNING + started_at iff the observed status is PENDING,
    /// otherwise makes no write and reports what it saw. Exactly one of N
    /// concurrent claimers wins.
    pub fn claim_pending(&self, id: i64) -> Result<ClaimOutcome, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(status) = run_status(&tx, id)? else {
            return Err(EngineError::not_found("run", id));
        };
        if status != RunStatus::Pending {
            return Ok(ClaimOutcome {
                claimed: false,
                status,
            });
        }
        tx.execute(
            "UPDATE runs SET status='running', started_at=?1 WHERE id=?2",
            params![now(), id],
        )?;
        tx.commit()?;
        Ok(ClaimOutcome {
            claimed: true,
            status: RunStatus::Running,
        })
    }

    /// Commit results for a RUNNING run. If a concurrent cancel already moved
    /// the run to CANCELLED, the computed results are discarded and the
    /// stored record is left untouched. Any other non-RUNNING status is a
    /// state machine violation.
    pub fn finalize_completed(
        &self,
        id: i64,
        results: &[TestCaseResult],
        metrics: &RunMetrics,
    ) -> Result<RunStatus, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(status) = run_status(&tx, id)? else {
            return Err(EngineError::not_found("run", id));
        };
        match status {
            RunStatus::Cancelled => Ok(RunStatus::Cancelled),
            RunStatus::Running => {
                tx.execute(
                    "UPDATE runs SET status='completed', results_json=?1, overall_score=?2,
                     pass_rate=?3, avg_execution_ms=?4, completed_at=?5 WHERE id=?6",
                    params![
                        serde_json::to_string(results)?,
                        metrics.overall_score,
                        metrics.pass_rate,
                        metrics.avg_execution_ms,
                        now(),
                        id
                    ],
                )?;
                tx.commit()?;
                Ok(RunStatus::Completed)
            }
            other => Err(EngineError::Invariant(format!(
                "cannot complete run {id} from status {other}"
            ))),
        }
    }

    /// Best-effort failure record: writes FAILED only from RUNNING. Returns
    /// whether a write happened.
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<bool, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(status) = run_status(&tx, id)? else {
            return Ok(false);
        };
        if status != RunStatus::Running {
            return Ok(false);
        }
        tx.execute(
            "UPDATE runs SET status='failed', error=?1, completed_at=?2 WHERE id=?3",
            params![error, now(), id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Cancel a run iff it has not already reached a terminal status.
    pub fn cancel_run(&self, id: i64) -> Result<bool, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(status) = run_status(&tx, id)? else {
            return Err(EngineError::not_found("run", id));
        };
        if status.is_terminal() {
            return Ok(false);
        }
        tx.execute(
            "UPDATE runs SET status='cancelled', completed_at=?1 WHERE id=?2",
            params![now(), id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // --- queries ---

    /// Ids of PENDING runs for one tenant, oldest first.
    pub fn pending_runs(&self, tenant: &str, limit: u32) -> Result<Vec<i64>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM runs WHERE tenant=?1 AND status='pending' ORDER BY id ASC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![tenant, limit])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    pub fn tenants_with_pending(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT DISTINCT tenant FROM runs WHERE status='pending' ORDER BY tenant")?;
        let mut rows = stmt.query([])?;
        let mut tenants = Vec::new();
        while let Some(row) = rows.next()? {
            tenants.push(row.get(0)?);
        }
        Ok(tenants)
    }

    pub fn runs_for_suite(
        &self,
        tenant: &str,
        suite_id: i64,
    ) -> Result<Vec<EvaluationRun>, EngineError> {
        self.query_runs(
            "SELECT id, tenant, suite_id, version_id, status, results_json, overall_score,
             pass_rate, avg_execution_ms, error, triggered_by, created_at, started_at, completed_at
             FROM runs WHERE tenant=?1 AND suite_id=?2 ORDER BY id DESC",
            params![tenant, suite_id],
        )
    }

    pub fn runs_for_version(
        &self,
        tenant: &str,
        version_id: &str,
    ) -> Result<Vec<EvaluationRun>, EngineError> {
        self.query_runs(
            "SELECT id, tenant, suite_id, version_id, status, results_json, overall_score,
             pass_rate, avg_execution_ms, error, triggered_by, created_at, started_at, completed_at
             FROM runs WHERE tenant=?1 AND version_id=?2 ORDER BY id DESC",
            params![tenant, version_id],
        )
    }

    fn query_runs(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<EvaluationRun>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(args, RunRaw::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RunRaw::into_run).collect()
    }

    // --- metrics reads ---

    /// Aggregate for one run's stored results. Counts come from the result
    /// rows; rate fields prefer the stored (already normalized on read)
    /// aggregates when present.
    pub fn run_metrics(&self, id: i64) -> Result<RunMetrics, EngineError> {
        let run = self.get_run(id)?;
        let Some(results) = run.results.as_deref() else {
            return Err(EngineError::Validation(format!(
                "run {id} has no results to aggregate (status is {})",
                run.status
            )));
        };
        let reduced = reduce(results);
        Ok(RunMetrics {
            pass_rate: run.pass_rate.unwrap_or(reduced.pass_rate),
            overall_score: run.overall_score.unwrap_or(reduced.overall_score),
            avg_execution_ms: run.avg_execution_ms.unwrap_or(reduced.avg_execution_ms),
            ..reduced
        })
    }

    /// Per-tenant roll-up. Rates are normalized value by value before
    /// averaging, since historical rows mix 0-1 and 0-100 scales.
    pub fn tenant_metrics(&self, tenant: &str) -> Result<TenantMetrics, EngineError> {
        let conn = self.conn.lock().unwrap();

        let mut counts = TenantMetrics {
            tenant: tenant.to_string(),
            total_runs: 0,
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            avg_pass_rate: 0.0,
            avg_overall_score: 0.0,
        };
        {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM runs WHERE tenant=?1 GROUP BY status")?;
            let mut rows = stmt.query(params![tenant])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let n: u64 = row.get::<_, i64>(1)? as u64;
                counts.total_runs += n;
                match RunStatus::parse(&status) {
                    Some(RunStatus::Pending) => counts.pending += n,
                    Some(RunStatus::Running) => counts.running += n,
                    Some(RunStatus::Completed) => counts.completed += n,
                    Some(RunStatus::Failed) => counts.failed += n,
                    Some(RunStatus::Cancelled) => counts.cancelled += n,
                    None => {
                        return Err(EngineError::Storage(format!(
                            "unknown run status '{status}' in store"
                        )))
                    }
                }
            }
        }

        let mut pass_rates = Vec::new();
        let mut scores = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT pass_rate, overall_score FROM runs WHERE tenant=?1 AND status='completed'",
        )?;
        let mut rows = stmt.query(params![tenant])?;
        while let Some(row) = rows.next()? {
            if let Some(v) = row.get::<_, Option<f64>>(0)? {
                pass_rates.push(normalize_rate(v));
            }
            if let Some(v) = row.get::<_, Option<f64>>(1)? {
                scores.push(normalize_rate(v));
            }
        }
        counts.avg_pass_rate = mean(&pass_rates);
        counts.avg_overall_score = mean(&scores);
        Ok(counts)
    }

    /// One-shot batch correction for legacy percentage-scale rate columns.
    /// Returns how many runs were rewritten.
    pub fn normalize_historical(&self) -> Result<usize, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut fixes: Vec<(i64, Option<f64>, Option<f64>)> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, pass_rate, overall_score FROM runs
                 WHERE (pass_rate IS NOT NULL AND ABS(pass_rate) > 1.0)
                    OR (overall_score IS NOT NULL AND ABS(overall_score) > 1.0)",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let pass_rate: Option<f64> = row.get(1)?;
                let overall: Option<f64> = row.get(2)?;
                fixes.push((
                    id,
                    pass_rate.map(normalize_rate),
                    overall.map(normalize_rate),
                ));
            }
        }
        let rewritten = fixes.len();
        for (id, pass_rate, overall) in fixes {
            tx.execute(
                "UPDATE runs SET pass_rate=?1, overall_score=?2 WHERE id=?3",
                params![pass_rate, overall, id],
            )?;
        }
        tx.commit()?;
        Ok(rewritten)
    }

    // --- custom scoring functions ---

    /// Register a new function. `(tenant, name)` is unique; a duplicate is a
    /// validation error, not an overwrite.
    pub fn insert_function(
        &self,
        tenant: &str,
        name: &str,
        code: &str,
        code_sha256: &str,
        metadata: &FunctionMetadata,
    ) -> Result<CustomScoringFunction, EngineError> {
        let conn = self.conn.lock().unwrap();
        let now = now();
        let inserted = conn.execute(
            "INSERT INTO scoring_functions(tenant, name, code, code_sha256, version, is_active,
             metadata_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, 1, ?5, ?6, ?6)",
            params![
                tenant,
                name,
                code,
                code_sha256,
                serde_json::to_string(metadata)?,
                now
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(EngineError::Validation(format!(
                    "scoring function '{name}' already exists for tenant '{tenant}'"
                )))
            }
            Err(e) => return Err(e.into()),
        }
        Ok(CustomScoringFunction {
            id: conn.last_insert_rowid(),
            tenant: tenant.to_string(),
            name: name.to_string(),
            code: code.to_string(),
            code_sha256: code_sha256.to_string(),
            version: 1,
            is_active: true,
            metadata: metadata.clone(),
        })
    }

    pub fn function_by_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<CustomScoringFunction>, EngineError> {
        let conn = self.conn.lock().unwrap();
        fetch_function(
            &conn,
            "SELECT id, tenant, name, code, code_sha256, version, is_active, metadata_json
             FROM scoring_functions WHERE tenant=?1 AND name=?2",
            params![tenant, name],
        )
    }

    pub fn function_by_id(&self, id: i64) -> Result<CustomScoringFunction, EngineError> {
        let conn = self.conn.lock().unwrap();
        fetch_function(
            &conn,
            "SELECT id, tenant, name, code, code_sha256, version, is_active, metadata_json
             FROM scoring_functions WHERE id=?1",
            params![id],
        )?
        .ok_or_else(|| EngineError::not_found("scoring function", id))
    }

    /// Replace a function's code. The version bumps only when the digest
    /// actually changed; resubmitting identical code is a no-op.
    pub fn update_function_code(
        &self,
        tenant: &str,
        name: &str,
        code: &str,
        code_sha256: &str,
    ) -> Result<CustomScoringFunction, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = fetch_function(
            &tx,
            "SELECT id, tenant, name, code, code_sha256, version, is_active, metadata_json
             FROM scoring_functions WHERE tenant=?1 AND name=?2",
            params![tenant, name],
        )?
        .ok_or_else(|| EngineError::not_found("scoring function", name))?;

        if current.code_sha256 == code_sha256 {
            return Ok(current);
        }
        let version = current.version + 1;
        tx.execute(
            "UPDATE scoring_functions SET code=?1, code_sha256=?2, version=?3, updated_at=?4
             WHERE id=?5",
            params![code, code_sha256, version, now(), current.id],
        )?;
        tx.commit()?;
        Ok(CustomScoringFunction {
            code: code.to_string(),
            code_sha256: code_sha256.to_string(),
            version,
            ..current
        })
    }

    pub fn set_function_active(
        &self,
        tenant: &str,
        name: &str,
        active: bool,
    ) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE scoring_functions SET is_active=?1, updated_at=?2 WHERE tenant=?3 AND name=?4",
            params![active as i64, now(), tenant, name],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("scoring function", name));
        }
        Ok(())
    }

    // --- collaborator sinks ---

    pub fn record_cost(&self, record: &CostRecord) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cost_ledger(tenant, run_id, tokens, cost_usd, source, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.tenant,
                record.run_id,
                record.tokens as i64,
                record.cost_usd,
                record.source,
                now()
            ],
        )?;
        Ok(())
    }

    pub fn costs_for_run(&self, run_id: i64) -> Result<Vec<CostRecord>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tenant, run_id, tokens, cost_usd, source FROM cost_ledger
             WHERE run_id=?1 ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map(params![run_id], |row| {
                Ok(CostRecord {
                    tenant: row.get(0)?,
                    run_id: row.get(1)?,
                    tokens: row.get::<_, i64>(2)? as u64,
                    cost_usd: row.get(3)?,
                    source: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn insert_notification(&self, event: &NotificationEvent) -> Result<i64, EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications(tenant, kind, resource_type, resource_id, payload_json,
             created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.tenant,
                event.kind.as_str(),
                event.resource_type,
                event.resource_id,
                serde_json::to_string(&event.payload)?,
                now()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn notifications_for_tenant(
        &self,
        tenant: &str,
        limit: u32,
    ) -> Result<Vec<StoredNotification>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant, kind, resource_type, resource_id, payload_json, created_at
             FROM notifications WHERE tenant=?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let raws = stmt
            .query_map(params![tenant, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(raws.len());
        for (id, tenant, kind, resource_type, resource_id, payload_json, created_at) in raws {
            out.push(StoredNotification {
                id,
                tenant,
                kind,
                resource_type,
                resource_id,
                payload: serde_json::from_str(&payload_json)?,
                created_at,
            });
        }
        Ok(out)
    }
}

/// Raw runs row before JSON decoding and rate normalization.
struct RunRaw {
    id: i64,
    tenant: String,
    suite_id: i64,
    version_id: String,
    status: String,
    results_json: Option<String>,
    overall_score: Option<f64>,
    pass_rate: Option<f64>,
    avg_execution_ms: Option<f64>,
    error: Option<String>,
    triggered_by: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RunRaw {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RunRaw {
            id: row.get(0)?,
            tenant: row.get(1)?,
            suite_id: row.get(2)?,
            version_id: row.get(3)?,
            status: row.get(4)?,
            results_json: row.get(5)?,
            overall_score: row.get(6)?,
            pass_rate: row.get(7)?,
            avg_execution_ms: row.get(8)?,
            error: row.get(9)?,
            triggered_by: row.get(10)?,
            created_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    fn into_run(self) -> Result<EvaluationRun, EngineError> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            EngineError::Storage(format!(
                "run {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        let results: Option<Vec<TestCaseResult>> = match self.results_json.as_deref() {
            None => None,
            Some(s) => Some(serde_json::from_str(s)?),
        };
        Ok(EvaluationRun {
            id: self.id,
            tenant: self.tenant,
            suite_id: self.suite_id,
            version_id: self.version_id,
            status,
            results,
            overall_score: self.overall_score.map(normalize_rate),
            pass_rate: self.pass_rate.map(normalize_rate),
            avg_execution_ms: self.avg_execution_ms,
            error: self.error,
            triggered_by: self.triggered_by,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

fn fetch_run_raw(conn: &Connection, id: i64) -> Result<Option<RunRaw>, EngineError> {
    let raw = conn
        .query_row(
            "SELECT id, tenant, suite_id, version_id, status, results_json, overall_score,
             pass_rate, avg_execution_ms, error, triggered_by, created_at, started_at, completed_at
             FROM runs WHERE id=?1",
            params![id],
            RunRaw::from_row,
        )
        .optional()?;
    Ok(raw)
}

fn run_status(conn: &Connection, id: i64) -> Result<Option<RunStatus>, EngineError> {
    let raw: Option<String> = conn
        .query_row("SELECT status FROM runs WHERE id=?1", params![id], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => RunStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| EngineError::Storage(format!("run {id} has unknown status '{s}'"))),
    }
}

fn fetch_function(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Option<CustomScoringFunction>, EngineError> {
    let raw: Option<(i64, String, String, String, String, u32, bool, Option<String>)> = conn
        .query_row(sql, args, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })
        .optional()?;
    let Some((id, tenant, name, code, code_sha256, version, is_active, metadata_json)) = raw
    else {
        return Ok(None);
    };
    let metadata: FunctionMetadata = match metadata_json.as_deref() {
        None => FunctionMetadata::default(),
        Some(s) => serde_json::from_str(s)?,
    };
    Ok(Some(CustomScoringFunction {
        id,
        tenant,
        name,
        code,
        code_sha256,
        version,
        is_active,
        metadata,
    }))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NotificationKind, ScoringCriteria, TestCase};

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s
    }

    fn suite(tenant: &str, name: &str) -> EvaluationSuite {
        EvaluationSuite {
            id: 0,
            tenant: tenant.into(),
            name: name.into(),
            test_cases: vec![TestCase {
                id: "t1".into(),
                name: "first".into(),
                input: serde_json::json!({"q": "2+2"}),
                expected_output: serde_json::json!("4"),
                criteria: Some(ScoringCriteria::ExactMatch),
            }],
        }
    }

    fn result(id: &str, passed: bool, score: f64) -> TestCaseResult {
        TestCaseResult {
            test_case_id: id.into(),
            passed,
            score: Some(score),
            output: serde_json::json!("out"),
            error: None,
            execution_ms: Some(10),
        }
    }

    #[test]
    fn put_suite_upserts_by_tenant_and_name() {
        let store = store();
        let id1 = store.put_suite(&suite("acme", "smoke")).unwrap();

        let mut updated = suite("acme", "smoke");
        updated.test_cases[0].expected_output = serde_json::json!("5");
        let id2 = store.put_suite(&updated).unwrap();
        assert_eq!(id1, id2);

        let back = store.get_suite("acme", id1).unwrap();
        assert_eq!(back.test_cases[0].expected_output, serde_json::json!("5"));

        // Same name under another tenant is a distinct suite.
        let other = store.put_suite(&suite("globex", "smoke")).unwrap();
        assert_ne!(other, id1);
    }

    #[test]
    fn get_suite_is_tenant_scoped() {
        let store = store();
        let id = store.put_suite(&suite("acme", "smoke")).unwrap();
        assert!(store.get_suite("globex", id).is_err());
    }

    #[test]
    fn create_run_requires_existing_suite() {
        let store = store();
        let err = store.create_run("acme", 999, "v1", None).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn claim_moves_pending_to_running_once() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();

        let first = store.claim_pending(run_id).unwrap();
        assert!(first.claimed);
        assert_eq!(first.status, RunStatus::Running);

        let second = store.claim_pending(run_id).unwrap();
        assert!(!second.claimed);
        assert_eq!(second.status, RunStatus::Running);

        let run = store.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
    }

    #[test]
    fn claim_missing_run_is_not_found() {
        let store = store();
        assert!(matches!(
            store.claim_pending(42),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn finalize_writes_completed_from_running() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();
        store.claim_pending(run_id).unwrap();

        let results = vec![result("t1", true, 1.0)];
        let status = store
            .finalize_completed(run_id, &results, &reduce(&results))
            .unwrap();
        assert_eq!(status, RunStatus::Completed);

        let run = store.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.pass_rate, Some(1.0));
        assert_eq!(run.results.unwrap().len(), 1);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn finalize_after_cancel_discards_results() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();
        store.claim_pending(run_id).unwrap();
        assert!(store.cancel_run(run_id).unwrap());

        let results = vec![result("t1", true, 1.0)];
        let status = store
            .finalize_completed(run_id, &results, &reduce(&results))
            .unwrap();
        assert_eq!(status, RunStatus::Cancelled);

        let run = store.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.results.is_none(), "cancelled run must keep no results");
    }

    #[test]
    fn finalize_from_pending_is_an_invariant_violation() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();
        let err = store
            .finalize_completed(run_id, &[], &RunMetrics::empty())
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[test]
    fn mark_failed_only_writes_from_running() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();

        assert!(!store.mark_failed(run_id, "too early").unwrap());
        store.claim_pending(run_id).unwrap();
        assert!(store.mark_failed(run_id, "boom").unwrap());
        assert!(!store.mark_failed(run_id, "again").unwrap());

        let run = store.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[test]
    fn cancel_is_rejected_on_terminal_runs() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();
        store.claim_pending(run_id).unwrap();
        store.mark_failed(run_id, "boom").unwrap();
        assert!(!store.cancel_run(run_id).unwrap());
        assert_eq!(store.get_run(run_id).unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn pending_runs_ordered_and_limited() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let a = store.create_run("acme", suite_id, "v1", None).unwrap();
        let b = store.create_run("acme", suite_id, "v1", None).unwrap();
        let c = store.create_run("acme", suite_id, "v1", None).unwrap();
        store.claim_pending(b).unwrap();

        assert_eq!(store.pending_runs("acme", 10).unwrap(), vec![a, c]);
        assert_eq!(store.pending_runs("acme", 1).unwrap(), vec![a]);
        assert!(store.pending_runs("globex", 10).unwrap().is_empty());
    }

    #[test]
    fn tenants_with_pending_is_distinct_and_sorted() {
        let store = store();
        let acme = store.put_suite(&suite("acme", "smoke")).unwrap();
        let globex = store.put_suite(&suite("globex", "smoke")).unwrap();
        store.create_run("globex", globex, "v1", None).unwrap();
        store.create_run("acme", acme, "v1", None).unwrap();
        store.create_run("acme", acme, "v2", None).unwrap();

        assert_eq!(
            store.tenants_with_pending().unwrap(),
            vec!["acme".to_string(), "globex".to_string()]
        );
    }

    #[test]
    fn rates_are_normalized_on_read() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();
        store.claim_pending(run_id).unwrap();
        let results = vec![result("t1", true, 1.0)];
        store
            .finalize_completed(run_id, &results, &reduce(&results))
            .unwrap();

        // Simulate a legacy record written on the percentage scale.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE runs SET pass_rate=55.0, overall_score=80.0 WHERE id=?1",
                params![run_id],
            )
            .unwrap();
        }

        let run = store.get_run(run_id).unwrap();
        assert_eq!(run.pass_rate, Some(0.55));
        assert_eq!(run.overall_score, Some(0.8));

        let metrics = store.run_metrics(run_id).unwrap();
        assert_eq!(metrics.pass_rate, 0.55);
        assert_eq!(metrics.overall_score, 0.8);
        assert_eq!(metrics.total_tests, 1);
    }

    #[test]
    fn run_metrics_requires_results() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let run_id = store.create_run("acme", suite_id, "v1", None).unwrap();
        let err = store.run_metrics(run_id).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no results"));
        assert!(msg.contains("pending"), "error should name the status: {msg}");
    }

    #[test]
    fn normalize_historical_rewrites_only_legacy_rows() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();
        let legacy = store.create_run("acme", suite_id, "v1", None).unwrap();
        let modern = store.create_run("acme", suite_id, "v1", None).unwrap();
        for id in [legacy, modern] {
            store.claim_pending(id).unwrap();
            let results = vec![result("t1", true, 1.0)];
            store
                .finalize_completed(id, &results, &reduce(&results))
                .unwrap();
        }
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE runs SET pass_rate=75.0, overall_score=-80.0 WHERE id=?1",
                params![legacy],
            )
            .unwrap();
        }

        assert_eq!(store.normalize_historical().unwrap(), 1);
        assert_eq!(store.normalize_historical().unwrap(), 0);

        let conn = store.conn.lock().unwrap();
        let (pass_rate, overall): (f64, f64) = conn
            .query_row(
                "SELECT pass_rate, overall_score FROM runs WHERE id=?1",
                params![legacy],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(pass_rate, 0.75);
        assert_eq!(overall, -0.8);
    }

    #[test]
    fn tenant_metrics_counts_and_normalized_averages() {
        let store = store();
        let suite_id = store.put_suite(&suite("acme", "smoke")).unwrap();

        let done = store.create_run("acme", suite_id, "v1", None).unwrap();
        store.claim_pending(done).unwrap();
        let results = vec![result("t1", true, 1.0)];
        store
            .finalize_completed(done, &results, &reduce(&results))
            .unwrap();

        let legacy = store.create_run("acme", suite_id, "v1", None).unwrap();
        store.claim_pending(legacy).unwrap();
        store
            .finalize_completed(legacy, &results, &reduce(&results))
            .unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE runs SET pass_rate=50.0, overall_score=50.0 WHERE id=?1",
                params![legacy],
            )
            .unwrap();
        }

        store.create_run("acme", suite_id, "v2", None).unwrap();
        let failed = store.create_run("acme", suite_id, "v2", None).unwrap();
        store.claim_pending(failed).unwrap();
        store.mark_failed(failed, "boom").unwrap();

        let m = store.tenant_metrics("acme").unwrap();
        assert_eq!(m.total_runs, 4);
        assert_eq!(m.pending, 1);
        assert_eq!(m.completed, 2);
        assert_eq!(m.failed, 1);
        // Mean of 1.0 and normalized 0.5.
        assert!((m.avg_pass_rate - 0.75).abs() < 1e-12);
        assert!((m.avg_overall_score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn duplicate_function_name_is_rejected() {
        let store = store();
        store
            .insert_function("acme", "grade", "echo 1", "abc", &FunctionMetadata::default())
            .unwrap();
        let err = store
            .insert_function("acme", "grade", "echo 0", "def", &FunctionMetadata::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Other tenants are unaffected.
        store
            .insert_function("globex", "grade", "echo 1", "abc", &FunctionMetadata::default())
            .unwrap();
    }

    #[test]
    fn update_function_bumps_version_only_on_digest_change() {
        let store = store();
        let created = store
            .insert_function("acme", "grade", "echo 1", "digest-a", &FunctionMetadata::default())
            .unwrap();
        assert_eq!(created.version, 1);

        let same = store
            .update_function_code("acme", "grade", "echo 1", "digest-a")
            .unwrap();
        assert_eq!(same.version, 1);

        let changed = store
            .update_function_code("acme", "grade", "echo 0.5", "digest-b")
            .unwrap();
        assert_eq!(changed.version, 2);
        assert_eq!(changed.code, "echo 0.5");

        let back = store.function_by_name("acme", "grade").unwrap().unwrap();
        assert_eq!(back.version, 2);
        assert_eq!(back.code_sha256, "digest-b");
    }

    #[test]
    fn set_function_active_toggles() {
        let store = store();
        store
            .insert_function("acme", "grade", "echo 1", "abc", &FunctionMetadata::default())
            .unwrap();
        store.set_function_active("acme", "grade", false).unwrap();
        let f = store.function_by_name("acme", "grade").unwrap().unwrap();
        assert!(!f.is_active);
        assert!(store.set_function_active("acme", "missing", false).is_err());
    }

    #[test]
    fn cost_and_notification_sinks_round_trip() {
        let store = store();
        store
            .record_cost(&CostRecord {
                tenant: "acme".into(),
                run_id: 7,
                tokens: 1200,
                cost_usd: 0.03,
                source: "invoker".into(),
            })
            .unwrap();
        let costs = store.costs_for_run(7).unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].tokens, 1200);

        store
            .insert_notification(&NotificationEvent {
                tenant: "acme".into(),
                kind: NotificationKind::RunCompleted,
                resource_type: "evaluation_run".into(),
                resource_id: "7".into(),
                payload: serde_json::json!({"passRate": 1.0}),
            })
            .unwrap();
        let seen = store.notifications_for_tenant("acme", 10).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, "run_completed");
        assert_eq!(seen[0].resource_id, "7");
    }
}
