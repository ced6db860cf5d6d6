//! Append-only audit log: every orchestrator action and admission decision
//! is persisted best-effort for operational forensics. Grounded on the
//! teacher's `SqliteStore` (WAL-mode connection behind a mutex, retention
//! trimming in the same transaction as the insert).

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{Context, Result};
use metrics::counter;

use kubedoor_core::model::{AuditKind, AuditRecord};

const RETENTION_PER_TARGET: i64 = 200;

pub trait AuditStore: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
    fn recent(&self, namespace: &str, name: &str, limit: usize) -> Result<Vec<AuditRecord>>;
}

/// No-op sink used when the SQLite database can't be opened — admission
/// decisions and orchestrator actions still proceed, just unaudited.
pub struct NullAuditStore;

impl AuditStore for NullAuditStore {
    fn record(&self, _record: &AuditRecord) -> Result<()> {
        Ok(())
    }

    fn recent(&self, _namespace: &str, _name: &str, _limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(vec![])
    }
}

pub struct SqliteAuditStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteAuditStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KUBEDOOR_AUDIT_DB").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening audit db at {path}"))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                detail TEXT NOT NULL,
                outcome INTEGER NOT NULL
            )",
            [],
        )
        .context("creating audit_log table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_target_ts ON audit_log(namespace, name, ts DESC)",
            [],
        )
        .ok();
        Ok(Self { db: Mutex::new(db) })
    }
}

impl AuditStore for SqliteAuditStore {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO audit_log(ts, kind, namespace, name, detail, outcome) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.ts,
                kind_str(record.kind),
                record.namespace,
                record.name,
                record.detail,
                record.outcome as i64
            ],
        )?;
        tx.execute(
            "DELETE FROM audit_log
             WHERE namespace = ?1 AND name = ?2
               AND rowid NOT IN (
                   SELECT rowid FROM audit_log WHERE namespace = ?1 AND name = ?2
                   ORDER BY ts DESC, rowid DESC LIMIT ?3
               )",
            rusqlite::params![record.namespace, record.name, RETENTION_PER_TARGET],
        )?;
        tx.commit()?;
        counter!("audit_record_total").increment(1);
        Ok(())
    }

    fn recent(&self, namespace: &str, name: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT ts, kind, namespace, name, detail, outcome FROM audit_log
             WHERE namespace = ?1 AND name = ?2 ORDER BY ts DESC, rowid DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![namespace, name, limit as i64], |row| {
            let kind: String = row.get(1)?;
            Ok(AuditRecord {
                ts: row.get(0)?,
                kind: kind_from_str(&kind),
                namespace: row.get(2)?,
                name: row.get(3)?,
                detail: row.get(4)?,
                outcome: row.get::<_, i64>(5)? != 0,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("reading audit rows")
    }
}

fn kind_str(kind: AuditKind) -> &'static str {
    match kind {
        AuditKind::Scale => "scale",
        AuditKind::Restart => "restart",
        AuditKind::ImageUpdate => "image_update",
        AuditKind::Cron => "cron",
        AuditKind::BalanceNode => "balance_node",
        AuditKind::AdmissionDecision => "admission_decision",
        AuditKind::Cordon => "cordon",
        AuditKind::Uncordon => "uncordon",
    }
}

fn kind_from_str(s: &str) -> AuditKind {
    match s {
        "restart" => AuditKind::Restart,
        "image_update" => AuditKind::ImageUpdate,
        "cron" => AuditKind::Cron,
        "balance_node" => AuditKind::BalanceNode,
        "admission_decision" => AuditKind::AdmissionDecision,
        "cordon" => AuditKind::Cordon,
        "uncordon" => AuditKind::Uncordon,
        _ => AuditKind::Scale,
    }
}

fn default_db_path() -> String {
    if let Some(dir) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(dir);
        p.push(".kubedoor");
        let _ = std::fs::create_dir_all(&p);
        p.push("audit.db");
        return p.to_string_lossy().to_string();
    }
    "kubedoor-audit.db".to_string()
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("kubedoor-audit-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[test]
    fn record_and_read_back() {
        let store = SqliteAuditStore::open(&temp_db()).unwrap();
        let rec = AuditRecord {
            ts: 1,
            kind: AuditKind::Scale,
            namespace: "prod".into(),
            name: "checkout".into(),
            detail: "3 -> 5".into(),
            outcome: true,
        };
        store.record(&rec).unwrap();
        let rows = store.recent("prod", "checkout", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].detail, "3 -> 5");
        assert!(rows[0].outcome);
    }

    #[test]
    fn retention_trims_to_cap() {
        let store = SqliteAuditStore::open(&temp_db()).unwrap();
        for i in 0..5 {
            let rec = AuditRecord {
                ts: i,
                kind: AuditKind::Restart,
                namespace: "ns".into(),
                name: "svc".into(),
                detail: format!("attempt {i}"),
                outcome: true,
            };
            store.record(&rec).unwrap();
        }
        let rows = store.recent("ns", "svc", 100).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].detail, "attempt 4");
    }
}
