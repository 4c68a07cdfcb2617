//! Append-only structured logging of per-deal events.
//!
//! Entries land in the deal-log column family so they can be surfaced per
//! deal later on. A failure to persist an entry must never hold up deal
//! progress, so storage errors are traced and swallowed here.

use std::{fmt, sync::Arc};

use chrono::Utc;
use uuid::Uuid;

use crate::db::{DealLog, DealsDB, LogLevel};

const SUBSYSTEM: &str = "storage-deals";

#[derive(Clone)]
pub struct DealLogger {
    db: Arc<DealsDB>,
}

impl DealLogger {
    pub fn new(db: Arc<DealsDB>) -> Self {
        Self { db }
    }

    pub fn info(&self, deal_uuid: Uuid, message: &str, params: serde_json::Value) {
        tracing::info!(deal = %deal_uuid, %params, "{message}");
        self.append(deal_uuid, LogLevel::Info, message, params);
    }

    pub fn warn(&self, deal_uuid: Uuid, message: &str, params: serde_json::Value) {
        tracing::warn!(deal = %deal_uuid, %params, "{message}");
        self.append(deal_uuid, LogLevel::Warn, message, params);
    }

    pub fn error<E: fmt::Display>(&self, deal_uuid: Uuid, message: &str, err: E) {
        let err = err.to_string();
        tracing::error!(deal = %deal_uuid, %err, "{message}");
        self.append(
            deal_uuid,
            LogLevel::Error,
            message,
            serde_json::json!({ "err": err }),
        );
    }

    fn append(&self, deal_uuid: Uuid, level: LogLevel, message: &str, params: serde_json::Value) {
        let log = DealLog {
            deal_uuid,
            created_at: Utc::now(),
            level,
            subsystem: SUBSYSTEM.to_string(),
            message: message.to_string(),
            params,
        };
        if let Err(err) = self.db.append_log(&log) {
            tracing::warn!(%err, deal = %deal_uuid, "failed to append deal log entry");
        }
    }
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn entries_are_persisted_per_deal() {
        let tmp_dir = tempdir().unwrap();
        let db = Arc::new(DealsDB::open(tmp_dir.path().join("deals_database")).unwrap());
        let logger = DealLogger::new(db.clone());
        let deal_uuid = Uuid::new_v4();

        logger.info(deal_uuid, "accepted", serde_json::json!({ "size": 2048 }));
        logger.error(deal_uuid, "transfer failed", "connection reset");
        logger.info(Uuid::new_v4(), "unrelated", serde_json::Value::Null);

        let logs = db.logs(deal_uuid).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "accepted");
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert_eq!(logs[1].params["err"], "connection reset");
    }
}
