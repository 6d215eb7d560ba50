use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use log::{error, info, Level};
use logging_timer::timer;
use rusqlite::{named_params, Connection, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::detection::RuleMatch;
use crate::error::ThreatPulseError;
use crate::hash::FileDigests;

pub const MAX_SEVERITY: i64 = 10;
const DEFAULT_SEVERITY: i64 = 5;

/// A stored detection finding. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: i64,
    pub created_at: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub rule_name: String,
    pub rule_namespace: String,
    pub rule_metadata: BTreeMap<String, String>,
    pub matched_strings: Vec<String>,
    pub severity: i64,
}

/// An alert that has not been written yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlert {
    pub created_at: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub rule_name: String,
    pub rule_namespace: String,
    pub rule_metadata: BTreeMap<String, String>,
    pub matched_strings: Vec<String>,
    pub severity: i64,
}

impl NewAlert {
    pub fn from_match(path: &Path, digests: &FileDigests, rule_match: &RuleMatch) -> Self {
        NewAlert {
            created_at: Utc::now().timestamp(),
            file_path: path.to_string_lossy().into_owned(),
            file_name: path
                .file_name()
                .unwrap_or(path.as_os_str())
                .to_string_lossy()
                .into_owned(),
            file_size: i64::try_from(digests.size).ok(),
            md5: Some(digests.md5.clone()),
            sha256: Some(digests.sha256.clone()),
            rule_name: rule_match.rule.clone(),
            rule_namespace: rule_match.namespace.clone(),
            rule_metadata: rule_match.metadata.clone(),
            matched_strings: rule_match.matched_strings.clone(),
            severity: severity_from_metadata(&rule_match.metadata),
        }
    }
}

/// Derives a 0-10 severity from rule metadata. A numeric `severity` wins, then a
/// textual `severity` or `threat_level`; anything else is medium.
pub fn severity_from_metadata(metadata: &BTreeMap<String, String>) -> i64 {
    for key in ["severity", "threat_level"] {
        let Some(value) = metadata.get(key) else {
            continue;
        };
        let value = value.trim();
        if let Ok(n) = value.parse::<i64>() {
            return n.clamp(0, MAX_SEVERITY);
        }
        match value.to_ascii_lowercase().as_str() {
            "critical" => return 9,
            "high" => return 7,
            "medium" => return 5,
            "low" => return 3,
            "info" | "informational" => return 1,
            _ => {}
        }
    }
    DEFAULT_SEVERITY
}

/// Filters shared by alert queries and bulk deletes. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub rule_name: Option<String>,
    pub file_path: Option<String>,
    pub min_severity: Option<i64>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

const FILTER_WHERE: &str = "(:rule_name IS NULL OR rule_name = :rule_name)
    AND (:file_path IS NULL OR file_path = :file_path)
    AND (:min_severity IS NULL OR severity >= :min_severity)
    AND (:since IS NULL OR created_at >= :since)
    AND (:until IS NULL OR created_at <= :until)";

const SELECT_COLUMNS: &str = "alert_id, created_at, file_path, file_name, file_size, md5, sha256,
    rule_name, rule_namespace, rule_metadata, matched_strings, severity";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkInsertResult {
    pub inserted: usize,
    pub errors: Vec<String>,
}

pub struct Alerts;

impl Alerts {
    fn from_row(row: &Row) -> rusqlite::Result<Alert> {
        let metadata: String = row.get(9)?;
        let matched: String = row.get(10)?;
        Ok(Alert {
            alert_id: row.get(0)?,
            created_at: row.get(1)?,
            file_path: row.get(2)?,
            file_name: row.get(3)?,
            file_size: row.get(4)?,
            md5: row.get(5)?,
            sha256: row.get(6)?,
            rule_name: row.get(7)?,
            rule_namespace: row.get(8)?,
            rule_metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            matched_strings: serde_json::from_str(&matched).unwrap_or_default(),
            severity: row.get(11)?,
        })
    }

    /// Inserts one alert on a connection the caller controls, returning its id.
    pub fn insert_alert_locked(conn: &Connection, alert: &NewAlert) -> Result<i64, ThreatPulseError> {
        if alert.rule_name.trim().is_empty() {
            return Err(ThreatPulseError::StoreError(format!(
                "alert for '{}' has no rule name",
                alert.file_path
            )));
        }

        let sql = r#"
            INSERT INTO alerts (
                created_at,
                file_path,
                file_name,
                file_size,
                md5,
                sha256,
                rule_name,
                rule_namespace,
                rule_metadata,
                matched_strings,
                severity
            )
            VALUES (
                :created_at,
                :file_path,
                :file_name,
                :file_size,
                :md5,
                :sha256,
                :rule_name,
                :rule_namespace,
                :rule_metadata,
                :matched_strings,
                :severity
            )
        "#;

        conn.execute(
            sql,
            named_params! {
                ":created_at":      alert.created_at,
                ":file_path":       alert.file_path,
                ":file_name":       alert.file_name,
                ":file_size":       alert.file_size,
                ":md5":             alert.md5,
                ":sha256":          alert.sha256,
                ":rule_name":       alert.rule_name,
                ":rule_namespace":  alert.rule_namespace,
                ":rule_metadata":   serde_json::to_string(&alert.rule_metadata)?,
                ":matched_strings": serde_json::to_string(&alert.matched_strings)?,
                ":severity":        alert.severity,
            },
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn add_alert(db: &Database, alert: &NewAlert) -> Result<i64, ThreatPulseError> {
        let conn = db.get_connection()?;
        Self::insert_alert_locked(&conn, alert)
    }

    /// Inserts alerts in one transaction with a savepoint per row. A row that
    /// fails is rolled back, logged and reported; the others still commit.
    pub fn bulk_insert_alerts(
        db: &Database,
        alerts: &[NewAlert],
    ) -> Result<BulkInsertResult, ThreatPulseError> {
        let _tmr = timer!(Level::Trace; "Alerts::bulk_insert_alerts", "{}", alerts.len());
        let mut conn = db.get_connection()?;
        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut result = BulkInsertResult::default();

        for (index, alert) in alerts.iter().enumerate() {
            let sp = tx.savepoint()?;
            match Self::insert_alert_locked(&sp, alert) {
                Ok(_) => {
                    sp.commit()?;
                    result.inserted += 1;
                }
                Err(e) => {
                    // Dropping the savepoint rolls back this row only
                    let msg = format!("row {} ({}): {}", index, alert.file_path, e);
                    error!("bulk_insert_alerts: skipping {}", msg);
                    result.errors.push(msg);
                }
            }
        }

        tx.commit()?;
        Ok(result)
    }

    pub fn get_alerts(
        db: &Database,
        filter: &AlertFilter,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Alert>, ThreatPulseError> {
        let conn = db.get_connection()?;
        let sql = format!(
            "SELECT {} FROM alerts WHERE {}
             ORDER BY created_at DESC, alert_id DESC
             LIMIT :limit OFFSET :offset",
            SELECT_COLUMNS, FILTER_WHERE
        );
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)).unwrap_or(-1);
        let offset = offset.map(|o| i64::try_from(o).unwrap_or(0)).unwrap_or(0);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            named_params! {
                ":rule_name":    filter.rule_name,
                ":file_path":    filter.file_path,
                ":min_severity": filter.min_severity,
                ":since":        filter.since,
                ":until":        filter.until,
                ":limit":        limit,
                ":offset":       offset,
            },
            Self::from_row,
        )?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    /// Alerts created at or after `since`, oldest first.
    pub fn get_alerts_since(conn: &Connection, since: i64) -> Result<Vec<Alert>, ThreatPulseError> {
        let sql = format!(
            "SELECT {} FROM alerts WHERE created_at >= ? ORDER BY created_at, alert_id",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([since], Self::from_row)?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    pub fn delete_alerts(db: &Database, filter: &AlertFilter) -> Result<usize, ThreatPulseError> {
        let conn = db.get_connection()?;
        let sql = format!("DELETE FROM alerts WHERE {}", FILTER_WHERE);
        let deleted = Database::immediate_transaction(&conn, |c| {
            Ok(c.execute(
                &sql,
                named_params! {
                    ":rule_name":    filter.rule_name,
                    ":file_path":    filter.file_path,
                    ":min_severity": filter.min_severity,
                    ":since":        filter.since,
                    ":until":        filter.until,
                },
            )?)
        })?;
        info!("Deleted {} alerts", deleted);
        Ok(deleted)
    }

    /// Number of alerts carrying a rule name for the file at `path`.
    pub fn count_alerts_for_path(conn: &Connection, path: &Path) -> Result<i64, ThreatPulseError> {
        let count = conn.query_row(
            "SELECT count(*) FROM alerts WHERE file_path = ? AND rule_name != ''",
            [path.to_string_lossy()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn new_alert(path: &str, rule: &str, created_at: i64) -> NewAlert {
        NewAlert {
            created_at,
            file_path: path.to_string(),
            file_name: Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_size: Some(68),
            md5: Some("44d88612fea8a8f36de82e1278abb02f".to_string()),
            sha256: Some(
                "275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f".to_string(),
            ),
            rule_name: rule.to_string(),
            rule_namespace: "test".to_string(),
            rule_metadata: BTreeMap::new(),
            matched_strings: vec!["$sig".to_string()],
            severity: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::new_alert;
    use super::*;
    use crate::database::test_support::temp_db;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_severity_from_metadata() {
        let mut meta = BTreeMap::new();
        assert_eq!(severity_from_metadata(&meta), 5);

        meta.insert("threat_level".to_string(), "High".to_string());
        assert_eq!(severity_from_metadata(&meta), 7);

        meta.insert("severity".to_string(), "42".to_string());
        assert_eq!(severity_from_metadata(&meta), 10);

        meta.insert("severity".to_string(), "critical".to_string());
        assert_eq!(severity_from_metadata(&meta), 9);
    }

    #[test]
    fn test_add_and_get_round_trip() {
        let (_dir, db) = temp_db();
        let mut alert = new_alert("/cap/evil.exe", "Evil_Rule", 1_000);
        alert
            .rule_metadata
            .insert("author".to_string(), "soc".to_string());

        let id = Alerts::add_alert(&db, &alert).unwrap();
        let stored = Alerts::get_alerts(&db, &AlertFilter::default(), None, None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].alert_id, id);
        assert_eq!(stored[0].file_name, "evil.exe");
        assert_eq!(stored[0].rule_metadata.get("author").map(String::as_str), Some("soc"));
        assert_eq!(stored[0].matched_strings, vec!["$sig".to_string()]);
    }

    #[test]
    fn test_bulk_insert_tolerates_bad_rows() {
        let (_dir, db) = temp_db();
        let mut bad_severity = new_alert("/cap/2", "R2", 2);
        bad_severity.severity = 42;
        let no_rule = new_alert("/cap/3", "", 3);

        let result = Alerts::bulk_insert_alerts(
            &db,
            &[
                new_alert("/cap/1", "R1", 1),
                bad_severity,
                no_rule,
                new_alert("/cap/4", "R4", 4),
            ],
        )
        .unwrap();

        assert_eq!(result.inserted, 2);
        assert_eq!(result.errors.len(), 2);
        let stored = Alerts::get_alerts(&db, &AlertFilter::default(), None, None).unwrap();
        let rules: Vec<&str> = stored.iter().map(|a| a.rule_name.as_str()).collect();
        assert_eq!(rules, vec!["R4", "R1"]);
    }

    #[test]
    fn test_filters_and_pagination() {
        let (_dir, db) = temp_db();
        for i in 0..6 {
            let mut alert = new_alert(&format!("/cap/{i}"), if i % 2 == 0 { "Even" } else { "Odd" }, i);
            alert.severity = i;
            Alerts::add_alert(&db, &alert).unwrap();
        }

        let even = AlertFilter {
            rule_name: Some("Even".into()),
            ..Default::default()
        };
        assert_eq!(Alerts::get_alerts(&db, &even, None, None).unwrap().len(), 3);

        let severe = AlertFilter {
            min_severity: Some(4),
            ..Default::default()
        };
        assert_eq!(Alerts::get_alerts(&db, &severe, None, None).unwrap().len(), 2);

        let page = Alerts::get_alerts(&db, &AlertFilter::default(), Some(2), Some(2)).unwrap();
        let times: Vec<i64> = page.iter().map(|a| a.created_at).collect();
        assert_eq!(times, vec![3, 2]);

        let window = AlertFilter {
            since: Some(1),
            until: Some(3),
            ..Default::default()
        };
        assert_eq!(Alerts::get_alerts(&db, &window, None, None).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_alerts_by_filter() {
        let (_dir, db) = temp_db();
        Alerts::add_alert(&db, &new_alert("/cap/a", "A", 10)).unwrap();
        Alerts::add_alert(&db, &new_alert("/cap/b", "B", 20)).unwrap();
        Alerts::add_alert(&db, &new_alert("/cap/c", "A", 30)).unwrap();

        let deleted = Alerts::delete_alerts(
            &db,
            &AlertFilter {
                rule_name: Some("A".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(deleted, 2);

        let conn = db.get_connection().unwrap();
        assert_eq!(Alerts::count_alerts_for_path(&conn, Path::new("/cap/b")).unwrap(), 1);
        assert_eq!(Alerts::count_alerts_for_path(&conn, Path::new("/cap/a")).unwrap(), 0);
    }

    #[test]
    fn test_alerts_since_ordered_oldest_first() {
        let (_dir, db) = temp_db();
        Alerts::add_alert(&db, &new_alert("/cap/late", "R", 300)).unwrap();
        Alerts::add_alert(&db, &new_alert("/cap/early", "R", 100)).unwrap();
        Alerts::add_alert(&db, &new_alert("/cap/old", "R", 10)).unwrap();

        let conn = db.get_connection().unwrap();
        let since = Alerts::get_alerts_since(&conn, 50).unwrap();
        let names: Vec<&str> = since.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }
}
