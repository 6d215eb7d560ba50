use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use rusqlite::{named_params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::alerts::{Alert, Alerts};
use crate::config::CorrelationConfig;
use crate::database::Database;
use crate::error::ThreatPulseError;
use crate::hash::Hash;
use crate::network_alerts::{NetworkAlert, NetworkAlerts};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CorrelationType {
    Ip,
    Hash,
    TimeProximity,
}

impl CorrelationType {
    pub fn confidence(&self) -> i64 {
        match self {
            CorrelationType::Ip => 85,
            CorrelationType::Hash => 90,
            CorrelationType::TimeProximity => 75,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlertSource {
    File,
    Network,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedAlert {
    pub alert_id: i64,
    pub source: AlertSource,
    pub summary: String,
}

/// Alerts from both sources grouped by one strategy. Never mutated once stored;
/// `correlation_id` is set only on groups read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationGroup {
    pub correlation_id: Option<i64>,
    pub created_at: i64,
    pub correlation_type: CorrelationType,
    pub primary_alert_id: i64,
    pub primary_source: AlertSource,
    pub related_alerts: Vec<RelatedAlert>,
    pub confidence: i64,
    pub rationale: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationFilter {
    pub min_confidence: Option<i64>,
    pub correlation_type: Option<CorrelationType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRunResult {
    pub groups: Vec<CorrelationGroup>,
    pub stored: usize,
    /// Groups already stored for the same primary alert within the lookback
    pub suppressed: usize,
}

/// The network connection a file was carved from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub src_ip: String,
    #[serde(default)]
    pub dest_ip: String,
}

impl ConnectionInfo {
    fn has_ips(&self) -> bool {
        !self.src_ip.is_empty() || !self.dest_ip.is_empty()
    }

    fn shares_ip_with(&self, network: &NetworkAlert) -> Option<&str> {
        [self.src_ip.as_str(), self.dest_ip.as_str()]
            .into_iter()
            .filter(|ip| !ip.is_empty())
            .find(|ip| *ip == network.src_ip || *ip == network.dest_ip)
    }
}

/// Maps a file alert to the connection that carried the file.
pub trait ConnectionResolver: Send + Sync {
    fn resolve(&self, alert: &Alert, network: &[NetworkAlert]) -> Option<ConnectionInfo>;
}

/// Reads the `<file>.json` sidecar the capture process writes next to each
/// extracted file. A sidecar with only a flow id is completed from the
/// network alert carrying the same flow id.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarResolver;

impl SidecarResolver {
    pub fn sidecar_path(file_path: &str) -> PathBuf {
        PathBuf::from(format!("{}.json", file_path))
    }
}

impl ConnectionResolver for SidecarResolver {
    fn resolve(&self, alert: &Alert, network: &[NetworkAlert]) -> Option<ConnectionInfo> {
        let sidecar = Self::sidecar_path(&alert.file_path);
        let contents = fs::read_to_string(&sidecar).ok()?;
        let mut info: ConnectionInfo = match serde_json::from_str(&contents) {
            Ok(info) => info,
            Err(e) => {
                warn!("Unreadable sidecar '{}': {}", sidecar.display(), e);
                return None;
            }
        };

        if !info.has_ips() {
            let flow_id = info.flow_id.as_deref()?;
            let carrier = network
                .iter()
                .find(|n| n.flow_id.as_deref() == Some(flow_id))?;
            info.src_ip = carrier.src_ip.clone();
            info.dest_ip = carrier.dest_ip.clone();
        }

        info.has_ips().then_some(info)
    }
}

fn describe_network(n: &NetworkAlert) -> String {
    let port = |p: Option<i64>| p.map(|p| format!(":{}", p)).unwrap_or_default();
    format!(
        "{} {}{} -> {}{}",
        n.signature,
        n.src_ip,
        port(n.src_port),
        n.dest_ip,
        port(n.dest_port)
    )
}

fn related(network: &[&NetworkAlert]) -> Vec<RelatedAlert> {
    network
        .iter()
        .map(|n| RelatedAlert {
            alert_id: n.network_alert_id,
            source: AlertSource::Network,
            summary: describe_network(n),
        })
        .collect()
}

fn new_group(
    correlation_type: CorrelationType,
    primary: &Alert,
    matches: &[&NetworkAlert],
    rationale: String,
    now: i64,
) -> CorrelationGroup {
    CorrelationGroup {
        correlation_id: None,
        created_at: now,
        correlation_type,
        primary_alert_id: primary.alert_id,
        primary_source: AlertSource::File,
        related_alerts: related(matches),
        confidence: correlation_type.confidence(),
        rationale,
        summary: format!(
            "{} on '{}' linked to {} network alert(s) by {}",
            primary.rule_name,
            primary.file_name,
            matches.len(),
            correlation_type
        ),
    }
}

pub struct CorrelationEngine {
    db: Database,
    config: CorrelationConfig,
    resolver: Arc<dyn ConnectionResolver>,
}

impl CorrelationEngine {
    pub fn new(db: Database, config: CorrelationConfig, resolver: Arc<dyn ConnectionResolver>) -> Self {
        CorrelationEngine {
            db,
            config,
            resolver,
        }
    }

    /// Correlates the current window and stores new groups. A failed run is
    /// logged and yields an empty result so the next run proceeds normally.
    pub fn run_correlation(&self) -> CorrelationRunResult {
        let _tmr = timer!(Level::Trace; "CorrelationEngine::run_correlation");
        match self.try_run(Utc::now().timestamp()) {
            Ok(result) => {
                if result.stored > 0 || result.suppressed > 0 {
                    info!(
                        "Correlation run: {} group(s), {} stored, {} suppressed",
                        result.groups.len(),
                        result.stored,
                        result.suppressed
                    );
                } else {
                    debug!("Correlation run: no groups");
                }
                result
            }
            Err(e) => {
                error!("Correlation run failed: {}", e);
                CorrelationRunResult::default()
            }
        }
    }

    fn try_run(&self, now: i64) -> Result<CorrelationRunResult, ThreatPulseError> {
        let conn = self.db.get_connection().map_err(|e| {
            ThreatPulseError::CorrelationSourceUnavailable(format!("store: {}", e))
        })?;

        let window_start = now - i64::try_from(self.config.window_minutes.saturating_mul(60)).unwrap_or(i64::MAX);
        let file_alerts = Alerts::get_alerts_since(&conn, window_start).map_err(|e| {
            ThreatPulseError::CorrelationSourceUnavailable(format!("alerts: {}", e))
        })?;
        if file_alerts.is_empty() {
            return Ok(CorrelationRunResult::default());
        }

        // Network alerts just before the window can still be time-proximate
        let slack = i64::try_from(self.config.time_window_secs).unwrap_or(i64::MAX);
        let network = NetworkAlerts::get_network_alerts_since(&conn, window_start.saturating_sub(slack))
            .map_err(|e| ThreatPulseError::CorrelationSourceUnavailable(format!("network_alerts: {}", e)))?;

        let groups = self.correlate(&file_alerts, &network, now);
        let (stored, suppressed) = self.store_groups(&conn, &groups, now)?;

        Ok(CorrelationRunResult {
            groups,
            stored,
            suppressed,
        })
    }

    /// Union of all strategies over the given alerts.
    pub fn correlate(&self, file_alerts: &[Alert], network: &[NetworkAlert], now: i64) -> Vec<CorrelationGroup> {
        let mut groups = self.correlate_by_ip(file_alerts, network, now);
        groups.extend(self.correlate_by_hash(file_alerts, network, now));
        groups.extend(self.correlate_by_time(file_alerts, network, now));
        groups
    }

    pub fn correlate_by_ip(&self, file_alerts: &[Alert], network: &[NetworkAlert], now: i64) -> Vec<CorrelationGroup> {
        let mut groups = Vec::new();
        for alert in file_alerts {
            let Some(conn_info) = self.resolver.resolve(alert, network) else {
                continue;
            };

            let mut shared: Vec<&str> = Vec::new();
            let matches: Vec<&NetworkAlert> = network
                .iter()
                .filter(|n| match conn_info.shares_ip_with(n) {
                    Some(ip) => {
                        if !shared.contains(&ip) {
                            shared.push(ip);
                        }
                        true
                    }
                    None => false,
                })
                .collect();
            if matches.is_empty() {
                continue;
            }

            let flow = conn_info
                .flow_id
                .as_deref()
                .map(|f| format!(" (flow {})", f))
                .unwrap_or_default();
            let rationale = format!(
                "file carried by {} -> {}{}; network alerts share IP {}",
                conn_info.src_ip,
                conn_info.dest_ip,
                flow,
                shared.join(", ")
            );
            groups.push(new_group(CorrelationType::Ip, alert, &matches, rationale, now));
        }
        groups
    }

    pub fn correlate_by_hash(&self, file_alerts: &[Alert], network: &[NetworkAlert], now: i64) -> Vec<CorrelationGroup> {
        let haystacks: Vec<String> = network
            .iter()
            .map(|n| format!("{}\n{}", n.signature, n.payload).to_ascii_lowercase())
            .collect();

        let mut groups = Vec::new();
        for alert in file_alerts {
            let hashes: Vec<String> = [alert.md5.as_deref(), alert.sha256.as_deref()]
                .into_iter()
                .flatten()
                .filter(|h| !h.is_empty())
                .map(str::to_ascii_lowercase)
                .collect();
            if hashes.is_empty() {
                continue;
            }

            let mut found: HashSet<&str> = HashSet::new();
            let matches: Vec<&NetworkAlert> = network
                .iter()
                .zip(&haystacks)
                .filter(|(_, text)| {
                    let mut hit = false;
                    for h in &hashes {
                        if text.contains(h.as_str()) {
                            found.insert(h.as_str());
                            hit = true;
                        }
                    }
                    hit
                })
                .map(|(n, _)| n)
                .collect();
            if matches.is_empty() {
                continue;
            }

            let mut found: Vec<&str> = found.into_iter().map(|h| Hash::short_hash(Some(h))).collect();
            found.sort_unstable();
            let rationale = format!("file hash {} appears in network alert text", found.join(", "));
            groups.push(new_group(CorrelationType::Hash, alert, &matches, rationale, now));
        }
        groups
    }

    pub fn correlate_by_time(&self, file_alerts: &[Alert], network: &[NetworkAlert], now: i64) -> Vec<CorrelationGroup> {
        let window = i64::try_from(self.config.time_window_secs).unwrap_or(i64::MAX);
        let mut timeline: Vec<&NetworkAlert> = network.iter().collect();
        timeline.sort_by_key(|n| (n.timestamp, n.network_alert_id));

        let mut groups = Vec::new();
        for alert in file_alerts {
            let lo = alert.created_at.saturating_sub(window);
            let hi = alert.created_at.saturating_add(window);
            let start = timeline.partition_point(|n| n.timestamp < lo);
            let end = timeline.partition_point(|n| n.timestamp <= hi);
            if start >= end {
                continue;
            }

            let matches = &timeline[start..end];
            let max_gap = matches
                .iter()
                .map(|n| (n.timestamp - alert.created_at).abs())
                .max()
                .unwrap_or(0);
            let rationale = format!(
                "network alerts within {}s of the file alert (widest gap {}s)",
                window, max_gap
            );
            groups.push(new_group(
                CorrelationType::TimeProximity,
                alert,
                matches,
                rationale,
                now,
            ));
        }
        groups
    }

    /// Persists groups in one transaction, skipping any whose `(type, primary)`
    /// was already stored within the dedupe lookback. Returns `(stored, suppressed)`.
    fn store_groups(
        &self,
        conn: &Connection,
        groups: &[CorrelationGroup],
        now: i64,
    ) -> Result<(usize, usize), ThreatPulseError> {
        if groups.is_empty() {
            return Ok((0, 0));
        }
        let lookback = i64::try_from(self.config.dedupe_lookback_minutes.saturating_mul(60)).unwrap_or(i64::MAX);

        Database::immediate_transaction(conn, |c| {
            let mut stored = 0;
            let mut suppressed = 0;
            for group in groups {
                if lookback > 0 && Self::exists_since(c, group, now.saturating_sub(lookback))? {
                    suppressed += 1;
                    continue;
                }
                Self::insert_correlation(c, group)?;
                stored += 1;
            }
            Ok((stored, suppressed))
        })
    }

    fn exists_since(conn: &Connection, group: &CorrelationGroup, since: i64) -> Result<bool, ThreatPulseError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT correlation_id FROM correlations
                 WHERE correlation_type = :type
                   AND primary_source = :source
                   AND primary_alert_id = :primary
                   AND created_at >= :since
                 LIMIT 1",
                named_params! {
                    ":type":    group.correlation_type.as_ref(),
                    ":source":  group.primary_source.as_ref(),
                    ":primary": group.primary_alert_id,
                    ":since":   since,
                },
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_correlation(conn: &Connection, group: &CorrelationGroup) -> Result<i64, ThreatPulseError> {
        conn.execute(
            "INSERT INTO correlations (
                created_at, correlation_type, primary_alert_id, primary_source,
                related_alerts, confidence, rationale, summary
             )
             VALUES (
                :created_at, :type, :primary, :source,
                :related, :confidence, :rationale, :summary
             )",
            named_params! {
                ":created_at": group.created_at,
                ":type":       group.correlation_type.as_ref(),
                ":primary":    group.primary_alert_id,
                ":source":     group.primary_source.as_ref(),
                ":related":    serde_json::to_string(&group.related_alerts)?,
                ":confidence": group.confidence.clamp(0, 100),
                ":rationale":  group.rationale,
                ":summary":    group.summary,
            },
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn from_row(row: &Row) -> rusqlite::Result<CorrelationGroup> {
        let correlation_type: String = row.get(2)?;
        let source: String = row.get(4)?;
        let related: String = row.get(5)?;
        Ok(CorrelationGroup {
            correlation_id: Some(row.get(0)?),
            created_at: row.get(1)?,
            correlation_type: correlation_type.parse().unwrap_or_else(|_| {
                warn!("Invalid correlation_type in database: '{}'", correlation_type);
                CorrelationType::TimeProximity
            }),
            primary_alert_id: row.get(3)?,
            primary_source: source.parse().unwrap_or(AlertSource::File),
            related_alerts: serde_json::from_str(&related).unwrap_or_default(),
            confidence: row.get(6)?,
            rationale: row.get(7)?,
            summary: row.get(8)?,
        })
    }

    /// Stored groups, newest first.
    pub fn get_correlations(
        db: &Database,
        filter: &CorrelationFilter,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<CorrelationGroup>, ThreatPulseError> {
        let conn = db.get_connection()?;
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)).unwrap_or(-1);
        let offset = offset.map(|o| i64::try_from(o).unwrap_or(0)).unwrap_or(0);

        let mut stmt = conn.prepare(
            "SELECT correlation_id, created_at, correlation_type, primary_alert_id, primary_source,
                    related_alerts, confidence, rationale, summary
             FROM correlations
             WHERE (:min_confidence IS NULL OR confidence >= :min_confidence)
               AND (:type IS NULL OR correlation_type = :type)
             ORDER BY created_at DESC, correlation_id DESC
             LIMIT :limit OFFSET :offset",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":min_confidence": filter.min_confidence,
                ":type":           filter.correlation_type.map(|t| t.as_ref().to_string()),
                ":limit":          limit,
                ":offset":         offset,
            },
            Self::from_row,
        )?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Runs correlation every `interval_secs` until `stop` is set.
    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>, ThreatPulseError> {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let handle = thread::Builder::new()
            .name("correlation".into())
            .spawn(move || {
                info!("Correlation scheduler started (every {:?})", interval);
                while crate::pipeline::sleep_unless_stopped(&stop, interval) {
                    self.run_correlation();
                }
                info!("Correlation scheduler stopped");
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::test_support::new_alert;
    use crate::database::test_support::temp_db;
    use crate::network_alerts::NewNetworkAlert;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const SHA256: &str = "275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f";

    fn engine(db: &Database) -> CorrelationEngine {
        CorrelationEngine::new(db.clone(), CorrelationConfig::default(), Arc::new(SidecarResolver))
    }

    fn file_alert(alert_id: i64, created_at: i64, path: &str) -> Alert {
        Alert {
            alert_id,
            created_at,
            file_path: path.to_string(),
            file_name: "payload.exe".to_string(),
            file_size: Some(68),
            md5: Some("44d88612fea8a8f36de82e1278abb02f".to_string()),
            sha256: Some(SHA256.to_string()),
            rule_name: "Test_Rule".to_string(),
            rule_namespace: "test".to_string(),
            rule_metadata: BTreeMap::new(),
            matched_strings: vec![],
            severity: 7,
        }
    }

    fn network_alert(id: i64, timestamp: i64, src_ip: &str, dest_ip: &str) -> NetworkAlert {
        NetworkAlert {
            network_alert_id: id,
            timestamp,
            src_ip: src_ip.to_string(),
            src_port: Some(51234),
            dest_ip: dest_ip.to_string(),
            dest_port: Some(80),
            protocol: "TCP".to_string(),
            flow_id: None,
            signature: "ET MALWARE test".to_string(),
            category: "trojan".to_string(),
            severity: 1,
            payload: String::new(),
        }
    }

    #[test]
    fn test_ip_correlation_via_sidecar() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let path = files.path().join("payload.exe");
        fs::write(
            SidecarResolver::sidecar_path(&path.to_string_lossy()),
            r#"{"flow_id": "1234", "src_ip": "192.168.1.20", "dest_ip": "10.0.0.5"}"#,
        )
        .unwrap();

        let alerts = vec![file_alert(1, 1_000, &path.to_string_lossy())];
        let network = vec![
            network_alert(10, 1_010, "172.16.0.9", "10.0.0.5"),
            network_alert(11, 1_020, "172.16.0.9", "8.8.8.8"),
        ];

        let groups = engine(&db).correlate_by_ip(&alerts, &network, 2_000);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].confidence, 85);
        assert_eq!(groups[0].correlation_type, CorrelationType::Ip);
        assert_eq!(groups[0].primary_alert_id, 1);
        assert_eq!(groups[0].related_alerts.len(), 1);
        assert_eq!(groups[0].related_alerts[0].alert_id, 10);
        assert!(groups[0].rationale.contains("10.0.0.5"));
    }

    #[test]
    fn test_sidecar_flow_id_falls_back_to_network_alert() {
        let files = TempDir::new().unwrap();
        let path = files.path().join("payload.exe");
        fs::write(
            SidecarResolver::sidecar_path(&path.to_string_lossy()),
            r#"{"flow_id": "abc"}"#,
        )
        .unwrap();

        let mut carrier = network_alert(5, 1_000, "10.0.0.5", "192.168.1.20");
        carrier.flow_id = Some("abc".to_string());
        let info = SidecarResolver
            .resolve(&file_alert(1, 1_000, &path.to_string_lossy()), &[carrier])
            .unwrap();
        assert_eq!(info.src_ip, "10.0.0.5");
        assert_eq!(info.dest_ip, "192.168.1.20");

        let no_sidecar = file_alert(2, 1_000, "/nonexistent/file.bin");
        assert_eq!(SidecarResolver.resolve(&no_sidecar, &[]), None);
    }

    #[test]
    fn test_hash_correlation_is_case_insensitive() {
        let (_dir, db) = temp_db();
        let alerts = vec![file_alert(1, 1_000, "/x/payload.exe")];
        let mut hit = network_alert(20, 5_000, "1.1.1.1", "2.2.2.2");
        hit.payload = format!("GET /download?sha={} HTTP/1.1", SHA256.to_ascii_uppercase());
        let miss = network_alert(21, 5_000, "1.1.1.1", "2.2.2.2");

        let groups = engine(&db).correlate_by_hash(&alerts, &[hit, miss], 6_000);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].confidence, 90);
        assert_eq!(groups[0].related_alerts.len(), 1);
        assert_eq!(groups[0].related_alerts[0].alert_id, 20);
    }

    #[test]
    fn test_time_proximity_window() {
        let (_dir, db) = temp_db();
        let engine = engine(&db);
        let alerts = vec![file_alert(1, 1_000, "/x/payload.exe")];

        let near = engine.correlate_by_time(&alerts, &[network_alert(1, 1_040, "a", "b")], 2_000);
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].confidence, 75);
        assert_eq!(near[0].correlation_type, CorrelationType::TimeProximity);

        let far = engine.correlate_by_time(&alerts, &[network_alert(1, 1_090, "a", "b")], 2_000);
        assert!(far.is_empty());

        let before = engine.correlate_by_time(&alerts, &[network_alert(1, 960, "a", "b")], 2_000);
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn test_run_stores_and_suppresses_duplicates() {
        let (_dir, db) = temp_db();
        let now = Utc::now().timestamp();
        Alerts::add_alert(&db, &new_alert("/x/payload.exe", "Test_Rule", now - 10)).unwrap();
        let mut net = NewNetworkAlert::new("1.1.1.1", "2.2.2.2", "ET test");
        net.timestamp = now - 5;
        NetworkAlerts::insert_network_alert(&db, &net).unwrap();

        let engine = engine(&db);
        let first = engine.run_correlation();
        assert_eq!(first.groups.len(), 1);
        assert_eq!(first.stored, 1);

        let second = engine.run_correlation();
        assert_eq!(second.groups.len(), 1);
        assert_eq!(second.stored, 0);
        assert_eq!(second.suppressed, 1);

        let stored = CorrelationEngine::get_correlations(&db, &CorrelationFilter::default(), None, None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].correlation_type, CorrelationType::TimeProximity);
        assert_eq!(stored[0].related_alerts[0].source, AlertSource::Network);
    }

    #[test]
    fn test_zero_lookback_appends_every_run() {
        let (_dir, db) = temp_db();
        let now = Utc::now().timestamp();
        Alerts::add_alert(&db, &new_alert("/x/payload.exe", "Test_Rule", now - 10)).unwrap();
        let mut net = NewNetworkAlert::new("1.1.1.1", "2.2.2.2", "ET test");
        net.timestamp = now;
        NetworkAlerts::insert_network_alert(&db, &net).unwrap();

        let config = CorrelationConfig {
            dedupe_lookback_minutes: 0,
            ..Default::default()
        };
        let engine = CorrelationEngine::new(db.clone(), config, Arc::new(SidecarResolver));
        assert_eq!(engine.run_correlation().stored, 1);
        assert_eq!(engine.run_correlation().stored, 1);
        assert_eq!(
            CorrelationEngine::get_correlations(&db, &CorrelationFilter::default(), None, None)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_get_correlations_filters() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        let alert = file_alert(1, 1_000, "/x/payload.exe");
        let net = network_alert(2, 1_000, "a", "b");
        for t in [CorrelationType::Ip, CorrelationType::Hash, CorrelationType::TimeProximity] {
            let group = new_group(t, &alert, &[&net], "r".into(), 1_000);
            CorrelationEngine::insert_correlation(&conn, &group).unwrap();
        }

        let strong = CorrelationFilter {
            min_confidence: Some(85),
            ..Default::default()
        };
        assert_eq!(CorrelationEngine::get_correlations(&db, &strong, None, None).unwrap().len(), 2);

        let hash_only = CorrelationFilter {
            correlation_type: Some(CorrelationType::Hash),
            ..Default::default()
        };
        let hash = CorrelationEngine::get_correlations(&db, &hash_only, None, None).unwrap();
        assert_eq!(hash.len(), 1);
        assert_eq!(hash[0].confidence, 90);

        let page = CorrelationEngine::get_correlations(&db, &CorrelationFilter::default(), Some(1), Some(1)).unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn test_unavailable_source_yields_empty_run() {
        let (_dir, db) = temp_db();
        let now = Utc::now().timestamp();
        Alerts::add_alert(&db, &new_alert("/x/payload.exe", "Test_Rule", now)).unwrap();
        db.get_connection()
            .unwrap()
            .execute_batch("DROP TABLE network_alerts")
            .unwrap();

        let result = engine(&db).run_correlation();
        assert_eq!(result, CorrelationRunResult::default());
    }
}
