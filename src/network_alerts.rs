use chrono::Utc;
use rusqlite::{named_params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::ThreatPulseError;

/// An intrusion-detection event written by the external network ingester.
/// The pipeline only reads these; inserts exist for ingest tooling and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAlert {
    pub network_alert_id: i64,
    pub timestamp: i64,
    pub src_ip: String,
    pub src_port: Option<i64>,
    pub dest_ip: String,
    pub dest_port: Option<i64>,
    pub protocol: String,
    pub flow_id: Option<String>,
    pub signature: String,
    pub category: String,
    pub severity: i64,
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewNetworkAlert {
    pub timestamp: i64,
    pub src_ip: String,
    pub src_port: Option<i64>,
    pub dest_ip: String,
    pub dest_port: Option<i64>,
    pub protocol: String,
    pub flow_id: Option<String>,
    pub signature: String,
    pub category: String,
    pub severity: i64,
    pub payload: String,
}

impl NewNetworkAlert {
    pub fn new(src_ip: &str, dest_ip: &str, signature: &str) -> Self {
        NewNetworkAlert {
            timestamp: Utc::now().timestamp(),
            src_ip: src_ip.to_string(),
            dest_ip: dest_ip.to_string(),
            signature: signature.to_string(),
            ..Default::default()
        }
    }
}

const SELECT_COLUMNS: &str = "network_alert_id, timestamp, src_ip, src_port, dest_ip, dest_port,
    protocol, flow_id, signature, category, severity, payload";

pub struct NetworkAlerts;

impl NetworkAlerts {
    fn from_row(row: &Row) -> rusqlite::Result<NetworkAlert> {
        Ok(NetworkAlert {
            network_alert_id: row.get(0)?,
            timestamp: row.get(1)?,
            src_ip: row.get(2)?,
            src_port: row.get(3)?,
            dest_ip: row.get(4)?,
            dest_port: row.get(5)?,
            protocol: row.get(6)?,
            flow_id: row.get(7)?,
            signature: row.get(8)?,
            category: row.get(9)?,
            severity: row.get(10)?,
            payload: row.get(11)?,
        })
    }

    pub fn insert_network_alert(
        db: &Database,
        alert: &NewNetworkAlert,
    ) -> Result<i64, ThreatPulseError> {
        let conn = db.get_connection()?;
        conn.execute(
            "INSERT INTO network_alerts (
                timestamp, src_ip, src_port, dest_ip, dest_port, protocol,
                flow_id, signature, category, severity, payload
             )
             VALUES (
                :timestamp, :src_ip, :src_port, :dest_ip, :dest_port, :protocol,
                :flow_id, :signature, :category, :severity, :payload
             )",
            named_params! {
                ":timestamp": alert.timestamp,
                ":src_ip":    alert.src_ip,
                ":src_port":  alert.src_port,
                ":dest_ip":   alert.dest_ip,
                ":dest_port": alert.dest_port,
                ":protocol":  alert.protocol,
                ":flow_id":   alert.flow_id,
                ":signature": alert.signature,
                ":category":  alert.category,
                ":severity":  alert.severity,
                ":payload":   alert.payload,
            },
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Network alerts at or after `since`, oldest first.
    pub fn get_network_alerts_since(
        conn: &Connection,
        since: i64,
    ) -> Result<Vec<NetworkAlert>, ThreatPulseError> {
        let sql = format!(
            "SELECT {} FROM network_alerts WHERE timestamp >= ? ORDER BY timestamp, network_alert_id",
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
}
