pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- One row per unique path. State is one of:
-- 'pending', 'scanning', 'completed', 'failed', 'quarantined'
CREATE TABLE IF NOT EXISTS file_states (
    file_state_id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER,
    md5 TEXT,
    sha256 TEXT,
    state TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    scan_duration_ms INTEGER,
    discovered_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_file_states_state ON file_states (state, started_at);
CREATE INDEX IF NOT EXISTS idx_file_states_completed ON file_states (state, completed_at);

CREATE TABLE IF NOT EXISTS alerts (
    alert_id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_size INTEGER,
    md5 TEXT,
    sha256 TEXT,
    rule_name TEXT NOT NULL,
    rule_namespace TEXT NOT NULL DEFAULT '',
    rule_metadata TEXT NOT NULL DEFAULT '{}',   -- JSON object
    matched_strings TEXT NOT NULL DEFAULT '[]', -- JSON array
    severity INTEGER NOT NULL DEFAULT 5 CHECK (severity BETWEEN 0 AND 10)
);

CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts (created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_path ON alerts (file_path);

-- Written by the external intrusion-detection ingester
CREATE TABLE IF NOT EXISTS network_alerts (
    network_alert_id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    src_ip TEXT NOT NULL,
    src_port INTEGER,
    dest_ip TEXT NOT NULL,
    dest_port INTEGER,
    protocol TEXT NOT NULL DEFAULT '',
    flow_id TEXT,
    signature TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT '',
    severity INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_network_alerts_timestamp ON network_alerts (timestamp);
CREATE INDEX IF NOT EXISTS idx_network_alerts_flow ON network_alerts (flow_id);

CREATE TABLE IF NOT EXISTS correlations (
    correlation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    correlation_type TEXT NOT NULL,        -- 'ip', 'hash', 'time_proximity'
    primary_alert_id INTEGER NOT NULL,
    primary_source TEXT NOT NULL,          -- 'file', 'network'
    related_alerts TEXT NOT NULL,          -- JSON array
    confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
    rationale TEXT NOT NULL,
    summary TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_correlations_primary
    ON correlations (correlation_type, primary_source, primary_alert_id, created_at);

COMMIT;
"#;
