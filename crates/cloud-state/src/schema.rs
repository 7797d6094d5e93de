//! Schema bootstrap: plain `CREATE TABLE IF NOT EXISTS` statements run
//! against a local file at startup rather than a migration framework,
//! since there is exactly one schema version in play.

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_project ON instances(project_id);

CREATE TABLE IF NOT EXISTS volumes (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_volumes_project ON volumes(project_id);

CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    volume_id TEXT NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_volume ON snapshots(volume_id);

CREATE TABLE IF NOT EXISTS fixed_ips (
    address TEXT PRIMARY KEY,
    network_id TEXT NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fixed_ips_network ON fixed_ips(network_id);

CREATE TABLE IF NOT EXISTS floating_ips (
    address TEXT PRIMARY KEY,
    project_id TEXT,
    doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS security_groups (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    doc TEXT NOT NULL,
    UNIQUE(project_id, name)
);

CREATE TABLE IF NOT EXISTS services (
    host TEXT NOT NULL,
    binary TEXT NOT NULL,
    doc TEXT NOT NULL,
    PRIMARY KEY (host, binary)
);

CREATE TABLE IF NOT EXISTS zones (
    id TEXT PRIMARY KEY,
    doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quota_reservations (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reservations_project ON quota_reservations(project_id);

CREATE TABLE IF NOT EXISTS quota_counters (
    project_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (project_id, resource)
);

CREATE TABLE IF NOT EXISTS locks (
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (entity_kind, entity_id)
);
"#;
