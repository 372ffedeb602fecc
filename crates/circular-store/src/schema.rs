/// SQL DDL for the circular ledger database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id TEXT PRIMARY KEY,
    activity_id TEXT NOT NULL,
    title TEXT NOT NULL,
    intro TEXT,
    signature_deadline TEXT,
    state TEXT NOT NULL DEFAULT 'draft',
    config TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaign_fields (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL REFERENCES campaigns(id),
    name TEXT NOT NULL,
    field_type TEXT NOT NULL,
    label TEXT NOT NULL,
    required INTEGER NOT NULL DEFAULT 0,
    options TEXT NOT NULL DEFAULT '[]',
    position INTEGER NOT NULL,
    UNIQUE (campaign_id, name)
);

CREATE TABLE IF NOT EXISTS responses (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL REFERENCES campaigns(id),
    child_id TEXT NOT NULL,
    guardian_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    medical_snapshot TEXT NOT NULL,
    contacts_snapshot TEXT NOT NULL,
    custom_answers TEXT NOT NULL,
    signature_kind TEXT NOT NULL,
    signature_data TEXT NOT NULL,
    signer_ip TEXT,
    signer_user_agent TEXT,
    signed_at TEXT NOT NULL,
    state TEXT NOT NULL,
    external_id TEXT,
    location TEXT,
    content_hash TEXT,
    local_path TEXT,
    renderer TEXT,
    render_notes TEXT,
    error_detail TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (campaign_id, child_id, version),
    CHECK (state <> 'pdf_generado' OR content_hash IS NOT NULL),
    CHECK (state <> 'archivada' OR (content_hash IS NOT NULL AND external_id IS NOT NULL))
);

-- At most one live row per (campaign, child).
CREATE UNIQUE INDEX IF NOT EXISTS idx_responses_one_live
    ON responses(campaign_id, child_id)
    WHERE state NOT IN ('superseded', 'anulada');

CREATE INDEX IF NOT EXISTS idx_responses_campaign_state ON responses(campaign_id, state);
CREATE INDEX IF NOT EXISTS idx_responses_state_updated ON responses(state, updated_at);
CREATE INDEX IF NOT EXISTS idx_fields_campaign ON campaign_fields(campaign_id, position);
CREATE INDEX IF NOT EXISTS idx_campaigns_state ON campaigns(state);

CREATE TRIGGER IF NOT EXISTS responses_frozen_columns
BEFORE UPDATE OF campaign_id, child_id, guardian_id, version, medical_snapshot,
    contacts_snapshot, custom_answers, signature_kind, signature_data,
    signer_ip, signer_user_agent, signed_at
ON responses
BEGIN
    SELECT RAISE(ABORT, 'response snapshots are immutable');
END;

CREATE TRIGGER IF NOT EXISTS responses_append_only
BEFORE DELETE ON responses
BEGIN
    SELECT RAISE(ABORT, 'responses are never deleted');
END;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
