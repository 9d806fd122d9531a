/// Internal bookkeeping tables. Data tables are created separately, see
/// [`super::LocalStore::create_data_table`].
pub const SCHEMA: &str = r#"
-- Audit trail of remote changes, one row per change id
CREATE TABLE IF NOT EXISTS _sync_remote_changes (
    id VARCHAR PRIMARY KEY,
    change_timestamp VARCHAR NOT NULL,
    sheet_name VARCHAR NOT NULL,
    sheet_row BIGINT NOT NULL,
    sheet_col BIGINT NOT NULL,
    old_value VARCHAR,
    new_value VARCHAR,
    source VARCHAR,
    status VARCHAR NOT NULL,
    recorded_at VARCHAR NOT NULL
);

-- Singleton sync status row (id is always 1)
CREATE TABLE IF NOT EXISTS _sync_status (
    id BIGINT PRIMARY KEY,
    remote_target VARCHAR,
    document_id VARCHAR,
    sync_mode VARCHAR NOT NULL DEFAULT 'manual',
    last_pull VARCHAR,
    last_push VARCHAR,
    total_pulls BIGINT NOT NULL DEFAULT 0,
    total_pushes BIGINT NOT NULL DEFAULT 0,
    total_conflicts BIGINT NOT NULL DEFAULT 0
);

INSERT INTO _sync_status (id) VALUES (1) ON CONFLICT DO NOTHING;

-- Local mutations waiting to be replayed remotely
CREATE SEQUENCE IF NOT EXISTS _sync_changelog_seq START 1;

CREATE TABLE IF NOT EXISTS _sync_changelog (
    id BIGINT PRIMARY KEY DEFAULT nextval('_sync_changelog_seq'),
    table_name VARCHAR NOT NULL,
    row_id BIGINT NOT NULL,
    column_name VARCHAR NOT NULL,
    old_value VARCHAR,
    new_value VARCHAR,
    changed_at VARCHAR NOT NULL,
    pushed_to_sheet BOOLEAN NOT NULL DEFAULT false,
    push_attempts BIGINT NOT NULL DEFAULT 0,
    last_push_error VARCHAR
);

-- Columns whose writes are captured into the changelog
CREATE TABLE IF NOT EXISTS _sync_tracked_columns (
    table_name VARCHAR NOT NULL,
    column_name VARCHAR NOT NULL,
    installed_at VARCHAR NOT NULL
);

-- Sheet <-> table registry (maintained by the schema resolver)
CREATE TABLE IF NOT EXISTS _sync_sheets (
    sheet_name VARCHAR NOT NULL,
    table_name VARCHAR NOT NULL
);

-- Column index registry (maintained by the schema resolver)
CREATE TABLE IF NOT EXISTS _sync_columns (
    sheet_name VARCHAR NOT NULL,
    col_index BIGINT NOT NULL,
    header VARCHAR NOT NULL,
    local_column VARCHAR NOT NULL,
    data_type VARCHAR NOT NULL
);
"#;
