/// Schema for the controller database.
pub const SCHEMA: &str = r#"
-- Named, versioned cache partitions (exist even when empty)
CREATE TABLE IF NOT EXISTS cache_namespaces (
    namespace TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (namespace, version)
);

-- Stored responses, keyed by sha256(method + normalized url)
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    version INTEGER NOT NULL,
    key_hash TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    url TEXT,
    kind TEXT NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, version, key_hash)
);

-- Writes attempted while offline, replayed in seq order
CREATE TABLE IF NOT EXISTS deferred_writes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

-- Controller versions and their lifecycle state
CREATE TABLE IF NOT EXISTS registrations (
    version INTEGER PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
