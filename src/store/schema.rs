//! Schema, executed as one idempotent batch on open.

pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS post (
    creator             TEXT    NOT NULL,
    rkey                TEXT    NOT NULL,
    created_at          INTEGER NOT NULL,
    text                TEXT    NOT NULL DEFAULT '',
    embedding           BLOB,
    alt_text            TEXT,
    alt_text_embedding  BLOB,
    reply_parent        TEXT,
    reply_root          TEXT,
    quoted              TEXT,
    embed_title         TEXT,
    embed_description   TEXT,
    embed_url           TEXT,
    inclusion_reason    TEXT    NOT NULL,
    inclusion_context   TEXT,
    PRIMARY KEY (creator, rkey)
);

CREATE INDEX IF NOT EXISTS idx_post_creator ON post (creator);

CREATE TABLE IF NOT EXISTS repo (
    did TEXT PRIMARY KEY,
    rev TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";
