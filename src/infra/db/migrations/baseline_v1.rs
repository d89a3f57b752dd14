//! Usage: Baseline schema (version 1) for fresh databases.

use rusqlite::Connection;

pub(super) fn create_baseline_v1(conn: &mut Connection) -> crate::shared::error::AppResult<()> {
    let tx = conn
        .transaction()
        .map_err(|e| format!("failed to start sqlite transaction: {e}"))?;

    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS user (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  role TEXT NOT NULL DEFAULT 'user',
  credits INTEGER NOT NULL DEFAULT 0 CHECK (credits >= 0),
  plan_requests INTEGER NOT NULL DEFAULT 0 CHECK (plan_requests >= 0),
  allow_overspend INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);

CREATE TABLE IF NOT EXISTS api_key (
  id TEXT PRIMARY KEY,
  user_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
  created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);

CREATE INDEX IF NOT EXISTS idx_api_key_user_id ON api_key(user_id);

CREATE TABLE IF NOT EXISTS model (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  icpt INTEGER NOT NULL DEFAULT 0,
  ocpt INTEGER NOT NULL DEFAULT 0,
  crc INTEGER NOT NULL DEFAULT 0,
  supported_endpoints TEXT NOT NULL DEFAULT 'CHAT',
  enabled INTEGER NOT NULL DEFAULT 1,
  allowed_user_id INTEGER REFERENCES user(id) ON DELETE CASCADE,
  created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);

CREATE TABLE IF NOT EXISTS request (
  request_id TEXT PRIMARY KEY,
  user_id INTEGER NOT NULL,
  model_id INTEGER NOT NULL,
  endpoint TEXT NOT NULL,
  prompt_tokens INTEGER NOT NULL DEFAULT 0,
  completion_tokens INTEGER NOT NULL DEFAULT 0,
  total_tokens INTEGER NOT NULL DEFAULT 0,
  total_credits INTEGER NOT NULL DEFAULT 0,
  time_to_first_token_ms INTEGER NOT NULL DEFAULT 0,
  total_time_ms INTEGER NOT NULL DEFAULT 0,
  error_code TEXT,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_request_user_created ON request(user_id, created_at);

CREATE TABLE IF NOT EXISTS daily_stats (
  date TEXT NOT NULL,
  user_id INTEGER NOT NULL,
  model TEXT NOT NULL,
  model_id INTEGER NOT NULL,
  request_count INTEGER NOT NULL DEFAULT 0,
  input_tokens INTEGER NOT NULL DEFAULT 0,
  output_tokens INTEGER NOT NULL DEFAULT 0,
  total_spend INTEGER NOT NULL DEFAULT 0,
  time_to_first_token_ms INTEGER NOT NULL DEFAULT 0,
  total_time_ms INTEGER NOT NULL DEFAULT 0,
  canceled_requests INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (date, user_id, model_id)
);

CREATE TABLE IF NOT EXISTS accounting_batches (
  batch_id TEXT PRIMARY KEY,
  record_count INTEGER NOT NULL,
  applied_at INTEGER NOT NULL
);
"#,
    )
    .map_err(|e| format!("failed to create baseline schema: {e}"))?;

    super::set_user_version(&tx, 1)?;

    tx.commit()
        .map_err(|e| format!("failed to commit sqlite transaction: {e}"))?;

    Ok(())
}
