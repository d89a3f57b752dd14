//! Usage: SQLite schema migrations (user_version + idempotent ensure patches).

mod baseline_v1;
mod ensure;

use rusqlite::Connection;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub(super) fn apply_migrations(conn: &mut Connection) -> crate::shared::error::AppResult<()> {
    let user_version = read_user_version(conn)?;

    if user_version < 0 || user_version > LATEST_SCHEMA_VERSION {
        return Err(format!(
            "unsupported sqlite schema version: user_version={user_version} (expected 0..={LATEST_SCHEMA_VERSION})"
        )
        .into());
    }

    if user_version == 0 {
        baseline_v1::create_baseline_v1(conn)?;
        tracing::info!(
            to_version = read_user_version(conn)?,
            "sqlite baseline schema created"
        );
    }

    ensure::apply_ensure_patches(conn)?;

    Ok(())
}

fn read_user_version(conn: &Connection) -> crate::shared::error::AppResult<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| format!("failed to read sqlite user_version: {e}").into())
}

pub(super) fn set_user_version(
    tx: &rusqlite::Transaction<'_>,
    version: i64,
) -> crate::shared::error::AppResult<()> {
    tx.pragma_update(None, "user_version", version)
        .map_err(|e| format!("failed to update sqlite user_version: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests;
