//! Usage: Idempotent ensure patches applied after versioned migrations.
//!
//! Older user tables may predate plan subscriptions; the plan columns are added when missing.

use rusqlite::Connection;

pub(super) fn apply_ensure_patches(conn: &mut Connection) -> crate::shared::error::AppResult<()> {
    ensure_user_plan_columns(conn)?;
    Ok(())
}

fn ensure_user_plan_columns(conn: &mut Connection) -> crate::shared::error::AppResult<()> {
    let tx = conn
        .transaction()
        .map_err(|e| format!("failed to start sqlite transaction: {e}"))?;

    let has = |column: &str| {
        has_column(&tx, "user", column).map_err(|e| format!("failed to inspect user.{column}: {e}"))
    };

    if !has("plan_requests")? {
        tx.execute_batch(
            "ALTER TABLE user ADD COLUMN plan_requests INTEGER NOT NULL DEFAULT 0 CHECK (plan_requests >= 0);",
        )
        .map_err(|e| format!("failed to add user.plan_requests: {e}"))?;
    }
    if !has("allow_overspend")? {
        tx.execute_batch("ALTER TABLE user ADD COLUMN allow_overspend INTEGER NOT NULL DEFAULT 0;")
            .map_err(|e| format!("failed to add user.allow_overspend: {e}"))?;
    }

    tx.commit()
        .map_err(|e| format!("failed to commit sqlite transaction: {e}"))?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        [table, column],
        |row| row.get(0),
    )
}
