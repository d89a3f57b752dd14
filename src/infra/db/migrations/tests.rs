use super::*;

fn table_names(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .expect("prepare");
    stmt.query_map([], |row| row.get::<_, String>(0))
        .expect("query")
        .map(|r| r.expect("row"))
        .collect()
}

#[test]
fn fresh_database_gets_baseline_schema() {
    let mut conn = Connection::open_in_memory().expect("open in-memory sqlite");
    apply_migrations(&mut conn).expect("migrate");

    let tables = table_names(&conn);
    for expected in [
        "accounting_batches",
        "api_key",
        "daily_stats",
        "model",
        "request",
        "user",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing {expected}");
    }
    assert_eq!(read_user_version(&conn).expect("version"), LATEST_SCHEMA_VERSION);
}

#[test]
fn migrations_are_idempotent() {
    let mut conn = Connection::open_in_memory().expect("open in-memory sqlite");
    apply_migrations(&mut conn).expect("first");
    apply_migrations(&mut conn).expect("second");
    assert_eq!(read_user_version(&conn).expect("version"), LATEST_SCHEMA_VERSION);
}

#[test]
fn legacy_user_table_gains_plan_columns() {
    let mut conn = Connection::open_in_memory().expect("open in-memory sqlite");
    conn.execute_batch(
        r#"
CREATE TABLE user (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  role TEXT NOT NULL DEFAULT 'user',
  credits INTEGER NOT NULL DEFAULT 0
);
INSERT INTO user(id, credits) VALUES (7, 100);
PRAGMA user_version = 1;
"#,
    )
    .expect("legacy schema");

    apply_migrations(&mut conn).expect("migrate");

    let (plan_requests, allow_overspend): (i64, i64) = conn
        .query_row(
            "SELECT plan_requests, allow_overspend FROM user WHERE id = 7",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("select");
    assert_eq!(plan_requests, 0);
    assert_eq!(allow_overspend, 0);
}

#[test]
fn future_schema_version_is_rejected() {
    let mut conn = Connection::open_in_memory().expect("open in-memory sqlite");
    conn.execute_batch("PRAGMA user_version = 99;").expect("set version");
    let err = apply_migrations(&mut conn).expect_err("too new");
    assert!(err.to_string().contains("unsupported sqlite schema version"));
}

#[test]
fn rollup_key_is_unique() {
    let mut conn = Connection::open_in_memory().expect("open in-memory sqlite");
    apply_migrations(&mut conn).expect("migrate");
    conn.execute(
        "INSERT INTO daily_stats(date, user_id, model, model_id) VALUES ('2026-01-01', 1, 'm', 1)",
        [],
    )
    .expect("first insert");
    let dup = conn.execute(
        "INSERT INTO daily_stats(date, user_id, model, model_id) VALUES ('2026-01-01', 1, 'm', 1)",
        [],
    );
    assert!(dup.is_err());
}
