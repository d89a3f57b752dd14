//! Usage: Read-replica caller lookup joining `api_key` to `user`.

use crate::domain::caller::{Caller, Role};
use crate::domain::identity::CallerStore;
use crate::infra::db::{from_sql_int, Db};
use crate::shared::blocking;
use crate::shared::error::{db_err, AppResult};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

#[derive(Clone)]
pub struct SqliteCallerStore {
    db: Db,
}

impl SqliteCallerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn find_by_api_key_blocking(db: &Db, api_key: &str) -> AppResult<Option<Caller>> {
    let conn = db.open_connection()?;
    conn.query_row(
        r#"
SELECT u.id, u.role, u.credits, u.plan_requests, u.allow_overspend
FROM api_key k
JOIN user u ON u.id = k.user_id
WHERE k.id = ?1
"#,
        params![api_key],
        |row| {
            let role: String = row.get(1)?;
            let plan_requests: i64 = row.get(3)?;
            Ok(Caller {
                user_id: from_sql_int(row.get(0)?),
                role: Role::parse(&role),
                credits: from_sql_int(row.get(2)?),
                plan_requests: u32::try_from(plan_requests.max(0)).unwrap_or(u32::MAX),
                allow_overspend: row.get::<_, i64>(4)? != 0,
                api_key: api_key.to_string(),
            })
        },
    )
    .optional()
    .map_err(|e| db_err!("failed to look up api key: {e}"))
}

#[async_trait]
impl CallerStore for SqliteCallerStore {
    async fn find_by_api_key(&self, api_key: &str) -> AppResult<Option<Caller>> {
        let db = self.db.clone();
        let api_key = api_key.to_string();
        blocking::run("caller_lookup", move || {
            find_by_api_key_blocking(&db, &api_key)
        })
        .await
    }
}
