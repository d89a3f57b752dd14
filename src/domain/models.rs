//! Usage: Model catalog (endpoint kinds, per-token prices) with a TTL cache over the read replica.

use crate::infra::db::{from_sql_int, to_sql_int, Db};
use crate::shared::blocking;
use crate::shared::constants::MODEL_CACHE_TTL;
use crate::shared::error::{db_err, AppError, AppResult};
use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::{now_unix_seconds, SharedClock};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointKind {
    Chat,
    Completion,
    Embedding,
    Responses,
}

impl EndpointKind {
    pub const ALL: [EndpointKind; 4] = [
        EndpointKind::Chat,
        EndpointKind::Completion,
        EndpointKind::Embedding,
        EndpointKind::Responses,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "CHAT",
            Self::Completion => "COMPLETION",
            Self::Embedding => "EMBEDDING",
            Self::Responses => "RESPONSES",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    pub const fn upstream_path(self) -> &'static str {
        match self {
            Self::Chat => "/v1/chat/completions",
            Self::Completion => "/v1/completions",
            Self::Embedding => "/v1/embeddings",
            Self::Responses => "/v1/responses",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModelCost {
    pub input_cost_per_token: u64,
    pub output_cost_per_token: u64,
    pub canceled_request_cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub model_id: u64,
    pub name: String,
    pub cost: ModelCost,
    pub endpoint_kinds: Vec<EndpointKind>,
    pub enabled: bool,
    pub allowed_user_id: Option<u64>,
    pub created_at: i64,
}

impl ModelDescriptor {
    pub fn supports(&self, kind: EndpointKind) -> bool {
        self.endpoint_kinds.contains(&kind)
    }

    pub fn visible_to(&self, user_id: u64) -> bool {
        self.allowed_user_id.map_or(true, |owner| owner == user_id)
    }
}

fn parse_endpoint_list(raw: &str) -> Vec<EndpointKind> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        if let Some(kind) = EndpointKind::parse(part) {
            if !out.contains(&kind) {
                out.push(kind);
            }
        }
    }
    out
}

fn format_endpoint_list(kinds: &[EndpointKind]) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

const MODEL_COLUMNS: &str =
    "id, name, icpt, ocpt, crc, supported_endpoints, enabled, allowed_user_id, created_at";

fn row_to_descriptor(row: &Row<'_>) -> rusqlite::Result<ModelDescriptor> {
    let endpoints: String = row.get(5)?;
    let allowed: Option<i64> = row.get(7)?;
    Ok(ModelDescriptor {
        model_id: from_sql_int(row.get(0)?),
        name: row.get(1)?,
        cost: ModelCost {
            input_cost_per_token: from_sql_int(row.get(2)?),
            output_cost_per_token: from_sql_int(row.get(3)?),
            canceled_request_cost: from_sql_int(row.get(4)?),
        },
        endpoint_kinds: parse_endpoint_list(&endpoints),
        enabled: row.get::<_, i64>(6)? != 0,
        allowed_user_id: allowed.map(from_sql_int),
        created_at: row.get(8)?,
    })
}

fn find_by_name(db: &Db, name: &str) -> AppResult<Option<ModelDescriptor>> {
    let conn = db.open_connection()?;
    conn.query_row(
        &format!("SELECT {MODEL_COLUMNS} FROM model WHERE name = ?1 AND enabled = 1"),
        params![name],
        row_to_descriptor,
    )
    .optional()
    .map_err(|e| db_err!("failed to query model {name}: {e}"))
}

/// Private models win: a caller that owns any sees only those, everyone else sees public ones.
pub fn list_visible(db: &Db, user_id: u64) -> AppResult<Vec<ModelDescriptor>> {
    let conn = db.open_connection()?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {MODEL_COLUMNS} FROM model WHERE enabled = 1 AND allowed_user_id = ?1 ORDER BY id"
        ))
        .map_err(|e| db_err!("failed to prepare private model query: {e}"))?;
    let private = stmt
        .query_map(params![to_sql_int(user_id)], row_to_descriptor)
        .map_err(|e| db_err!("failed to list private models: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| db_err!("failed to read private models: {e}"))?;
    if !private.is_empty() {
        return Ok(private);
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {MODEL_COLUMNS} FROM model WHERE enabled = 1 AND allowed_user_id IS NULL ORDER BY id"
        ))
        .map_err(|e| db_err!("failed to prepare public model query: {e}"))?;
    let public = stmt
        .query_map([], row_to_descriptor)
        .map_err(|e| db_err!("failed to list public models: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| db_err!("failed to read public models: {e}"))?;
    Ok(public)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewModel {
    pub name: String,
    #[serde(default)]
    pub icpt: u64,
    #[serde(default)]
    pub ocpt: u64,
    #[serde(default)]
    pub crc: u64,
    pub supported_endpoints: Vec<EndpointKind>,
    #[serde(default)]
    pub allowed_user_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelUpdate {
    pub id: u64,
    pub icpt: Option<u64>,
    pub ocpt: Option<u64>,
    pub crc: Option<u64>,
    pub enabled: Option<bool>,
    pub supported_endpoints: Option<Vec<EndpointKind>>,
}

pub fn create(db: &Db, input: &NewModel) -> AppResult<ModelDescriptor> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::new("SEC_INVALID_INPUT", "model name is required"));
    }
    if input.supported_endpoints.is_empty() {
        return Err(AppError::new(
            "SEC_INVALID_INPUT",
            "at least one supported endpoint is required",
        ));
    }

    let conn = db.open_connection()?;
    conn.execute(
        r#"
INSERT INTO model(name, icpt, ocpt, crc, supported_endpoints, enabled, allowed_user_id, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)
"#,
        params![
            name,
            to_sql_int(input.icpt),
            to_sql_int(input.ocpt),
            to_sql_int(input.crc),
            format_endpoint_list(&input.supported_endpoints),
            input.allowed_user_id.map(to_sql_int),
            now_unix_seconds(),
        ],
    )
    .map_err(|e| db_err!("failed to insert model {name}: {e}"))?;

    let id = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {MODEL_COLUMNS} FROM model WHERE id = ?1"),
        params![id],
        row_to_descriptor,
    )
    .map_err(|e| db_err!("failed to read back model {id}: {e}"))
}

/// Returns the model name so the caller can invalidate its cache entry.
pub fn update(db: &Db, input: &ModelUpdate) -> AppResult<Option<String>> {
    let conn = db.open_connection()?;
    let changed = conn
        .execute(
            r#"
UPDATE model SET
  icpt = COALESCE(?2, icpt),
  ocpt = COALESCE(?3, ocpt),
  crc = COALESCE(?4, crc),
  enabled = COALESCE(?5, enabled),
  supported_endpoints = COALESCE(?6, supported_endpoints)
WHERE id = ?1
"#,
            params![
                to_sql_int(input.id),
                input.icpt.map(to_sql_int),
                input.ocpt.map(to_sql_int),
                input.crc.map(to_sql_int),
                input.enabled.map(i64::from),
                input
                    .supported_endpoints
                    .as_deref()
                    .filter(|kinds| !kinds.is_empty())
                    .map(format_endpoint_list),
            ],
        )
        .map_err(|e| db_err!("failed to update model {}: {e}", input.id))?;
    if changed == 0 {
        return Ok(None);
    }
    conn.query_row(
        "SELECT name FROM model WHERE id = ?1",
        params![to_sql_int(input.id)],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| db_err!("failed to read model name {}: {e}", input.id))
}

pub fn delete(db: &Db, model_id: u64) -> AppResult<Option<String>> {
    let conn = db.open_connection()?;
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM model WHERE id = ?1",
            params![to_sql_int(model_id)],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| db_err!("failed to read model {model_id}: {e}"))?;
    if name.is_some() {
        conn.execute("DELETE FROM model WHERE id = ?1", params![to_sql_int(model_id)])
            .map_err(|e| db_err!("failed to delete model {model_id}: {e}"))?;
    }
    Ok(name)
}

#[derive(Debug, Clone)]
struct CachedModel {
    value: ModelDescriptor,
    fetched_at: Duration,
}

/// Name-keyed descriptor cache. Only hits are cached, so a newly created model is visible at once.
pub struct ModelCatalog {
    db: Db,
    clock: SharedClock,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedModel>>,
}

impl ModelCatalog {
    pub fn new(db: Db, clock: SharedClock) -> Self {
        Self {
            db,
            clock,
            ttl: MODEL_CACHE_TTL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, name: &str) -> Option<ModelDescriptor> {
        let now = self.clock.now();
        let mut entries = self.entries.lock_or_recover();
        let entry = entries.get(name)?;
        if now.saturating_sub(entry.fetched_at) >= self.ttl {
            entries.remove(name);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Resolves an enabled model the caller may use; private models of other users read as absent.
    pub async fn lookup(&self, name: &str, user_id: u64) -> AppResult<Option<ModelDescriptor>> {
        let descriptor = match self.cached(name) {
            Some(hit) => Some(hit),
            None => {
                let db = self.db.clone();
                let owned = name.to_string();
                let fetched =
                    blocking::run("model_catalog_lookup", move || find_by_name(&db, &owned))
                        .await?;
                if let Some(found) = fetched.as_ref() {
                    self.entries.lock_or_recover().insert(
                        name.to_string(),
                        CachedModel {
                            value: found.clone(),
                            fetched_at: self.clock.now(),
                        },
                    );
                }
                fetched
            }
        };

        Ok(descriptor.filter(|d| d.visible_to(user_id)))
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.lock_or_recover().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::db::testing::temp_databases;
    use crate::shared::time::ManualClock;

    fn new_chat_model(name: &str) -> NewModel {
        NewModel {
            name: name.to_string(),
            icpt: 10,
            ocpt: 20,
            crc: 5,
            supported_endpoints: vec![EndpointKind::Chat, EndpointKind::Completion],
            allowed_user_id: None,
        }
    }

    #[test]
    fn endpoint_kind_parse_and_paths() {
        assert_eq!(EndpointKind::parse(" chat "), Some(EndpointKind::Chat));
        assert_eq!(EndpointKind::parse("nope"), None);
        assert_eq!(
            EndpointKind::Responses.upstream_path(),
            "/v1/responses"
        );
    }

    #[test]
    fn endpoint_list_dedups_and_skips_unknown() {
        assert_eq!(
            parse_endpoint_list("CHAT,bogus,chat,EMBEDDING"),
            vec![EndpointKind::Chat, EndpointKind::Embedding]
        );
    }

    #[tokio::test]
    async fn lookup_caches_hits_until_ttl() {
        let (_dir, dbs) = temp_databases();
        create(&dbs.write, &new_chat_model("llama")).expect("create");

        let clock = ManualClock::new();
        let catalog = ModelCatalog::new(dbs.read.clone(), clock.clone());
        let first = catalog.lookup("llama", 1).await.expect("lookup").expect("found");
        assert_eq!(first.cost.input_cost_per_token, 10);

        let update_input = ModelUpdate {
            id: first.model_id,
            icpt: Some(99),
            ocpt: None,
            crc: None,
            enabled: None,
            supported_endpoints: None,
        };
        update(&dbs.write, &update_input).expect("update");

        let cached = catalog.lookup("llama", 1).await.expect("lookup").expect("found");
        assert_eq!(cached.cost.input_cost_per_token, 10);

        clock.advance(MODEL_CACHE_TTL + Duration::from_secs(1));
        let refreshed = catalog.lookup("llama", 1).await.expect("lookup").expect("found");
        assert_eq!(refreshed.cost.input_cost_per_token, 99);
    }

    #[tokio::test]
    async fn private_model_is_hidden_from_other_users() {
        let (_dir, dbs) = temp_databases();
        {
            let conn = dbs.write.open_connection().expect("conn");
            conn.execute("INSERT INTO user(id, credits) VALUES (1, 0), (2, 0)", [])
                .expect("users");
        }
        let mut input = new_chat_model("private-llama");
        input.allowed_user_id = Some(1);
        create(&dbs.write, &input).expect("create");

        let catalog = ModelCatalog::new(dbs.read.clone(), ManualClock::new());
        assert!(catalog.lookup("private-llama", 1).await.expect("lookup").is_some());
        assert!(catalog.lookup("private-llama", 2).await.expect("lookup").is_none());
    }

    #[test]
    fn list_visible_prefers_private_models() {
        let (_dir, dbs) = temp_databases();
        {
            let conn = dbs.write.open_connection().expect("conn");
            conn.execute("INSERT INTO user(id, credits) VALUES (1, 0)", [])
                .expect("user");
        }
        create(&dbs.write, &new_chat_model("public-a")).expect("create");
        let mut private = new_chat_model("private-b");
        private.allowed_user_id = Some(1);
        create(&dbs.write, &private).expect("create");

        let own = list_visible(&dbs.read, 1).expect("list");
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].name, "private-b");

        let others = list_visible(&dbs.read, 2).expect("list");
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].name, "public-a");
    }

    #[test]
    fn delete_returns_name_once() {
        let (_dir, dbs) = temp_databases();
        let created = create(&dbs.write, &new_chat_model("gone")).expect("create");
        assert_eq!(
            delete(&dbs.write, created.model_id).expect("delete"),
            Some("gone".to_string())
        );
        assert_eq!(delete(&dbs.write, created.model_id).expect("delete"), None);
    }

    #[test]
    fn create_rejects_empty_endpoint_list() {
        let (_dir, dbs) = temp_databases();
        let mut input = new_chat_model("x");
        input.supported_endpoints.clear();
        let err = create(&dbs.write, &input).expect_err("invalid");
        assert_eq!(err.code(), "SEC_INVALID_INPUT");
    }
}
