//! Usage: Write one flush batch (detail insert + additive rollup upsert) in a single transaction.

use super::rollup::FlushBatch;
use crate::infra::db::to_sql_int;
use crate::shared::error::{db_err, AppResult};
use crate::shared::time::{duration_millis_i64, now_unix_seconds};
use rusqlite::{params, Connection, TransactionBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { details: usize, rollups: usize },
    AlreadyApplied,
}

pub(crate) fn apply_batch(conn: &mut Connection, batch: &FlushBatch) -> AppResult<ApplyOutcome> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_err!("failed to start flush transaction: {e}"))?;

    let claimed = tx
        .execute(
            "INSERT INTO accounting_batches(batch_id, record_count, applied_at) VALUES (?1, ?2, ?3) ON CONFLICT(batch_id) DO NOTHING",
            params![
                batch.batch_id,
                to_sql_int(batch.record_count as u64),
                now_unix_seconds()
            ],
        )
        .map_err(|e| db_err!("failed to claim batch {}: {e}", batch.batch_id))?;
    if claimed == 0 {
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    let mut details = 0usize;
    {
        let mut stmt = tx
            .prepare_cached(
                r#"
INSERT INTO request(
  request_id, user_id, model_id, endpoint,
  prompt_tokens, completion_tokens, total_tokens, total_credits,
  time_to_first_token_ms, total_time_ms, error_code, created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(request_id) DO NOTHING
"#,
            )
            .map_err(|e| db_err!("failed to prepare detail insert: {e}"))?;

        for record in &batch.details {
            details += stmt
                .execute(params![
                    record.request_id,
                    to_sql_int(record.user_id),
                    to_sql_int(record.model_id),
                    record.endpoint.as_str(),
                    to_sql_int(record.usage.prompt_tokens),
                    to_sql_int(record.usage.completion_tokens),
                    to_sql_int(record.usage.total_tokens),
                    to_sql_int(record.total_credits),
                    duration_millis_i64(record.time_to_first_token_or_zero()),
                    duration_millis_i64(record.total_time),
                    record.error_code,
                    record.created_at.timestamp(),
                ])
                .map_err(|e| db_err!("failed to insert request {}: {e}", record.request_id))?;
        }
    }

    {
        let mut stmt = tx
            .prepare_cached(
                r#"
INSERT INTO daily_stats(
  date, user_id, model, model_id,
  request_count, input_tokens, output_tokens, total_spend,
  time_to_first_token_ms, total_time_ms, canceled_requests
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(date, user_id, model_id) DO UPDATE SET
  model = excluded.model,
  request_count = request_count + excluded.request_count,
  input_tokens = input_tokens + excluded.input_tokens,
  output_tokens = output_tokens + excluded.output_tokens,
  total_spend = total_spend + excluded.total_spend,
  time_to_first_token_ms = time_to_first_token_ms + excluded.time_to_first_token_ms,
  total_time_ms = total_time_ms + excluded.total_time_ms,
  canceled_requests = canceled_requests + excluded.canceled_requests
"#,
            )
            .map_err(|e| db_err!("failed to prepare rollup upsert: {e}"))?;

        for (key, value) in &batch.rollups {
            stmt.execute(params![
                key.date,
                to_sql_int(key.user_id),
                value.model_name,
                to_sql_int(key.model_id),
                to_sql_int(value.request_count),
                to_sql_int(value.input_tokens),
                to_sql_int(value.output_tokens),
                to_sql_int(value.total_spend),
                to_sql_int(value.time_to_first_token_ms),
                to_sql_int(value.total_time_ms),
                to_sql_int(value.canceled_requests),
            ])
            .map_err(|e| {
                db_err!(
                    "failed to upsert rollup ({}, {}, {}): {e}",
                    key.date,
                    key.user_id,
                    key.model_id
                )
            })?;
        }
    }

    tx.commit()
        .map_err(|e| db_err!("failed to commit batch {}: {e}", batch.batch_id))?;

    Ok(ApplyOutcome::Applied {
        details,
        rollups: batch.rollups.len(),
    })
}
