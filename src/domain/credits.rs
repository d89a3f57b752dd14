//! Usage: Credit computation and the row-locked balance debit.
//!
//! Plan requests are consumed before monetary credits; both balances floor at zero.

use super::models::ModelCost;
use super::usage::TokenUsage;
use crate::infra::db::{from_sql_int, to_sql_int, Db};
use crate::shared::blocking;
use crate::shared::error::{db_err, AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

pub const REQUESTS_PER_CALL: u32 = 1;

pub fn credits_for(usage: &TokenUsage, cost: &ModelCost) -> u64 {
    if usage.is_canceled {
        return cost.canceled_request_cost;
    }
    cost.input_cost_per_token
        .saturating_mul(usage.prompt_tokens)
        .saturating_add(cost.output_cost_per_token.saturating_mul(usage.completion_tokens))
}

/// Errored requests that never produced a completion token are billed like cancellations.
pub fn credits_for_outcome(usage: &TokenUsage, cost: &ModelCost, errored: bool) -> u64 {
    if errored && usage.completion_tokens == 0 {
        return cost.canceled_request_cost;
    }
    credits_for(usage, cost)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Balance {
    plan_requests: u32,
    credits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChargeOutcome {
    pub plan_requests_used: u32,
    pub credits_debited: u64,
    /// Owed credits that could not be taken because the balance hit zero.
    pub shortfall: u64,
}

fn apply_charge(balance: Balance, requests_used: u32, credits_used: u64) -> (Balance, ChargeOutcome) {
    if balance.plan_requests >= 1 {
        let used = requests_used.min(balance.plan_requests);
        let next = Balance {
            plan_requests: balance.plan_requests - used,
            credits: balance.credits,
        };
        return (
            next,
            ChargeOutcome {
                plan_requests_used: used,
                ..ChargeOutcome::default()
            },
        );
    }

    let debited = credits_used.min(balance.credits);
    let next = Balance {
        plan_requests: balance.plan_requests,
        credits: balance.credits - debited,
    };
    (
        next,
        ChargeOutcome {
            plan_requests_used: 0,
            credits_debited: debited,
            shortfall: credits_used - debited,
        },
    )
}

pub(crate) fn charge_blocking(
    conn: &mut Connection,
    user_id: u64,
    requests_used: u32,
    credits_used: u64,
) -> AppResult<ChargeOutcome> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_err!("failed to start charge transaction: {e}"))?;

    let row: Option<(i64, i64, i64)> = tx
        .query_row(
            "SELECT plan_requests, credits, allow_overspend FROM user WHERE id = ?1",
            params![to_sql_int(user_id)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| db_err!("failed to read balance for user {user_id}: {e}"))?;
    let Some((plan_requests, credits, allow_overspend)) = row else {
        return Err(AppError::new(
            "DB_NOT_FOUND",
            format!("user {user_id} not found"),
        ));
    };

    let current = Balance {
        plan_requests: u32::try_from(plan_requests.max(0)).unwrap_or(u32::MAX),
        credits: from_sql_int(credits),
    };
    let (next, outcome) = apply_charge(current, requests_used, credits_used);

    tx.execute(
        "UPDATE user SET plan_requests = ?2, credits = ?3 WHERE id = ?1",
        params![
            to_sql_int(user_id),
            i64::from(next.plan_requests),
            to_sql_int(next.credits)
        ],
    )
    .map_err(|e| db_err!("failed to update balance for user {user_id}: {e}"))?;

    tx.commit()
        .map_err(|e| db_err!("failed to commit charge for user {user_id}: {e}"))?;

    if outcome.shortfall > 0 {
        tracing::warn!(
            user_id,
            shortfall = outcome.shortfall,
            allow_overspend = allow_overspend != 0,
            "credit balance floored at zero"
        );
    }

    Ok(outcome)
}

/// Sole hot-path writer of `user.plan_requests` and `user.credits`.
#[derive(Clone)]
pub struct CreditEngine {
    db: Db,
}

impl CreditEngine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn charge(
        &self,
        user_id: u64,
        requests_used: u32,
        credits_used: u64,
    ) -> AppResult<ChargeOutcome> {
        let db = self.db.clone();
        blocking::run("credit_charge", move || {
            let mut conn = db.open_connection()?;
            charge_blocking(&mut conn, user_id, requests_used, credits_used)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::db::testing::temp_databases;

    fn cost(icpt: u64, ocpt: u64, crc: u64) -> ModelCost {
        ModelCost {
            input_cost_per_token: icpt,
            output_cost_per_token: ocpt,
            canceled_request_cost: crc,
        }
    }

    fn seed_user(db: &Db, id: u64, credits: u64, plan_requests: u32, allow_overspend: bool) {
        let conn = db.open_connection().expect("conn");
        conn.execute(
            "INSERT INTO user(id, credits, plan_requests, allow_overspend) VALUES (?1, ?2, ?3, ?4)",
            params![
                to_sql_int(id),
                to_sql_int(credits),
                i64::from(plan_requests),
                i64::from(allow_overspend)
            ],
        )
        .expect("seed user");
    }

    fn balance_of(db: &Db, id: u64) -> (u64, u32) {
        let conn = db.open_connection().expect("conn");
        conn.query_row(
            "SELECT credits, plan_requests FROM user WHERE id = ?1",
            params![to_sql_int(id)],
            |row| Ok((from_sql_int(row.get(0)?), row.get::<_, i64>(1)? as u32)),
        )
        .expect("balance")
    }

    #[test]
    fn completed_request_is_priced_per_token() {
        let usage = TokenUsage::new(50, 100, false);
        assert_eq!(credits_for(&usage, &cost(10, 20, 7)), 2500);
    }

    #[test]
    fn canceled_request_is_flat_priced() {
        let usage = TokenUsage::new(50, 7, true);
        assert_eq!(credits_for(&usage, &cost(10, 20, 7)), 7);
    }

    #[test]
    fn errored_request_without_tokens_pays_canceled_cost() {
        let empty = TokenUsage::new(50, 0, false);
        assert_eq!(credits_for_outcome(&empty, &cost(10, 20, 7), true), 7);
        let partial = TokenUsage::new(50, 3, false);
        assert_eq!(credits_for_outcome(&partial, &cost(10, 20, 7), true), 560);
        assert_eq!(credits_for_outcome(&empty, &cost(10, 20, 7), false), 500);
    }

    #[test]
    fn plan_requests_are_consumed_first() {
        let (next, outcome) = apply_charge(
            Balance {
                plan_requests: 5,
                credits: 1_000_000,
            },
            1,
            2500,
        );
        assert_eq!(next.plan_requests, 4);
        assert_eq!(next.credits, 1_000_000);
        assert_eq!(outcome.plan_requests_used, 1);
        assert_eq!(outcome.credits_debited, 0);
    }

    #[test]
    fn credits_floor_at_zero() {
        let (next, outcome) = apply_charge(
            Balance {
                plan_requests: 0,
                credits: 100,
            },
            1,
            250,
        );
        assert_eq!(next.credits, 0);
        assert_eq!(outcome.credits_debited, 100);
        assert_eq!(outcome.shortfall, 150);
    }

    #[tokio::test]
    async fn charge_debits_credits_when_no_plan() {
        let (_dir, dbs) = temp_databases();
        seed_user(&dbs.write, 1, 1_000_000, 0, false);
        let engine = CreditEngine::new(dbs.write.clone());

        let outcome = engine.charge(1, REQUESTS_PER_CALL, 2500).await.expect("charge");
        assert_eq!(outcome.credits_debited, 2500);
        assert_eq!(balance_of(&dbs.write, 1), (997_500, 0));
    }

    #[tokio::test]
    async fn charge_prefers_plan_requests() {
        let (_dir, dbs) = temp_databases();
        seed_user(&dbs.write, 1, 1_000_000, 5, false);
        let engine = CreditEngine::new(dbs.write.clone());

        engine.charge(1, REQUESTS_PER_CALL, 2500).await.expect("charge");
        assert_eq!(balance_of(&dbs.write, 1), (1_000_000, 4));
    }

    #[tokio::test]
    async fn overspend_flag_does_not_lift_the_floor() {
        let (_dir, dbs) = temp_databases();
        seed_user(&dbs.write, 1, 10, 0, true);
        let engine = CreditEngine::new(dbs.write.clone());

        let outcome = engine.charge(1, REQUESTS_PER_CALL, 500).await.expect("charge");
        assert_eq!(outcome.shortfall, 490);
        assert_eq!(balance_of(&dbs.write, 1), (0, 0));
    }

    #[tokio::test]
    async fn unknown_user_is_an_error() {
        let (_dir, dbs) = temp_databases();
        let engine = CreditEngine::new(dbs.write.clone());
        let err = engine.charge(404, 1, 1).await.expect_err("missing");
        assert_eq!(err.code(), "DB_NOT_FOUND");
    }

    #[tokio::test]
    async fn concurrent_charges_serialize_on_the_row() {
        let (_dir, dbs) = temp_databases();
        seed_user(&dbs.write, 1, 1000, 0, false);
        let engine = CreditEngine::new(dbs.write.clone());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.charge(1, 1, 30).await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("charge");
        }
        assert_eq!(balance_of(&dbs.write, 1), (700, 0));
    }
}
