use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Executor, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::*;

// ─── Account Queries ────────────────────────────────────────────────────────

/// Insert a new account row.
pub async fn insert_account<'e, E>(executor: E, account: &Account) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO accounts (id, referral_code, balance, verified, active, affiliation,
                              payout_pin_hash, bank_details, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(account.id)
    .bind(&account.referral_code)
    .bind(account.balance)
    .bind(account.verified)
    .bind(account.active)
    .bind(&account.affiliation)
    .bind(&account.payout_pin_hash)
    .bind(&account.bank_details)
    .bind(account.created_at)
    .bind(account.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Get a single account by id.
pub async fn get_account<'e, E>(executor: E, id: Uuid) -> Result<Option<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Lock account rows for the rest of the transaction.
/// Rows are locked in id order so two transactions touching the same pair
/// of accounts can never deadlock on each other.
pub async fn lock_accounts<'e, E>(executor: E, ids: &[Uuid]) -> Result<Vec<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(executor)
    .await
}

/// Resolve an active account by referral code.
pub async fn find_account_by_code<'e, E>(
    executor: E,
    code: &str,
) -> Result<Option<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE referral_code = $1 AND active")
        .bind(code)
        .fetch_optional(executor)
        .await
}

/// Overwrite a locked account's balance.
/// Callers must hold the row lock taken by [`lock_accounts`].
pub async fn update_balance<'e, E>(
    executor: E,
    id: Uuid,
    balance: i64,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query("UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(balance)
        .bind(at)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

/// Flip the verified flag. Returns without touching rows already verified.
pub async fn mark_verified<'e, E>(executor: E, id: Uuid, at: DateTime<Utc>) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "UPDATE accounts SET verified = TRUE, updated_at = $2 WHERE id = $1 AND NOT verified",
    )
    .bind(id)
    .bind(at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_payout_pin_hash<'e, E>(
    executor: E,
    id: Uuid,
    hash: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE accounts SET payout_pin_hash = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(hash)
        .bind(at)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn set_bank_details<'e, E>(
    executor: E,
    id: Uuid,
    details: &BankDetails,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE accounts SET bank_details = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(Json(details))
        .bind(at)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn set_account_active<'e, E>(
    executor: E,
    id: Uuid,
    active: bool,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE accounts SET active = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(active)
        .bind(at)
        .execute(executor)
        .await?;
    Ok(())
}

// ─── Ledger Queries ─────────────────────────────────────────────────────────

/// Insert a batch of ledger entries using a single multi-value INSERT.
pub async fn insert_ledger_entries<'e, E>(
    executor: E,
    entries: &[LedgerEntry],
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    if entries.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO ledger_entries (id, account_id, delta, reason_code, correlation_id, idempotency_key, created_at) ",
    );

    qb.push_values(entries, |mut b, e| {
        b.push_bind(e.id)
            .push_bind(e.account_id)
            .push_bind(e.delta)
            .push_bind(e.reason_code)
            .push_bind(e.correlation_id)
            .push_bind(&e.idempotency_key)
            .push_bind(e.created_at);
    });

    qb.build().execute(executor).await?;
    Ok(())
}

/// Sum and count of an account's ledger entries.
pub async fn get_ledger_summary<'e, E>(executor: E, account: Uuid) -> Result<LedgerSummary, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(delta), 0)::BIGINT, COUNT(*) FROM ledger_entries WHERE account_id = $1",
    )
    .bind(account)
    .fetch_one(executor)
    .await?;
    Ok(LedgerSummary {
        total: row.0,
        entry_count: row.1,
    })
}

/// Get the most recent entries for an account.
pub async fn get_account_entries<'e, E>(
    executor: E,
    account: Uuid,
    limit: i64,
) -> Result<Vec<LedgerEntry>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, LedgerEntry>(
        "SELECT * FROM ledger_entries WHERE account_id = $1 ORDER BY created_at DESC, id LIMIT $2",
    )
    .bind(account)
    .bind(limit)
    .fetch_all(executor)
    .await
}

// ─── Idempotency Queries ────────────────────────────────────────────────────

/// Claim an idempotency key. Returns `false` if another transaction owns it.
/// A concurrent claimant blocks on the unique index until the owner commits.
pub async fn reserve_idempotency_key<'e, E>(executor: E, key: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result =
        sqlx::query("INSERT INTO idempotency_keys (key) VALUES ($1) ON CONFLICT (key) DO NOTHING")
            .bind(key)
            .execute(executor)
            .await?;
    Ok(result.rows_affected() == 1)
}

/// Get the stored outcome for a claimed key.
pub async fn get_idempotent_result<'e, E>(
    executor: E,
    key: &str,
) -> Result<Option<serde_json::Value>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(Option<serde_json::Value>,)> =
        sqlx::query_as("SELECT result FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .fetch_optional(executor)
            .await?;
    Ok(row.and_then(|r| r.0))
}

pub async fn store_idempotent_result<'e, E>(
    executor: E,
    key: &str,
    result: &serde_json::Value,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE idempotency_keys SET result = $2 WHERE key = $1")
        .bind(key)
        .bind(result)
        .execute(executor)
        .await?;
    Ok(())
}

// ─── Referral Queries ───────────────────────────────────────────────────────

pub async fn get_redemption<'e, E>(
    executor: E,
    referee: Uuid,
) -> Result<Option<ReferralRedemption>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, ReferralRedemption>(
        "SELECT * FROM referral_redemptions WHERE referee_id = $1",
    )
    .bind(referee)
    .fetch_optional(executor)
    .await
}

pub async fn insert_redemption<'e, E>(
    executor: E,
    redemption: &ReferralRedemption,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO referral_redemptions (referee_id, referrer_id, correlation_id, applied_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(redemption.referee_id)
    .bind(redemption.referrer_id)
    .bind(redemption.correlation_id)
    .bind(redemption.applied_at)
    .execute(executor)
    .await?;
    Ok(())
}

// ─── Mission Queries ────────────────────────────────────────────────────────

pub async fn insert_mission<'e, E>(executor: E, mission: &Mission) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO missions (id, title, reward_points, qr_token, active, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(mission.id)
    .bind(&mission.title)
    .bind(mission.reward_points)
    .bind(&mission.qr_token)
    .bind(mission.active)
    .bind(mission.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_mission<'e, E>(executor: E, id: Uuid) -> Result<Option<Mission>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Mission>("SELECT * FROM missions WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn find_submission<'e, E>(
    executor: E,
    user: Uuid,
    mission: Uuid,
) -> Result<Option<MissionSubmission>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, MissionSubmission>(
        "SELECT * FROM mission_submissions WHERE user_id = $1 AND mission_id = $2",
    )
    .bind(user)
    .bind(mission)
    .fetch_optional(executor)
    .await
}

pub async fn lock_submission<'e, E>(
    executor: E,
    id: Uuid,
) -> Result<Option<MissionSubmission>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, MissionSubmission>(
        "SELECT * FROM mission_submissions WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn insert_submission<'e, E>(
    executor: E,
    s: &MissionSubmission,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO mission_submissions (id, user_id, mission_id, proof_type, proof_ref, status,
                                         reviewer_comment, reviewer_id, heuristic_brightness,
                                         heuristic_variance, created_at, reviewed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(s.id)
    .bind(s.user_id)
    .bind(s.mission_id)
    .bind(s.proof_type)
    .bind(&s.proof_ref)
    .bind(s.status)
    .bind(&s.reviewer_comment)
    .bind(s.reviewer_id)
    .bind(s.heuristic_brightness)
    .bind(s.heuristic_variance)
    .bind(s.created_at)
    .bind(s.reviewed_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Apply a reviewer decision. Only pending submissions move.
pub async fn review_submission<'e, E>(
    executor: E,
    id: Uuid,
    review: &SubmissionReview,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE mission_submissions
        SET status = $2, reviewer_id = $3, reviewer_comment = $4, reviewed_at = $5
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(review.status)
    .bind(review.reviewer_id)
    .bind(&review.reviewer_comment)
    .bind(review.reviewed_at)
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

pub async fn get_pending_submissions<'e, E>(
    executor: E,
    limit: i64,
) -> Result<Vec<MissionSubmission>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, MissionSubmission>(
        "SELECT * FROM mission_submissions WHERE status = 'pending' ORDER BY created_at LIMIT $1",
    )
    .bind(limit)
    .fetch_all(executor)
    .await
}

// ─── Shop & Stamp Queries ───────────────────────────────────────────────────

pub async fn insert_shop<'e, E>(executor: E, shop: &Shop) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO shops (id, owner_id, name, latitude, longitude) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(shop.id)
    .bind(shop.owner_id)
    .bind(&shop.name)
    .bind(shop.latitude)
    .bind(shop.longitude)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_shop<'e, E>(executor: E, id: Uuid) -> Result<Option<Shop>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, Shop>("SELECT * FROM shops WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Most recent stamp for a (user, shop) pair.
pub async fn get_latest_stamp<'e, E>(
    executor: E,
    user: Uuid,
    shop: Uuid,
) -> Result<Option<StampGrant>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, StampGrant>(
        r#"
        SELECT * FROM stamp_grants
        WHERE user_id = $1 AND shop_id = $2
        ORDER BY granted_at DESC
        LIMIT 1
        "#,
    )
    .bind(user)
    .bind(shop)
    .fetch_optional(executor)
    .await
}

pub async fn insert_stamp<'e, E>(executor: E, stamp: &StampGrant) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO stamp_grants (id, user_id, shop_id, granted_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(stamp.id)
    .bind(stamp.user_id)
    .bind(stamp.shop_id)
    .bind(stamp.granted_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn count_stamps<'e, E>(executor: E, user: Uuid, shop: Uuid) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM stamp_grants WHERE user_id = $1 AND shop_id = $2")
            .bind(user)
            .bind(shop)
            .fetch_one(executor)
            .await?;
    Ok(row.0)
}

// ─── Verification Queries ───────────────────────────────────────────────────

pub async fn vote_exists<'e, E>(executor: E, validator: Uuid, target: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM verification_votes WHERE validator_id = $1 AND target_id = $2)",
    )
    .bind(validator)
    .bind(target)
    .fetch_one(executor)
    .await?;
    Ok(row.0)
}

pub async fn insert_vote<'e, E>(executor: E, vote: &VerificationVote) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO verification_votes (validator_id, target_id, created_at) VALUES ($1, $2, $3)",
    )
    .bind(vote.validator_id)
    .bind(vote.target_id)
    .bind(vote.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn count_votes<'e, E>(executor: E, target: Uuid) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM verification_votes WHERE target_id = $1")
        .bind(target)
        .fetch_one(executor)
        .await?;
    Ok(row.0)
}

// ─── Payout Queries ─────────────────────────────────────────────────────────

/// Funds held by open (`pending` or `approved`) payout requests.
pub async fn get_locked_payout_total<'e, E>(executor: E, account: Uuid) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0)::BIGINT
        FROM payout_requests
        WHERE account_id = $1 AND status IN ('pending', 'approved')
        "#,
    )
    .bind(account)
    .fetch_one(executor)
    .await?;
    Ok(row.0)
}

pub async fn insert_payout<'e, E>(executor: E, p: &PayoutRequest) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO payout_requests (id, account_id, amount, status, bank_snapshot,
                                     reject_reason, processed_by, created_at, processed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(p.id)
    .bind(p.account_id)
    .bind(p.amount)
    .bind(p.status)
    .bind(&p.bank_snapshot)
    .bind(&p.reject_reason)
    .bind(p.processed_by)
    .bind(p.created_at)
    .bind(p.processed_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn lock_payout<'e, E>(executor: E, id: Uuid) -> Result<Option<PayoutRequest>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, PayoutRequest>("SELECT * FROM payout_requests WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Move a payout request to a new status. The bank snapshot is never touched.
pub async fn transition_payout<'e, E>(
    executor: E,
    id: Uuid,
    t: &PayoutTransition,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE payout_requests
        SET status = $2, processed_by = $3, processed_at = $4, reject_reason = $5
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(t.status)
    .bind(t.processed_by)
    .bind(t.processed_at)
    .bind(&t.reject_reason)
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

pub async fn get_payouts_for_account<'e, E>(
    executor: E,
    account: Uuid,
) -> Result<Vec<PayoutRequest>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, PayoutRequest>(
        "SELECT * FROM payout_requests WHERE account_id = $1 ORDER BY created_at DESC",
    )
    .bind(account)
    .fetch_all(executor)
    .await
}
