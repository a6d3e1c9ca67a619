//! Hikopo API Server: HTTP surface over the points ledger and reward workflows.

use axum::{
    Json, Router, async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use hikopo_core::{AppError, Settings, telemetry};
use hikopo_ledger::{
    Context, Engine, ErrorKind, IdempotencyKey, LedgerError, Principal, Role, TxPolicy,
    mission::{MissionProof, ReviewDecision, ReviewMission, SubmitMission},
    payout::{ApprovePayout, RejectPayout, RequestPayout},
    photo::{HttpPhotoValidator, PhotoHeuristicValidator, UnavailableValidator},
    quorum::CastVote,
    registry::{NewMission, NewShop, OpenAccount},
    stamp::GrantStamp,
    transfer::TransferRequest,
};
use hikopo_storage::{self as storage, PgStore, models::BankDetails};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use uuid::Uuid;

/// Shared application state.
struct AppState {
    engine: Engine<PgStore>,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!("Starting Hikopo API Server");

    // Connect to database
    let pool = storage::connect(&settings.database_url)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

    // Run migrations
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Migration(e.to_string()))?;

    tracing::info!("Database ready");

    let validator: Arc<dyn PhotoHeuristicValidator> = match &settings.photo_validator_url {
        Some(url) => Arc::new(HttpPhotoValidator::new(url, settings.operation_timeout())?),
        None => {
            tracing::warn!("PHOTO_VALIDATOR_URL not set; every photo goes to manual review");
            Arc::new(UnavailableValidator)
        }
    };

    let ctx = Context::new(Arc::new(PgStore::new(pool)))
        .with_policy(TxPolicy::from_settings(&settings))
        .with_rules(settings.rules.clone());
    let state = Arc::new(AppState {
        engine: Engine::new(ctx, validator),
    });

    let app = Router::new()
        .route("/api/v1/accounts", post(open_account))
        .route("/api/v1/accounts/:id", get(get_account))
        .route("/api/v1/accounts/:id/deactivate", post(deactivate_account))
        .route("/api/v1/accounts/:id/balance", get(get_balance))
        .route("/api/v1/accounts/:id/history", get(get_history))
        .route("/api/v1/accounts/:id/reconcile", get(get_reconciliation))
        .route("/api/v1/accounts/:id/payouts", get(list_payouts))
        .route("/api/v1/me/pin", put(set_pin))
        .route("/api/v1/me/bank-details", put(set_bank_details))
        .route("/api/v1/transfers", post(transfer))
        .route("/api/v1/referrals", post(apply_referral))
        .route("/api/v1/missions", post(create_mission))
        .route("/api/v1/missions/:id/submissions", post(submit_mission))
        .route("/api/v1/submissions/pending", get(pending_submissions))
        .route("/api/v1/submissions/:id/review", post(review_submission))
        .route("/api/v1/shops", post(register_shop))
        .route("/api/v1/shops/:id/stamps", post(grant_stamp))
        .route("/api/v1/verifications", post(vote_verification))
        .route("/api/v1/payouts", post(request_payout))
        .route("/api/v1/payouts/:id/approve", post(approve_payout))
        .route("/api/v1/payouts/:id/reject", post(reject_payout))
        .route("/health", get(health))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ─── Caller Identity ────────────────────────────────────────────────────────

/// Principal asserted by the identity proxy in front of this service.
struct Caller(Principal);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let account_id = header(parts, "x-account-id")
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| LedgerError::NotAuthorized("missing or invalid x-account-id".into()))?;
        let role = match header(parts, "x-role").unwrap_or("member") {
            "member" => Role::Member,
            "shop_owner" => Role::ShopOwner,
            "reviewer" => Role::Reviewer,
            "admin" => Role::Admin,
            other => {
                return Err(LedgerError::NotAuthorized(format!("unknown role {other}")).into());
            }
        };
        Ok(Caller(Principal::new(account_id, role)))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<IdempotencyKey>, ApiError> {
    let Some(raw) = headers.get("idempotency-key") else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| LedgerError::InvalidIdempotencyKey("not ASCII".into()))?;
    Ok(Some(IdempotencyKey::new(raw)?))
}

// ─── Query Params & Bodies ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PaginationParams {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TransferBody {
    receiver_code: String,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct ReferralBody {
    code: String,
}

#[derive(Debug, Deserialize)]
struct SubmissionBody {
    proof: MissionProof,
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    decision: ReviewDecision,
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StampBody {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct VoteBody {
    target_id: Uuid,
}

#[derive(Deserialize)]
struct PayoutBody {
    amount: i64,
    pin: String,
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    reason: String,
}

#[derive(Deserialize)]
struct PinBody {
    pin: String,
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error_kind: ErrorKind,
    message: String,
    retryable: bool,
}

#[derive(Serialize)]
struct BalanceResponse {
    account_id: Uuid,
    balance: i64,
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn json_ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        success: true,
        data,
    }))
}

struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Duplicate | ErrorKind::ConcurrencyConflict => StatusCode::CONFLICT,
        ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::ExternalValidationInconclusive => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if self.0.is_fatal() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, ?kind, "Request rejected");
        }
        let body = ErrorBody {
            success: false,
            error_kind: kind,
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

/// POST /api/v1/accounts: register the caller's account.
async fn open_account(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Json(body): Json<OpenAccount>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.open_account(&principal, &body).await?)
}

/// GET /api/v1/accounts/:id
async fn get_account(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.account(&principal, id).await?)
}

/// POST /api/v1/accounts/:id/deactivate: admin only.
async fn deactivate_account(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.deactivate_account(&principal, id).await?)
}

/// GET /api/v1/accounts/:id/balance: committed balance, never a fallback.
async fn get_balance(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<BalanceResponse> {
    let balance = state.engine.balance(&principal, id).await?;
    json_ok(BalanceResponse {
        account_id: id,
        balance,
    })
}

/// GET /api/v1/accounts/:id/history: ledger entries, newest first.
async fn get_history(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(id): Path<Uuid>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<impl Serialize> {
    let limit = params.limit.unwrap_or(50);
    json_ok(state.engine.history(&principal, id, limit).await?)
}

async fn get_reconciliation(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.reconcile(&principal, id).await?)
}

async fn list_payouts(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.payouts(&principal, id).await?)
}

async fn set_pin(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Json(body): Json<PinBody>,
) -> ApiResult<()> {
    state.engine.set_payout_pin(&principal, &body.pin).await?;
    json_ok(())
}

async fn set_bank_details(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Json(body): Json<BankDetails>,
) -> ApiResult<()> {
    state.engine.set_bank_details(&principal, &body).await?;
    json_ok(())
}

/// POST /api/v1/transfers: requires an Idempotency-Key header.
async fn transfer(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    headers: HeaderMap,
    Json(body): Json<TransferBody>,
) -> ApiResult<impl Serialize> {
    let idempotency_key = idempotency_key(&headers)?.ok_or_else(|| {
        LedgerError::InvalidIdempotencyKey("Idempotency-Key header is required".into())
    })?;
    let req = TransferRequest {
        receiver_code: body.receiver_code,
        amount: body.amount,
        idempotency_key,
    };
    json_ok(state.engine.transfer(&principal, &req).await?)
}

async fn apply_referral(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Json(body): Json<ReferralBody>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.apply_referral(&principal, &body.code).await?)
}

/// POST /api/v1/missions: admin only.
async fn create_mission(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Json(body): Json<NewMission>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.create_mission(&principal, &body).await?)
}

async fn submit_mission(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(mission_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<SubmissionBody>,
) -> ApiResult<impl Serialize> {
    let req = SubmitMission {
        mission_id,
        proof: body.proof,
        idempotency_key: idempotency_key(&headers)?,
    };
    json_ok(state.engine.submit_mission(&principal, &req).await?)
}

async fn pending_submissions(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Query(params): Query<PaginationParams>,
) -> ApiResult<impl Serialize> {
    let limit = params.limit.unwrap_or(50);
    json_ok(state.engine.pending_reviews(&principal, limit).await?)
}

async fn review_submission(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(submission_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ReviewBody>,
) -> ApiResult<impl Serialize> {
    let req = ReviewMission {
        submission_id,
        decision: body.decision,
        comment: body.comment,
        idempotency_key: idempotency_key(&headers)?,
    };
    json_ok(state.engine.review_mission(&principal, &req).await?)
}

/// POST /api/v1/shops: admin only.
async fn register_shop(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Json(body): Json<NewShop>,
) -> ApiResult<impl Serialize> {
    json_ok(state.engine.register_shop(&principal, &body).await?)
}

async fn grant_stamp(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(shop_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<StampBody>,
) -> ApiResult<impl Serialize> {
    let req = GrantStamp {
        shop_id,
        latitude: body.latitude,
        longitude: body.longitude,
        idempotency_key: idempotency_key(&headers)?,
    };
    json_ok(state.engine.grant_stamp(&principal, &req).await?)
}

async fn vote_verification(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    headers: HeaderMap,
    Json(body): Json<VoteBody>,
) -> ApiResult<impl Serialize> {
    let req = CastVote {
        target_id: body.target_id,
        idempotency_key: idempotency_key(&headers)?,
    };
    json_ok(state.engine.vote_verification(&principal, &req).await?)
}

async fn request_payout(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    headers: HeaderMap,
    Json(body): Json<PayoutBody>,
) -> ApiResult<impl Serialize> {
    let req = RequestPayout {
        amount: body.amount,
        pin: body.pin,
        idempotency_key: idempotency_key(&headers)?,
    };
    json_ok(state.engine.request_payout(&principal, &req).await?)
}

/// POST /api/v1/payouts/:id/approve: admin only; approving twice is a no-op.
async fn approve_payout(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(request_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<impl Serialize> {
    let req = ApprovePayout {
        request_id,
        idempotency_key: idempotency_key(&headers)?,
    };
    json_ok(state.engine.approve_payout(&principal, &req).await?)
}

async fn reject_payout(
    State(state): State<SharedState>,
    Caller(principal): Caller,
    Path(request_id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> ApiResult<impl Serialize> {
    let req = RejectPayout {
        request_id,
        reason: body.reason,
    };
    json_ok(state.engine.reject_payout(&principal, &req).await?)
}
