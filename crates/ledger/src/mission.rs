//! Mission submission and review state machine.
//!
//! ```text
//! Submitted ──► Approved          (QR token matches)
//!     │
//!     ├──────► Rejected          (QR mismatch, dark photo)
//!     │
//!     └──────► PendingReview ──► Approved | Rejected   (reviewer)
//! ```
//!
//! `Submitted` only exists while a submission is being evaluated; the row is
//! first written in whichever state the evaluation lands on. A reward is
//! written in the same transaction as the status that earns it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hikopo_storage::models::{
    MissionStatus, MissionSubmission, ProofType, ReasonCode, SubmissionReview,
};
use hikopo_storage::{Store, StoreTx};

use crate::context::Context;
use crate::error::{ErrorKind, LedgerError, LedgerResult};
use crate::idempotency::{IdempotencyGuard, IdempotencyKey, Reservation};
use crate::ledger::{EntryDraft, apply_entries};
use crate::photo::{HeuristicVerdict, PhotoHeuristicValidator, PhotoSignal, judge};
use crate::principal::Principal;
use crate::runner::run_bounded;

pub const REASON_INVALID_QR: &str = "invalid_qr";
pub const REASON_HEURISTIC_FAIL: &str = "heuristic_fail";

const MAX_PROOF_LEN: usize = 512;
const MAX_COMMENT_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    Submitted,
    PendingReview,
    Approved,
    Rejected,
}

const VALID_TRANSITIONS: &[(MissionState, MissionState)] = &[
    (MissionState::Submitted, MissionState::Approved),
    (MissionState::Submitted, MissionState::PendingReview),
    (MissionState::Submitted, MissionState::Rejected),
    (MissionState::PendingReview, MissionState::Approved),
    (MissionState::PendingReview, MissionState::Rejected),
];

impl MissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionState::Approved | MissionState::Rejected)
    }

    pub fn transition(self, to: MissionState) -> LedgerResult<MissionState> {
        if VALID_TRANSITIONS.contains(&(self, to)) {
            Ok(to)
        } else {
            Err(LedgerError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Persisted form. `Submitted` never reaches storage.
    fn status(self) -> MissionStatus {
        match self {
            MissionState::Submitted | MissionState::PendingReview => MissionStatus::Pending,
            MissionState::Approved => MissionStatus::Approved,
            MissionState::Rejected => MissionStatus::Rejected,
        }
    }
}

impl From<MissionStatus> for MissionState {
    fn from(status: MissionStatus) -> Self {
        match status {
            MissionStatus::Pending => MissionState::PendingReview,
            MissionStatus::Approved => MissionState::Approved,
            MissionStatus::Rejected => MissionState::Rejected,
        }
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionState::Submitted => "submitted",
            MissionState::PendingReview => "pending_review",
            MissionState::Approved => "approved",
            MissionState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionProof {
    Qr {
        token: String,
    },
    Photo {
        /// Where the uploaded image is stored.
        proof_ref: String,
        #[serde(default, skip_serializing)]
        image: Vec<u8>,
    },
}

impl MissionProof {
    fn proof_type(&self) -> ProofType {
        match self {
            MissionProof::Qr { .. } => ProofType::Qr,
            MissionProof::Photo { .. } => ProofType::Photo,
        }
    }

    fn proof_ref(&self) -> &str {
        match self {
            MissionProof::Qr { token } => token,
            MissionProof::Photo { proof_ref, .. } => proof_ref,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMission {
    pub mission_id: Uuid,
    pub proof: MissionProof,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewMission {
    pub submission_id: Uuid,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub submission: MissionSubmission,
    pub state: MissionState,
    /// Points granted by this call.
    pub reward: i64,
    /// Submitter's balance after the grant, when one happened.
    pub balance: Option<i64>,
    /// Set when the photo heuristic could not answer.
    pub advisory: Option<ErrorKind>,
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Serialize)]
struct SubmitFingerprint<'a> {
    mission_id: Uuid,
    proof_type: ProofType,
    proof_ref: &'a str,
}

pub struct MissionWorkflow<S: Store> {
    ctx: Arc<Context<S>>,
    validator: Arc<dyn PhotoHeuristicValidator>,
}

impl<S: Store> MissionWorkflow<S> {
    pub fn new(ctx: Arc<Context<S>>, validator: Arc<dyn PhotoHeuristicValidator>) -> Self {
        Self { ctx, validator }
    }

    pub async fn submit(
        &self,
        principal: &Principal,
        req: &SubmitMission,
    ) -> LedgerResult<SubmissionOutcome> {
        let proof_ref = req.proof.proof_ref().trim();
        if proof_ref.is_empty() || proof_ref.len() > MAX_PROOF_LEN {
            return Err(LedgerError::InvalidProof(
                "proof must be 1 to 512 characters".into(),
            ));
        }

        let guard = IdempotencyGuard::new(
            "submit_mission",
            principal.account_id,
            req.idempotency_key.as_ref(),
            &SubmitFingerprint {
                mission_id: req.mission_id,
                proof_type: req.proof.proof_type(),
                proof_ref,
            },
        )?;
        let guard = &guard;

        // The external call stays outside the transaction so no row lock is
        // held while waiting on it.
        let verdict = match &req.proof {
            MissionProof::Photo { image, .. } => {
                let mission_id = req.mission_id;
                let settled = run_bounded(&self.ctx.policy, "submit_mission", move || async move {
                    self.settled_submission(principal, mission_id, guard).await
                })
                .await?;
                if let Some(prior) = settled {
                    return Ok(prior);
                }
                Some(
                    judge(
                        self.validator.as_ref(),
                        image,
                        self.ctx.rules.photo_brightness_floor,
                    )
                    .await,
                )
            }
            MissionProof::Qr { .. } => None,
        };

        run_bounded(&self.ctx.policy, "submit_mission", move || async move {
            self.attempt_submit(principal, req, proof_ref, verdict, guard)
                .await
        })
        .await
    }

    /// Read-only look ahead so a repeat photo skips the image analysis.
    /// Returns the stored outcome on a key replay; the tx is never committed.
    async fn settled_submission(
        &self,
        principal: &Principal,
        mission_id: Uuid,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<Option<SubmissionOutcome>> {
        let mut tx = self.ctx.store.begin().await?;
        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<SubmissionOutcome, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(Some(prior));
        }
        if tx
            .find_submission(principal.account_id, mission_id)
            .await?
            .is_some()
        {
            return Err(LedgerError::AlreadyCompleted);
        }
        Ok(None)
    }

    async fn attempt_submit(
        &self,
        principal: &Principal,
        req: &SubmitMission,
        proof_ref: &str,
        verdict: Option<HeuristicVerdict>,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<SubmissionOutcome> {
        let mut tx = self.ctx.store.begin().await?;

        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<SubmissionOutcome, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(prior);
        }

        let user_id = principal.account_id;
        let user = tx
            .lock_accounts(&[user_id])
            .await?
            .into_iter()
            .next()
            .ok_or(LedgerError::AccountNotFound(user_id))?;
        if !user.active {
            return Err(LedgerError::AccountInactive(user_id));
        }

        let mission = tx
            .get_mission(req.mission_id)
            .await?
            .filter(|m| m.active)
            .ok_or(LedgerError::MissionNotFound(req.mission_id))?;

        if tx.find_submission(user_id, mission.id).await?.is_some() {
            return Err(LedgerError::AlreadyCompleted);
        }

        let mut advisory = None;
        let mut signal: Option<PhotoSignal> = None;
        let (target, reason) = match (&req.proof, verdict) {
            (MissionProof::Qr { .. }, _) => {
                if mission.qr_token.as_deref() == Some(proof_ref) {
                    (MissionState::Approved, None)
                } else {
                    (MissionState::Rejected, Some(REASON_INVALID_QR))
                }
            }
            (MissionProof::Photo { .. }, Some(HeuristicVerdict::Fail(s))) => {
                signal = Some(s);
                (MissionState::Rejected, Some(REASON_HEURISTIC_FAIL))
            }
            (MissionProof::Photo { .. }, Some(HeuristicVerdict::Pass(s))) => {
                signal = Some(s);
                (MissionState::PendingReview, None)
            }
            (MissionProof::Photo { .. }, _) => {
                advisory = Some(ErrorKind::ExternalValidationInconclusive);
                (MissionState::PendingReview, None)
            }
        };
        let state = MissionState::Submitted.transition(target)?;

        let now = self.ctx.now();
        let submission = MissionSubmission {
            id: Uuid::new_v4(),
            user_id,
            mission_id: mission.id,
            proof_type: req.proof.proof_type(),
            proof_ref: proof_ref.to_string(),
            status: state.status(),
            reviewer_comment: reason.map(str::to_string),
            reviewer_id: None,
            heuristic_brightness: signal.map(|s| s.brightness),
            heuristic_variance: signal.map(|s| s.variance),
            created_at: now,
            reviewed_at: None,
        };
        tx.insert_submission(&submission).await?;

        let (reward, balance) = if state == MissionState::Approved && mission.reward_points > 0 {
            let balances = apply_entries(
                &mut tx,
                &[EntryDraft::credit(
                    user_id,
                    mission.reward_points,
                    ReasonCode::MissionReward,
                )],
                submission.id,
                guard.key(),
                now,
            )
            .await?;
            (mission.reward_points, Some(balances[&user_id]))
        } else {
            (0, None)
        };

        let outcome = SubmissionOutcome {
            submission,
            state,
            reward,
            balance,
            advisory,
            replayed: false,
        };
        guard.record(&mut tx, &outcome).await?;
        tx.commit().await?;

        tracing::info!(
            user = %user_id,
            mission = %mission.id,
            submission = %outcome.submission.id,
            state = %state,
            reward,
            "Mission submitted"
        );
        Ok(outcome)
    }

    /// Reviewer decision on a submission waiting in `PendingReview`.
    pub async fn review(
        &self,
        principal: &Principal,
        req: &ReviewMission,
    ) -> LedgerResult<SubmissionOutcome> {
        principal.require_reviewer()?;
        let comment = req
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if comment.is_some_and(|c| c.len() > MAX_COMMENT_LEN) {
            return Err(LedgerError::InvalidInput(
                "review comment is too long".into(),
            ));
        }

        let guard = IdempotencyGuard::new(
            "review_mission",
            principal.account_id,
            req.idempotency_key.as_ref(),
            &(req.submission_id, req.decision, comment),
        )?;
        let guard = &guard;

        run_bounded(&self.ctx.policy, "review_mission", move || async move {
            self.attempt_review(principal, req, comment, guard).await
        })
        .await
    }

    async fn attempt_review(
        &self,
        principal: &Principal,
        req: &ReviewMission,
        comment: Option<&str>,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<SubmissionOutcome> {
        let mut tx = self.ctx.store.begin().await?;

        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<SubmissionOutcome, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(prior);
        }

        let mut submission = tx
            .lock_submission(req.submission_id)
            .await?
            .ok_or(LedgerError::SubmissionNotFound(req.submission_id))?;
        if submission.user_id == principal.account_id {
            return Err(LedgerError::NotAuthorized(
                "cannot review your own submission".into(),
            ));
        }

        let current = MissionState::from(submission.status);
        if current.is_terminal() {
            return Err(LedgerError::AlreadyProcessed(submission.id));
        }
        let target = match req.decision {
            ReviewDecision::Approve => MissionState::Approved,
            ReviewDecision::Reject => MissionState::Rejected,
        };
        let state = current.transition(target)?;

        let now = self.ctx.now();
        let (reward, balance) = if state == MissionState::Approved {
            let mission = tx
                .get_mission(submission.mission_id)
                .await?
                .ok_or(LedgerError::MissionNotFound(submission.mission_id))?;
            if mission.reward_points > 0 {
                let balances = apply_entries(
                    &mut tx,
                    &[EntryDraft::credit(
                        submission.user_id,
                        mission.reward_points,
                        ReasonCode::MissionReward,
                    )],
                    submission.id,
                    guard.key(),
                    now,
                )
                .await?;
                (mission.reward_points, Some(balances[&submission.user_id]))
            } else {
                (0, None)
            }
        } else {
            (0, None)
        };

        let review = SubmissionReview {
            status: state.status(),
            reviewer_id: principal.account_id,
            reviewer_comment: comment.map(str::to_string),
            reviewed_at: now,
        };
        tx.review_submission(submission.id, &review).await?;
        submission.status = review.status;
        submission.reviewer_id = Some(review.reviewer_id);
        submission.reviewer_comment = review.reviewer_comment;
        submission.reviewed_at = Some(now);

        let outcome = SubmissionOutcome {
            submission,
            state,
            reward,
            balance,
            advisory: None,
            replayed: false,
        };
        guard.record(&mut tx, &outcome).await?;
        tx.commit().await?;

        tracing::info!(
            reviewer = %principal.account_id,
            submission = %outcome.submission.id,
            state = %state,
            reward,
            "Mission reviewed"
        );
        Ok(outcome)
    }

    /// Oldest submissions waiting for a reviewer.
    pub async fn pending_reviews(
        &self,
        principal: &Principal,
        limit: i64,
    ) -> LedgerResult<Vec<MissionSubmission>> {
        principal.require_reviewer()?;
        let limit = limit.clamp(1, 200);
        run_bounded(&self.ctx.policy, "pending_reviews", move || async move {
            let mut tx = self.ctx.store.begin().await?;
            Ok(tx.pending_submissions(limit).await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::{FixedSignalValidator, HeuristicError, UnavailableValidator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::testing::{deactivate, open, test_context};
    use chrono::Utc;
    use hikopo_storage::models::Mission;
    use hikopo_storage::{FailPoint, MemoryStore};

    async fn seed_mission(ctx: &Context<MemoryStore>, reward: i64) -> Uuid {
        let mission = Mission {
            id: Uuid::new_v4(),
            title: "Visit the castle".into(),
            reward_points: reward,
            qr_token: Some("CASTLE-2024".into()),
            active: true,
            created_at: Utc::now(),
        };
        let mut tx = ctx.store.begin().await.unwrap();
        tx.insert_mission(&mission).await.unwrap();
        tx.commit().await.unwrap();
        mission.id
    }

    fn bright() -> Arc<dyn PhotoHeuristicValidator> {
        Arc::new(FixedSignalValidator(PhotoSignal {
            brightness: 120.0,
            variance: 55.0,
        }))
    }

    fn dark() -> Arc<dyn PhotoHeuristicValidator> {
        Arc::new(FixedSignalValidator(PhotoSignal {
            brightness: 2.0,
            variance: 0.5,
        }))
    }

    #[derive(Default)]
    struct CountingValidator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PhotoHeuristicValidator for CountingValidator {
        async fn analyze(&self, _image: &[u8]) -> Result<PhotoSignal, HeuristicError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PhotoSignal {
                brightness: 120.0,
                variance: 55.0,
            })
        }
    }

    fn qr(mission_id: Uuid, token: &str) -> SubmitMission {
        SubmitMission {
            mission_id,
            proof: MissionProof::Qr {
                token: token.into(),
            },
            idempotency_key: None,
        }
    }

    fn photo(mission_id: Uuid) -> SubmitMission {
        SubmitMission {
            mission_id,
            proof: MissionProof::Photo {
                proof_ref: "uploads/abc.jpg".into(),
                image: vec![0xff, 0xd8],
            },
            idempotency_key: None,
        }
    }

    fn review(submission_id: Uuid, decision: ReviewDecision) -> ReviewMission {
        ReviewMission {
            submission_id,
            decision,
            comment: Some("looks right".into()),
            idempotency_key: None,
        }
    }

    #[test]
    fn test_transition_table() {
        use MissionState::*;
        assert!(Submitted.transition(Approved).is_ok());
        assert!(Submitted.transition(PendingReview).is_ok());
        assert!(PendingReview.transition(Rejected).is_ok());
        assert!(Approved.transition(Rejected).is_err());
        assert!(Rejected.transition(PendingReview).is_err());
        assert!(PendingReview.transition(Submitted).is_err());
    }

    #[tokio::test]
    async fn test_matching_qr_grants_reward() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let mission = seed_mission(&ctx, 80).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());

        let outcome = workflow
            .submit(&Principal::member(user), &qr(mission, "CASTLE-2024"))
            .await
            .unwrap();

        assert_eq!(outcome.state, MissionState::Approved);
        assert_eq!(outcome.balance, Some(80));
        let entries = ctx.store.entries_for(user).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason_code, ReasonCode::MissionReward);
        assert_eq!(entries[0].correlation_id, outcome.submission.id);
    }

    #[tokio::test]
    async fn test_wrong_qr_is_recorded_as_rejected() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let mission = seed_mission(&ctx, 80).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());

        let outcome = workflow
            .submit(&Principal::member(user), &qr(mission, "FORGED"))
            .await
            .unwrap();

        assert_eq!(outcome.state, MissionState::Rejected);
        assert_eq!(
            outcome.submission.reviewer_comment.as_deref(),
            Some(REASON_INVALID_QR)
        );
        assert_eq!(ctx.store.account(user).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_photo_paths() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let principal = Principal::member(user);

        let m1 = seed_mission(&ctx, 50).await;
        let rejected = MissionWorkflow::new(ctx.clone(), dark())
            .submit(&principal, &photo(m1))
            .await
            .unwrap();
        assert_eq!(rejected.state, MissionState::Rejected);
        assert_eq!(
            rejected.submission.reviewer_comment.as_deref(),
            Some(REASON_HEURISTIC_FAIL)
        );
        assert_eq!(rejected.submission.heuristic_brightness, Some(2.0));

        let m2 = seed_mission(&ctx, 50).await;
        let pending = MissionWorkflow::new(ctx.clone(), bright())
            .submit(&principal, &photo(m2))
            .await
            .unwrap();
        assert_eq!(pending.state, MissionState::PendingReview);
        assert_eq!(pending.advisory, None);

        let m3 = seed_mission(&ctx, 50).await;
        let inconclusive = MissionWorkflow::new(ctx.clone(), Arc::new(UnavailableValidator))
            .submit(&principal, &photo(m3))
            .await
            .unwrap();
        assert_eq!(inconclusive.state, MissionState::PendingReview);
        assert_eq!(
            inconclusive.advisory,
            Some(ErrorKind::ExternalValidationInconclusive)
        );
        assert_eq!(inconclusive.submission.heuristic_brightness, None);

        assert_eq!(ctx.store.account(user).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_duplicate_submission_keeps_first_outcome() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let mission = seed_mission(&ctx, 80).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());
        let principal = Principal::member(user);

        let first = workflow
            .submit(&principal, &qr(mission, "CASTLE-2024"))
            .await
            .unwrap();
        let err = workflow
            .submit(&principal, &qr(mission, "CASTLE-2024"))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::AlreadyCompleted));
        let stored = ctx.store.submission(first.submission.id).await.unwrap();
        assert_eq!(stored.status, MissionStatus::Approved);
        assert_eq!(ctx.store.account(user).await.unwrap().balance, 80);
    }

    #[tokio::test]
    async fn test_reviewer_approval_grants_once() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let reviewer = open(&ctx, "REVIEWER1").await;
        let mission = seed_mission(&ctx, 70).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());

        let pending = workflow
            .submit(&Principal::member(user), &photo(mission))
            .await
            .unwrap();
        let queue = workflow
            .pending_reviews(&Principal::reviewer(reviewer), 10)
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);

        let approved = workflow
            .review(
                &Principal::reviewer(reviewer),
                &review(pending.submission.id, ReviewDecision::Approve),
            )
            .await
            .unwrap();
        assert_eq!(approved.state, MissionState::Approved);
        assert_eq!(approved.balance, Some(70));
        assert_eq!(approved.submission.reviewer_id, Some(reviewer));

        let again = workflow
            .review(
                &Principal::reviewer(reviewer),
                &review(pending.submission.id, ReviewDecision::Reject),
            )
            .await
            .unwrap_err();
        assert!(matches!(again, LedgerError::AlreadyProcessed(_)));
        assert_eq!(ctx.store.account(user).await.unwrap().balance, 70);
    }

    #[tokio::test]
    async fn test_review_requires_role_and_other_reviewer() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let mission = seed_mission(&ctx, 70).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());
        let pending = workflow
            .submit(&Principal::member(user), &photo(mission))
            .await
            .unwrap();
        let req = review(pending.submission.id, ReviewDecision::Approve);

        let err = workflow.review(&Principal::member(user), &req).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotAuthorized(_)));
        let err = workflow.review(&Principal::reviewer(user), &req).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_failed_status_write_discards_reward() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let reviewer = open(&ctx, "REVIEWER1").await;
        let mission = seed_mission(&ctx, 70).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());
        let pending = workflow
            .submit(&Principal::member(user), &photo(mission))
            .await
            .unwrap();

        ctx.store.fail_at(FailPoint::ReviewSubmission);
        let result = workflow
            .review(
                &Principal::reviewer(reviewer),
                &review(pending.submission.id, ReviewDecision::Approve),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(ctx.store.account(user).await.unwrap().balance, 0);
        assert!(ctx.store.entries_for(user).await.is_empty());
        let stored = ctx.store.submission(pending.submission.id).await.unwrap();
        assert_eq!(stored.status, MissionStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejection_pays_nothing() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let admin = open(&ctx, "ADMIN0001").await;
        let mission = seed_mission(&ctx, 70).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());
        let pending = workflow
            .submit(&Principal::member(user), &photo(mission))
            .await
            .unwrap();

        let rejected = workflow
            .review(
                &Principal::admin(admin),
                &review(pending.submission.id, ReviewDecision::Reject),
            )
            .await
            .unwrap();
        assert_eq!(rejected.state, MissionState::Rejected);
        assert_eq!(rejected.reward, 0);
        assert!(ctx.store.entries_for(user).await.is_empty());
    }

    #[tokio::test]
    async fn test_deactivated_user_is_not_paid_on_approval() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let reviewer = open(&ctx, "REVIEWER1").await;
        let mission = seed_mission(&ctx, 70).await;
        let workflow = MissionWorkflow::new(ctx.clone(), bright());
        let pending = workflow
            .submit(&Principal::member(user), &photo(mission))
            .await
            .unwrap();
        deactivate(&ctx, user).await;

        let err = workflow
            .review(
                &Principal::reviewer(reviewer),
                &review(pending.submission.id, ReviewDecision::Approve),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::AccountInactive(id) if id == user));
        assert_eq!(ctx.store.account(user).await.unwrap().balance, 0);
        assert!(ctx.store.entries_for(user).await.is_empty());
        let stored = ctx.store.submission(pending.submission.id).await.unwrap();
        assert_eq!(stored.status, MissionStatus::Pending);
    }

    #[tokio::test]
    async fn test_repeat_photo_skips_image_analysis() {
        let ctx = test_context(MemoryStore::new());
        let user = open(&ctx, "MEMBER001").await;
        let mission = seed_mission(&ctx, 70).await;
        let validator = Arc::new(CountingValidator::default());
        let workflow = MissionWorkflow::new(ctx.clone(), validator.clone());
        let principal = Principal::member(user);
        let mut keyed = photo(mission);
        keyed.idempotency_key = Some(IdempotencyKey::new("photo-1").unwrap());

        let first = workflow.submit(&principal, &keyed).await.unwrap();
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);

        let replay = workflow.submit(&principal, &keyed).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.submission.id, first.submission.id);

        let err = workflow.submit(&principal, &photo(mission)).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyCompleted));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }
}
