//! End-to-end properties of the points core over the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use hikopo_ledger::engine::Engine;
use hikopo_ledger::geo::EARTH_RADIUS_METERS;
use hikopo_ledger::ledger::EntryDraft;
use hikopo_ledger::mission::{MissionProof, SubmitMission};
use hikopo_ledger::payout::{ApprovePayout, RequestPayout};
use hikopo_ledger::photo::UnavailableValidator;
use hikopo_ledger::pin::PinHasher;
use hikopo_ledger::quorum::CastVote;
use hikopo_ledger::registry::{NewMission, NewShop, OpenAccount};
use hikopo_ledger::stamp::GrantStamp;
use hikopo_ledger::transfer::TransferRequest;
use hikopo_ledger::{Context, IdempotencyKey, LedgerError, ManualClock, Principal, TxPolicy};
use hikopo_storage::models::{AccountId, BankDetails, PayoutStatus, ReasonCode};
use hikopo_storage::{FailPoint, MemoryStore};

struct Harness {
    engine: Arc<Engine<MemoryStore>>,
    store: MemoryStore,
    clock: Arc<ManualClock>,
    admin: Principal,
}

impl Harness {
    async fn new() -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = Context::new(Arc::new(store.clone()))
            .with_clock(clock.clone())
            .with_pin_hasher(PinHasher::low_cost())
            .with_policy(TxPolicy {
                deadline: std::time::Duration::from_secs(10),
                max_attempts: 5,
                backoff: std::time::Duration::from_millis(1),
            });
        let engine = Arc::new(Engine::new(ctx, Arc::new(UnavailableValidator)));
        let mut harness = Self {
            engine,
            store,
            clock,
            admin: Principal::admin(Uuid::nil()),
        };
        let admin = harness.open("ADMIN0001", None).await;
        harness.admin = Principal::admin(admin);
        harness
    }

    async fn open(&self, code: &str, affiliation: Option<&str>) -> AccountId {
        let id = Uuid::new_v4();
        self.engine
            .open_account(
                &Principal::member(id),
                &OpenAccount {
                    referral_code: code.into(),
                    affiliation: affiliation.map(str::to_string),
                },
            )
            .await
            .unwrap();
        id
    }

    async fn fund(&self, account: AccountId, amount: i64) {
        self.engine
            .ledger()
            .apply(
                &self.admin,
                &[EntryDraft::credit(account, amount, ReasonCode::MissionReward)],
                Uuid::new_v4(),
            )
            .await
            .unwrap();
    }

    async fn balance(&self, account: AccountId) -> i64 {
        self.store.account(account).await.unwrap().balance
    }
}

fn transfer_req(code: &str, amount: i64, key: &str) -> TransferRequest {
    TransferRequest {
        receiver_code: code.into(),
        amount,
        idempotency_key: IdempotencyKey::new(key).unwrap(),
    }
}

#[tokio::test]
async fn example_transfer_moves_points_in_one_pair() {
    let h = Harness::new().await;
    let sender = h.open("SENDER001", None).await;
    let receiver = h.open("RECEIVER1", None).await;
    h.fund(sender, 1000).await;
    h.fund(receiver, 50).await;

    let receipt = h
        .engine
        .transfer(&Principal::member(sender), &transfer_req("RECEIVER1", 300, "t-1"))
        .await
        .unwrap();

    assert_eq!(h.balance(sender).await, 700);
    assert_eq!(h.balance(receiver).await, 350);
    let pair: Vec<_> = h
        .store
        .all_entries()
        .await
        .into_iter()
        .filter(|e| e.correlation_id == receipt.correlation_id)
        .collect();
    assert_eq!(pair.len(), 2);
}

#[tokio::test]
async fn transfers_conserve_points_and_never_overdraw() {
    let h = Harness::new().await;
    let a = h.open("ACCOUNTA1", None).await;
    let b = h.open("ACCOUNTB1", None).await;
    h.fund(a, 500).await;
    h.fund(b, 500).await;

    let amounts = [120, 999, 1, 480, 75, 600, 33, 1000, 250];
    for (i, amount) in amounts.iter().enumerate() {
        let (from, to_code) = if i % 2 == 0 { (a, "ACCOUNTB1") } else { (b, "ACCOUNTA1") };
        let before = h.balance(a).await + h.balance(b).await;
        let sender_before = h.balance(from).await;

        let result = h
            .engine
            .transfer(
                &Principal::member(from),
                &transfer_req(to_code, *amount, &format!("seq-{i}")),
            )
            .await;

        assert_eq!(h.balance(a).await + h.balance(b).await, before);
        assert!(h.balance(a).await >= 0 && h.balance(b).await >= 0);
        match result {
            Ok(_) => assert!(*amount <= sender_before),
            Err(LedgerError::InsufficientFunds { .. }) => {
                assert!(*amount > sender_before);
                assert_eq!(h.balance(from).await, sender_before);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    for account in [a, b] {
        let report = h
            .engine
            .reconcile(&h.admin, account)
            .await
            .unwrap();
        assert!(report.consistent);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_applies_once_under_concurrency() {
    let h = Harness::new().await;
    let sender = h.open("SENDER001", None).await;
    let receiver = h.open("RECEIVER1", None).await;
    h.fund(sender, 1000).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .transfer(
                    &Principal::member(sender),
                    &transfer_req("RECEIVER1", 100, "double-tap"),
                )
                .await
        }));
    }

    let mut correlation = None;
    let mut fresh = 0;
    for task in tasks {
        let receipt = task.await.unwrap().unwrap();
        if !receipt.replayed {
            fresh += 1;
        }
        assert_eq!(*correlation.get_or_insert(receipt.correlation_id), receipt.correlation_id);
    }

    assert_eq!(fresh, 1);
    assert_eq!(h.balance(sender).await, 900);
    assert_eq!(h.balance(receiver).await, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_succeed_floor_balance_over_amount_times() {
    let h = Harness::new().await;
    let sender = h.open("SENDER001", None).await;
    h.open("RECEIVER1", None).await;
    h.fund(sender, 1000).await;

    let n = 6;
    let amount = 300;
    let mut tasks = Vec::new();
    for i in 0..n {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .transfer(
                    &Principal::member(sender),
                    &transfer_req("RECEIVER1", amount, &format!("race-{i}")),
                )
                .await
        }));
    }

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::InsufficientFunds { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(ok, 1000 / amount);
    assert_eq!(h.balance(sender).await, 1000 - ok * amount);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn referral_redeems_once_regardless_of_order() {
    let h = Harness::new().await;
    h.open("REFERRER1", None).await;
    h.open("REFERRER2", None).await;
    let referee = h.open("NEWUSER01", None).await;

    let tasks: Vec<_> = ["REFERRER1", "REFERRER2"]
        .into_iter()
        .map(|code| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .apply_referral(&Principal::member(referee), code)
                    .await
            })
        })
        .collect();

    let mut ok = 0;
    let mut redeemed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::AlreadyRedeemed) => redeemed += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((ok, redeemed), (1, 1));
    assert_eq!(h.balance(referee).await, 500);
}

#[tokio::test]
async fn geofence_boundary_and_rolling_window() {
    let h = Harness::new().await;
    let owner = h.open("SHOPOWNER1", None).await;
    let user = h.open("VISITOR01", None).await;
    let (lat, lon) = (35.2763, 136.2519);
    let shop = h
        .engine
        .register_shop(
            &h.admin,
            &NewShop {
                owner_id: owner,
                name: "Castle Road Cafe".into(),
                latitude: lat,
                longitude: lon,
            },
        )
        .await
        .unwrap();
    let at = |meters: f64| GrantStamp {
        shop_id: shop.id,
        latitude: lat + (meters / EARTH_RADIUS_METERS).to_degrees(),
        longitude: lon,
        idempotency_key: None,
    };
    let principal = Principal::member(user);

    assert!(matches!(
        h.engine.grant_stamp(&principal, &at(51.0)).await,
        Err(LedgerError::TooFar { .. })
    ));
    h.engine.grant_stamp(&principal, &at(49.0)).await.unwrap();

    h.clock.advance(Duration::hours(12));
    assert!(matches!(
        h.engine.grant_stamp(&principal, &at(10.0)).await,
        Err(LedgerError::RateLimited { .. })
    ));

    h.clock.advance(Duration::hours(12));
    let receipt = h.engine.grant_stamp(&principal, &at(10.0)).await.unwrap();
    assert_eq!(receipt.total_stamps, 2);
}

#[tokio::test]
async fn duplicate_mission_submission_leaves_first_outcome() {
    let h = Harness::new().await;
    let user = h.open("MEMBER001", None).await;
    let mission = h
        .engine
        .create_mission(
            &h.admin,
            &NewMission {
                title: "Ride the castle boat".into(),
                reward_points: 40,
                qr_token: Some("BOAT-77".into()),
            },
        )
        .await
        .unwrap();
    let submit = |token: &str| SubmitMission {
        mission_id: mission.id,
        proof: MissionProof::Qr {
            token: token.into(),
        },
        idempotency_key: None,
    };
    let principal = Principal::member(user);

    let first = h.engine.submit_mission(&principal, &submit("BOAT-77")).await.unwrap();
    let second = h.engine.submit_mission(&principal, &submit("BOAT-77")).await;

    assert!(matches!(second, Err(LedgerError::AlreadyCompleted)));
    assert_eq!(first.reward, 40);
    assert_eq!(h.balance(user).await, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_flips_verified_exactly_once() {
    let h = Harness::new().await;
    let target = h.open("TARGET001", Some("hikone-univ")).await;
    let early = [
        h.open("VALID0001", Some("hikone-univ")).await,
        h.open("VALID0002", Some("hikone-univ")).await,
    ];
    for validator in early {
        h.engine
            .vote_verification(
                &Principal::member(validator),
                &CastVote {
                    target_id: target,
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();
    }
    assert!(!h.store.account(target).await.unwrap().verified);

    let mut late = Vec::new();
    for code in ["VALID0003", "VALID0004", "VALID0005"] {
        late.push(h.open(code, Some("hikone-univ")).await);
    }
    let tasks: Vec<_> = late
        .into_iter()
        .map(|validator| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .vote_verification(
                        &Principal::member(validator),
                        &CastVote {
                            target_id: target,
                            idempotency_key: None,
                        },
                    )
                    .await
            })
        })
        .collect();

    let mut flips = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(receipt) if receipt.newly_verified => flips += 1,
            Ok(receipt) => panic!("vote after quorum accepted: {receipt:?}"),
            Err(LedgerError::NotEligible(_)) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!((flips, refused), (1, 2));
    assert!(h.store.account(target).await.unwrap().verified);
    assert_eq!(h.store.vote_count().await, 3);
}

#[tokio::test]
async fn payout_approval_failure_leaves_balance_untouched() {
    let h = Harness::new().await;
    let owner = h.open("SHOPOWNER1", None).await;
    h.fund(owner, 2000).await;
    let principal = Principal::shop_owner(owner);
    h.engine.set_payout_pin(&principal, "8080").await.unwrap();
    h.engine
        .set_bank_details(
            &principal,
            &BankDetails {
                bank_name: "Shiga Bank".into(),
                branch_name: "Hikone".into(),
                account_type: "ordinary".into(),
                account_number: "1234567".into(),
                account_holder: "Castle Road Cafe".into(),
            },
        )
        .await
        .unwrap();

    let request = h
        .engine
        .request_payout(
            &principal,
            &RequestPayout {
                amount: 1500,
                pin: "8080".into(),
                idempotency_key: None,
            },
        )
        .await
        .unwrap()
        .request;
    let approve = ApprovePayout {
        request_id: request.id,
        idempotency_key: None,
    };

    h.store.fail_at(FailPoint::TransitionPayout);
    assert!(h.engine.approve_payout(&h.admin, &approve).await.is_err());
    assert_eq!(h.balance(owner).await, 2000);
    assert_eq!(h.store.payout(request.id).await.unwrap().status, PayoutStatus::Pending);

    let done = h.engine.approve_payout(&h.admin, &approve).await.unwrap();
    assert_eq!(done.balance, 500);
    assert_eq!(h.balance(owner).await, 500);
    assert!(h.engine.reconcile(&h.admin, owner).await.unwrap().consistent);
}
