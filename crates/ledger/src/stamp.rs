//! Proof-of-visit stamps behind a geofence and a rolling window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hikopo_storage::models::StampGrant;
use hikopo_storage::{Store, StoreTx};

use crate::context::Context;
use crate::error::{LedgerError, LedgerResult};
use crate::geo::{haversine_meters, valid_coordinates};
use crate::idempotency::{IdempotencyGuard, IdempotencyKey, Reservation};
use crate::principal::Principal;
use crate::runner::run_bounded;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantStamp {
    pub shop_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampReceipt {
    pub stamp: StampGrant,
    pub distance_meters: f64,
    /// Stamps this user now holds at this shop.
    pub total_stamps: i64,
    pub next_eligible_at: DateTime<Utc>,
    #[serde(default)]
    pub replayed: bool,
}

pub struct StampGrantService<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> StampGrantService<S> {
    pub fn new(ctx: Arc<Context<S>>) -> Self {
        Self { ctx }
    }

    pub async fn grant(&self, principal: &Principal, req: &GrantStamp) -> LedgerResult<StampReceipt> {
        if !valid_coordinates(req.latitude, req.longitude) {
            return Err(LedgerError::InvalidCoordinates {
                latitude: req.latitude,
                longitude: req.longitude,
            });
        }

        let guard = IdempotencyGuard::new(
            "grant_stamp",
            principal.account_id,
            req.idempotency_key.as_ref(),
            &(req.shop_id, req.latitude, req.longitude),
        )?;
        let guard = &guard;

        run_bounded(&self.ctx.policy, "grant_stamp", move || async move {
            self.attempt(principal, req, guard).await
        })
        .await
    }

    async fn attempt(
        &self,
        principal: &Principal,
        req: &GrantStamp,
        guard: &IdempotencyGuard,
    ) -> LedgerResult<StampReceipt> {
        let mut tx = self.ctx.store.begin().await?;

        if let Reservation::Replay(mut prior) =
            guard.check_and_reserve::<StampReceipt, _>(&mut tx).await?
        {
            prior.replayed = true;
            return Ok(prior);
        }

        // The user row lock serializes concurrent grants for the same user,
        // which closes the window between the rate-limit read and the insert.
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

        let shop = tx
            .get_shop(req.shop_id)
            .await?
            .ok_or(LedgerError::ShopNotFound(req.shop_id))?;

        let distance_meters =
            haversine_meters(shop.latitude, shop.longitude, req.latitude, req.longitude);
        let rules = &self.ctx.rules;
        if distance_meters > rules.stamp_radius_meters {
            tracing::debug!(user = %user_id, shop = %shop.id, distance_meters, "Stamp outside geofence");
            return Err(LedgerError::TooFar { distance_meters });
        }

        let now = self.ctx.now();
        let window = Duration::hours(rules.stamp_window_hours);
        if let Some(last) = tx.latest_stamp(user_id, shop.id).await? {
            let next_eligible_at = last.granted_at + window;
            if now < next_eligible_at {
                return Err(LedgerError::RateLimited { next_eligible_at });
            }
        }

        let stamp = StampGrant {
            id: Uuid::new_v4(),
            user_id,
            shop_id: shop.id,
            granted_at: now,
        };
        tx.insert_stamp(&stamp).await?;
        let total_stamps = tx.count_stamps(user_id, shop.id).await?;

        let receipt = StampReceipt {
            stamp,
            distance_meters,
            total_stamps,
            next_eligible_at: now + window,
            replayed: false,
        };
        guard.record(&mut tx, &receipt).await?;
        tx.commit().await?;

        tracing::info!(
            user = %user_id,
            shop = %shop.id,
            distance_meters,
            total_stamps,
            "Stamp granted"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo::EARTH_RADIUS_METERS;
    use crate::testing::{open, test_context_with_clock};
    use hikopo_storage::MemoryStore;
    use hikopo_storage::models::Shop;

    const LAT: f64 = 35.2763;
    const LON: f64 = 136.2519;

    fn north(meters: f64) -> f64 {
        LAT + (meters / EARTH_RADIUS_METERS).to_degrees()
    }

    async fn seed_shop(ctx: &Context<MemoryStore>, owner: Uuid) -> Uuid {
        let shop = Shop {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Castle Road Cafe".into(),
            latitude: LAT,
            longitude: LON,
        };
        let mut tx = ctx.store.begin().await.unwrap();
        tx.insert_shop(&shop).await.unwrap();
        tx.commit().await.unwrap();
        shop.id
    }

    fn at(shop_id: Uuid, latitude: f64) -> GrantStamp {
        GrantStamp {
            shop_id,
            latitude,
            longitude: LON,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_geofence_boundary() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = test_context_with_clock(MemoryStore::new(), clock);
        let user = open(&ctx, "MEMBER001").await;
        let shop = seed_shop(&ctx, user).await;
        let service = StampGrantService::new(ctx.clone());
        let principal = Principal::member(user);

        let err = service.grant(&principal, &at(shop, north(51.0))).await.unwrap_err();
        assert!(matches!(err, LedgerError::TooFar { distance_meters } if distance_meters > 50.0));

        let receipt = service.grant(&principal, &at(shop, north(49.0))).await.unwrap();
        assert!(receipt.distance_meters < 50.0);
        assert_eq!(receipt.total_stamps, 1);
    }

    #[tokio::test]
    async fn test_window_is_rolling() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = test_context_with_clock(MemoryStore::new(), clock.clone());
        let user = open(&ctx, "MEMBER001").await;
        let shop = seed_shop(&ctx, user).await;
        let service = StampGrantService::new(ctx.clone());
        let principal = Principal::member(user);

        let first = service.grant(&principal, &at(shop, LAT)).await.unwrap();

        clock.advance(Duration::hours(23));
        let err = service.grant(&principal, &at(shop, LAT)).await.unwrap_err();
        assert!(
            matches!(err, LedgerError::RateLimited { next_eligible_at } if next_eligible_at == first.next_eligible_at)
        );

        clock.advance(Duration::hours(1));
        let second = service.grant(&principal, &at(shop, LAT)).await.unwrap();
        assert_eq!(second.total_stamps, 2);
        assert_eq!(ctx.store.stamp_count().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_shop_and_bad_coordinates() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = test_context_with_clock(MemoryStore::new(), clock);
        let user = open(&ctx, "MEMBER001").await;
        let service = StampGrantService::new(ctx.clone());
        let principal = Principal::member(user);

        let err = service
            .grant(&principal, &at(Uuid::new_v4(), LAT))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ShopNotFound(_)));

        let err = service.grant(&principal, &at(Uuid::new_v4(), 91.0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCoordinates { .. }));
    }

    #[tokio::test]
    async fn test_same_key_replays_grant() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = test_context_with_clock(MemoryStore::new(), clock);
        let user = open(&ctx, "MEMBER001").await;
        let shop = seed_shop(&ctx, user).await;
        let service = StampGrantService::new(ctx.clone());
        let principal = Principal::member(user);
        let mut req = at(shop, LAT);
        req.idempotency_key = Some(IdempotencyKey::new("visit-1").unwrap());

        let first = service.grant(&principal, &req).await.unwrap();
        let second = service.grant(&principal, &req).await.unwrap();

        assert!(second.replayed);
        assert_eq!(first.stamp.id, second.stamp.id);
        assert_eq!(ctx.store.stamp_count().await, 1);
    }
}
