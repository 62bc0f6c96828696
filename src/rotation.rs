//! The credential rotation engine.
//!
//! One device at a time, fleet-wide: the coordinator claims the next
//! eligible device under a row lock, rotates its secret at the identity
//! provider, and leaves it `pending` until the device proves receipt by
//! checking in with a token issued under the new secret. Timed-out attempts
//! are rolled back externally before they are marked `timeout`.

use crate::credential_provider::{client_id_for, CredentialProvider};
use crate::errors::ApsisError;
use crate::notify::NotificationSink;
use crate::secret_cache::SecretCodec;
use crate::settings;
use crate::storage::{self, Device, RotationState};
use chrono::Utc;
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::sync::Arc;

#[derive(Clone)]
pub struct RotationEngine {
    db: DatabaseConnection,
    provider: Arc<dyn CredentialProvider>,
    codec: Arc<dyn SecretCodec>,
    notifier: Arc<dyn NotificationSink>,
    cfg: settings::Rotation,
}

impl RotationEngine {
    pub fn new(
        db: DatabaseConnection,
        provider: Arc<dyn CredentialProvider>,
        codec: Arc<dyn SecretCodec>,
        notifier: Arc<dyn NotificationSink>,
        cfg: settings::Rotation,
    ) -> Self {
        Self {
            db,
            provider,
            codec,
            notifier,
            cfg,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    // Device lifecycle

    /// Register a device and create its external client. Returns the initial
    /// secret; this is the only time it leaves the engine in plaintext.
    pub async fn register_device(
        &self,
        key: &str,
        name: Option<String>,
    ) -> Result<(Device, String), ApsisError> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ApsisError::BadRequest(
                "device key must be non-empty and contain only [a-zA-Z0-9_-]".to_string(),
            ));
        }
        if storage::get_device_by_key(&self.db, key).await?.is_some() {
            return Err(ApsisError::BadRequest(format!(
                "device already registered: {}",
                key
            )));
        }

        let client_id = client_id_for(key);
        let secret = self.provider.create_or_get_client(&client_id).await?;
        let secret_enc = self.codec.encrypt_secret(&secret)?;
        let device = storage::create_device(&self.db, key, name, &secret_enc).await?;

        tracing::info!(device = %key, "Registered device");
        Ok((device, secret))
    }

    /// Delete a device row; external client deletion is best-effort.
    pub async fn remove_device(&self, key: &str) -> Result<bool, ApsisError> {
        let deleted = storage::delete_device(&self.db, key).await?;
        if deleted {
            if let Err(e) = self.provider.delete_client(&client_id_for(key)).await {
                tracing::warn!(device = %key, "External client deletion failed: {}", e);
            }
            tracing::info!(device = %key, "Deleted device");
            self.nudge_dashboard();
        }
        Ok(deleted)
    }

    // Scheduler

    /// Queue every `ok` device for rotation. One code path for both stimuli:
    /// the periodic trigger and the manual administrative trigger.
    pub async fn trigger_fleet_rotation(&self) -> Result<u64, ApsisError> {
        let queued = storage::queue_fleet(&self.db).await?;
        if queued > 0 {
            tracing::info!(queued, "Queued fleet for credential rotation");
            self.nudge_dashboard();
        }
        Ok(queued)
    }

    // Coordinator

    /// Claim and rotate at most one device. Returns `None` when a rotation
    /// is already in flight, when nothing is eligible, or when a concurrent
    /// claim won the row.
    pub async fn rotate_next_eligible_device(&self) -> Result<Option<Device>, ApsisError> {
        let txn = self.db.begin().await?;

        // Single-flight: never start new work while any rotation is in flight.
        if storage::count_pending(&txn).await? > 0 {
            txn.commit().await?;
            return Ok(None);
        }

        let Some(model) = storage::claim_next_eligible(&txn).await? else {
            txn.commit().await?;
            return Ok(None);
        };

        let from = RotationState::parse(&model.rotation_state)?;
        let device_id = model.id.clone();
        let device_key = model.key.clone();
        let client_id = client_id_for(&device_key);

        // Capture the prior secret before the external call; the restore
        // value must be in place before anything can go wrong remotely.
        match storage::stage_cached_secret(&txn, &device_id, from, &model.secret).await {
            Ok(()) => {}
            Err(ApsisError::InvalidStateTransition { .. }) => {
                // A concurrent claim changed the row first. Nothing external
                // has happened yet, so losing here is the same as finding no
                // eligible device.
                txn.rollback().await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let new_secret = match self.provider.regenerate_secret(&client_id).await {
            Ok(secret) => secret,
            Err(e) => {
                // Abort the whole attempt: nothing persisted, lock released,
                // the device stays eligible for the next tick.
                txn.rollback().await?;
                tracing::warn!(device = %device_key, "Secret regeneration failed: {}", e);
                return Err(e);
            }
        };

        let persisted: Result<(), ApsisError> = async {
            let new_enc = self.codec.encrypt_secret(&new_secret)?;
            let now = Utc::now().timestamp();
            storage::mark_pending(&txn, &device_id, from, &new_enc, now).await?;
            txn.commit().await?;
            Ok(())
        }
        .await;

        if let Err(e) = persisted {
            // The provider already holds the new secret but the local record
            // does not. The reconciliation sweep repairs this window.
            tracing::error!(
                device = %device_key,
                "External secret regenerated but local persist failed: {}",
                e
            );
            return Err(e);
        }

        tracing::info!(device = %device_key, "Rotated device secret, awaiting check-in");
        self.notify_device(client_id);
        self.nudge_dashboard();

        storage::get_device_by_key(&self.db, &device_key).await
    }

    // Timeout reaper

    /// Restore and evict devices stuck in `pending` past the configured
    /// deadline. Runs before device selection on every tick.
    pub async fn process_timeouts(&self) -> Result<u64, ApsisError> {
        let now = Utc::now().timestamp();
        let cutoff = now - self.cfg.timeout_secs;
        let stale = storage::list_pending_stale(&self.db, cutoff).await?;

        let mut timed_out = 0u64;
        for device in stale {
            let Some(cached_enc) = device.cached_secret.as_deref() else {
                tracing::error!(
                    device = %device.key,
                    "Pending device has no cached secret to restore"
                );
                continue;
            };

            let cached = self.codec.decrypt_secret(cached_enc)?;
            let client_id = client_id_for(&device.key);

            // Restore first, persist second: a device is never advertised as
            // settled in `timeout` while the provider might still hold the
            // unconfirmed new secret.
            if let Err(e) = self.provider.restore_secret(&client_id, &cached).await {
                tracing::warn!(
                    device = %device.key,
                    "Secret restore failed, device stays pending: {}",
                    e
                );
                continue;
            }

            if storage::mark_timeout(&self.db, &device.id, cached_enc).await? {
                timed_out += 1;
                tracing::info!(
                    device = %device.key,
                    "Rotation timed out, previous secret restored"
                );
            }
        }

        if timed_out > 0 {
            self.nudge_dashboard();
        }
        Ok(timed_out)
    }

    // Completion detector

    /// Check whether an authenticated device request proves rotation
    /// completion. A token issued after the rotation attempt began (plus
    /// skew) can only have been obtained with the new secret.
    pub async fn check_rotation_completion(
        &self,
        key: &str,
        token_issued_at: i64,
    ) -> Result<bool, ApsisError> {
        let Some(device) = storage::get_device_by_key(&self.db, key).await? else {
            return Err(ApsisError::BadRequest(format!("unknown device: {}", key)));
        };

        if device.rotation_state != RotationState::Pending {
            return Ok(false);
        }
        let Some(attempt_at) = device.last_rotation_attempt_at else {
            return Ok(false);
        };

        // The skew widens the rejection window only: under clock drift a
        // token issued with the old secret must never pass as proof.
        if token_issued_at <= attempt_at + self.cfg.completion_skew_secs {
            return Ok(false);
        }

        let now = Utc::now().timestamp();
        if !storage::complete_rotation(&self.db, &device.id, now).await? {
            // The reaper got there first.
            return Ok(false);
        }

        tracing::info!(device = %device.key, "Rotation completed");
        self.nudge_dashboard();

        // Chain rotation: advance the next queued device immediately instead
        // of waiting for the next scheduled tick. Just another caller of the
        // same lock-respecting entry point.
        if storage::has_rotatable_work(&self.db).await? {
            if let Err(e) = self.rotate_next_eligible_device().await {
                tracing::warn!("Chain rotation attempt failed: {}", e);
            }
        }

        Ok(true)
    }

    // Reconciliation sweep

    /// Detect rotations that happened externally but were never recorded
    /// locally (crash between the provider call and the commit). Runs at
    /// startup and on its own schedule, never inline in the claim path.
    pub async fn reconcile_partial_rotations(&self) -> Result<u64, ApsisError> {
        let candidates = storage::list_reconciliation_candidates(&self.db).await?;

        let mut repaired = 0u64;
        for device in candidates {
            let client_id = client_id_for(&device.key);

            let provider_secret = match self.provider.create_or_get_client(&client_id).await {
                Ok(secret) => secret,
                Err(e) => {
                    tracing::warn!(
                        device = %device.key,
                        "Reconciliation skipped, provider unreachable: {}",
                        e
                    );
                    continue;
                }
            };

            let local_secret = self.codec.decrypt_secret(&device.secret)?;
            if provider_secret == local_secret {
                continue;
            }

            if storage::count_pending(&self.db).await? > 0 {
                tracing::error!(
                    device = %device.key,
                    "Provider secret diverged from local record while another \
                     rotation is in flight; operator attention required"
                );
                continue;
            }

            let adopted_enc = self.codec.encrypt_secret(&provider_secret)?;
            let now = Utc::now().timestamp();
            let repaired_row = storage::repair_to_pending(
                &self.db,
                &device.id,
                device.rotation_state,
                &adopted_enc,
                &device.secret,
                now,
            )
            .await?;

            if repaired_row {
                repaired += 1;
                tracing::warn!(
                    device = %device.key,
                    "Repaired unrecorded external rotation; device now pending"
                );
                self.notify_device(client_id);
            }
        }

        if repaired > 0 {
            self.nudge_dashboard();
        }
        Ok(repaired)
    }

    // Tick composition

    /// One scheduler tick: evict timed-out rotations, fire the periodic
    /// fleet trigger when its window is due, then advance at most one
    /// device. Returns the number of state changes.
    pub async fn tick(&self) -> Result<u64, ApsisError> {
        let mut processed = self.process_timeouts().await?;

        let now = Utc::now().timestamp();
        if storage::rotation_due(&self.db, self.cfg.interval_secs, now).await? {
            processed += self.trigger_fleet_rotation().await?;
        }

        match self.rotate_next_eligible_device().await {
            Ok(Some(_)) => processed += 1,
            Ok(None) => {}
            Err(ApsisError::ExternalService(e)) => {
                tracing::warn!("Rotation attempt failed, will retry next tick: {}", e);
            }
            Err(e) => return Err(e),
        }

        Ok(processed)
    }

    // Notifications, always fire-and-forget

    fn notify_device(&self, client_id: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.publish_to_device(&client_id).await;
        });
    }

    fn nudge_dashboard(&self) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.broadcast_dashboard_nudge().await;
        });
    }
}
