use crate::entities;
use crate::errors::ApsisError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::sea_query::{Expr, LockBehavior, LockType, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationState {
    Ok,
    Queued,
    Pending,
    Timeout,
}

impl RotationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationState::Ok => "ok",
            RotationState::Queued => "queued",
            RotationState::Pending => "pending",
            RotationState::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ApsisError> {
        match s {
            "ok" => Ok(RotationState::Ok),
            "queued" => Ok(RotationState::Queued),
            "pending" => Ok(RotationState::Pending),
            "timeout" => Ok(RotationState::Timeout),
            other => Err(ApsisError::Other(format!(
                "unknown rotation state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub key: String,
    pub name: Option<String>,
    pub rotation_state: RotationState,
    pub secret: String,
    pub cached_secret: Option<String>,
    pub secret_created_at: i64,
    pub last_rotation_attempt_at: Option<i64>,
    pub last_rotation_completed_at: Option<i64>,
    pub created_at: i64,
}

impl Device {
    pub fn from_model(model: entities::device::Model) -> Result<Self, ApsisError> {
        Ok(Device {
            rotation_state: RotationState::parse(&model.rotation_state)?,
            id: model.id,
            key: model.key,
            name: model.name,
            secret: model.secret,
            cached_secret: model.cached_secret,
            secret_created_at: model.secret_created_at,
            last_rotation_attempt_at: model.last_rotation_attempt_at,
            last_rotation_completed_at: model.last_rotation_completed_at,
            created_at: model.created_at,
        })
    }
}

/// Reject any state transition that is not one of the enumerated edges.
///
/// Defensive check at the point of mutation: `ok`, `queued`, and `timeout`
/// are all legitimately observed when a tick begins and must not be
/// conflated, so a disallowed edge is a programming-error-class fault.
pub fn assert_transition(
    device: &str,
    from: RotationState,
    to: RotationState,
) -> Result<(), ApsisError> {
    let allowed = matches!(
        (from, to),
        (RotationState::Ok, RotationState::Queued)
            | (RotationState::Queued, RotationState::Pending)
            | (RotationState::Timeout, RotationState::Pending)
            | (RotationState::Pending, RotationState::Timeout)
            | (RotationState::Pending, RotationState::Ok)
    );

    if allowed {
        return Ok(());
    }

    tracing::error!(
        device,
        from = from.as_str(),
        to = to.as_str(),
        "Rejected invalid rotation state transition"
    );
    Err(ApsisError::InvalidStateTransition {
        device: device.to_string(),
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
    })
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, ApsisError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

// Device functions

pub async fn create_device(
    db: &DatabaseConnection,
    key: &str,
    name: Option<String>,
    secret_enc: &str,
) -> Result<Device, ApsisError> {
    let now = Utc::now().timestamp();

    let device = entities::device::ActiveModel {
        id: Set(random_id()),
        key: Set(key.to_string()),
        name: Set(name),
        rotation_state: Set(RotationState::Ok.as_str().to_string()),
        secret: Set(secret_enc.to_string()),
        cached_secret: Set(None),
        secret_created_at: Set(now),
        last_rotation_attempt_at: Set(None),
        last_rotation_completed_at: Set(None),
        created_at: Set(now),
    };

    let model = device.insert(db).await?;
    Device::from_model(model)
}

pub async fn get_device_by_key(
    db: &impl ConnectionTrait,
    key: &str,
) -> Result<Option<Device>, ApsisError> {
    use entities::device::{Column, Entity};

    let model = Entity::find().filter(Column::Key.eq(key)).one(db).await?;
    model.map(Device::from_model).transpose()
}

pub async fn list_devices(db: &DatabaseConnection) -> Result<Vec<Device>, ApsisError> {
    use entities::device::{Column, Entity};

    let models = Entity::find().order_by_asc(Column::Key).all(db).await?;
    models.into_iter().map(Device::from_model).collect()
}

pub async fn update_device_name(
    db: &DatabaseConnection,
    key: &str,
    name: Option<String>,
) -> Result<(), ApsisError> {
    use entities::device::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::Name, Expr::value(name))
        .filter(Column::Key.eq(key))
        .exec(db)
        .await?;

    Ok(())
}

pub async fn delete_device(db: &DatabaseConnection, key: &str) -> Result<bool, ApsisError> {
    use entities::device::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::Key.eq(key))
        .exec(db)
        .await?;

    Ok(result.rows_affected > 0)
}

// Rotation state functions

/// Bulk `ok -> queued`. Devices already queued, pending, or timed out are
/// untouched, which is what makes repeated triggers idempotent.
pub async fn queue_fleet(db: &DatabaseConnection) -> Result<u64, ApsisError> {
    use entities::device::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(
            Column::RotationState,
            Expr::value(RotationState::Queued.as_str()),
        )
        .filter(Column::RotationState.eq(RotationState::Ok.as_str()))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

pub async fn count_pending(db: &impl ConnectionTrait) -> Result<u64, ApsisError> {
    use entities::device::{Column, Entity};

    let count = Entity::find()
        .filter(Column::RotationState.eq(RotationState::Pending.as_str()))
        .count(db)
        .await?;

    Ok(count)
}

pub async fn has_rotatable_work(db: &impl ConnectionTrait) -> Result<bool, ApsisError> {
    use entities::device::{Column, Entity};

    let count = Entity::find()
        .filter(Column::RotationState.is_in([
            RotationState::Queued.as_str(),
            RotationState::Timeout.as_str(),
        ]))
        .count(db)
        .await?;

    Ok(count > 0)
}

/// Select and lock the next eligible device, skipping rows already locked by
/// a concurrent claim. Queued devices rotate oldest-secret-first; timed-out
/// devices are retried (least recently attempted first) only when no queued
/// work remains.
///
/// The skip-locked hint covers backends that support it; every subsequent
/// mutation is additionally guarded by a conditional update on the observed
/// state, so a lost race surfaces as zero affected rows rather than a
/// double-claim.
pub async fn claim_next_eligible(
    txn: &impl ConnectionTrait,
) -> Result<Option<entities::device::Model>, ApsisError> {
    use entities::device::{Column, Entity};

    let queued = Entity::find()
        .filter(Column::RotationState.eq(RotationState::Queued.as_str()))
        .order_by_asc(Column::SecretCreatedAt)
        .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
        .one(txn)
        .await?;

    if queued.is_some() {
        return Ok(queued);
    }

    let timed_out = Entity::find()
        .filter(Column::RotationState.eq(RotationState::Timeout.as_str()))
        .order_by_asc(Column::LastRotationAttemptAt)
        .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
        .one(txn)
        .await?;

    Ok(timed_out)
}

/// Persist the prior secret into `cached_secret`. Written before the
/// provider call so the restore value is part of the same transaction as the
/// pending transition that follows it.
pub async fn stage_cached_secret(
    txn: &impl ConnectionTrait,
    device_id: &str,
    from: RotationState,
    cached_enc: &str,
) -> Result<(), ApsisError> {
    use entities::device::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::CachedSecret, Expr::value(cached_enc))
        .filter(Column::Id.eq(device_id))
        .filter(Column::RotationState.eq(from.as_str()))
        .exec(txn)
        .await?;

    if result.rows_affected != 1 {
        return Err(ApsisError::InvalidStateTransition {
            device: device_id.to_string(),
            from: from.as_str().to_string(),
            to: RotationState::Pending.as_str().to_string(),
        });
    }

    Ok(())
}

/// `queued|timeout -> pending` after a successful external rotation.
pub async fn mark_pending(
    txn: &impl ConnectionTrait,
    device_id: &str,
    from: RotationState,
    new_secret_enc: &str,
    now: i64,
) -> Result<(), ApsisError> {
    use entities::device::{Column, Entity};

    assert_transition(device_id, from, RotationState::Pending)?;

    let result = Entity::update_many()
        .col_expr(
            Column::RotationState,
            Expr::value(RotationState::Pending.as_str()),
        )
        .col_expr(Column::Secret, Expr::value(new_secret_enc))
        .col_expr(Column::SecretCreatedAt, Expr::value(now))
        .col_expr(Column::LastRotationAttemptAt, Expr::value(now))
        .filter(Column::Id.eq(device_id))
        .filter(Column::RotationState.eq(from.as_str()))
        .exec(txn)
        .await?;

    if result.rows_affected != 1 {
        return Err(ApsisError::InvalidStateTransition {
            device: device_id.to_string(),
            from: from.as_str().to_string(),
            to: RotationState::Pending.as_str().to_string(),
        });
    }

    Ok(())
}

/// `pending -> timeout` after the previous secret was restored externally.
///
/// `cached_secret` is retained through this transition: a later retry needs
/// to know what the externally-valid secret currently is, in case the
/// restore itself partially failed and must be repeated.
pub async fn mark_timeout(
    db: &impl ConnectionTrait,
    device_id: &str,
    restored_secret_enc: &str,
) -> Result<bool, ApsisError> {
    use entities::device::{Column, Entity};

    assert_transition(device_id, RotationState::Pending, RotationState::Timeout)?;

    let result = Entity::update_many()
        .col_expr(
            Column::RotationState,
            Expr::value(RotationState::Timeout.as_str()),
        )
        .col_expr(Column::Secret, Expr::value(restored_secret_enc))
        .filter(Column::Id.eq(device_id))
        .filter(Column::RotationState.eq(RotationState::Pending.as_str()))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// `pending -> ok` on confirmed completion. Clears the cached secret: the
/// restore window is over once the device proves it holds the new secret.
pub async fn complete_rotation(
    db: &impl ConnectionTrait,
    device_id: &str,
    now: i64,
) -> Result<bool, ApsisError> {
    use entities::device::{Column, Entity};

    assert_transition(device_id, RotationState::Pending, RotationState::Ok)?;

    let result = Entity::update_many()
        .col_expr(
            Column::RotationState,
            Expr::value(RotationState::Ok.as_str()),
        )
        .col_expr(Column::CachedSecret, Expr::value(Option::<String>::None))
        .col_expr(Column::LastRotationCompletedAt, Expr::value(now))
        .filter(Column::Id.eq(device_id))
        .filter(Column::RotationState.eq(RotationState::Pending.as_str()))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Devices stuck in `pending` whose attempt began before `cutoff`.
pub async fn list_pending_stale(
    db: &DatabaseConnection,
    cutoff: i64,
) -> Result<Vec<Device>, ApsisError> {
    use entities::device::{Column, Entity};

    let models = Entity::find()
        .filter(Column::RotationState.eq(RotationState::Pending.as_str()))
        .filter(Column::LastRotationAttemptAt.lt(cutoff))
        .order_by_asc(Column::LastRotationAttemptAt)
        .all(db)
        .await?;

    models.into_iter().map(Device::from_model).collect()
}

/// Devices whose local state could have diverged from the provider after a
/// crash between the external rotation and the local persist.
pub async fn list_reconciliation_candidates(
    db: &DatabaseConnection,
) -> Result<Vec<Device>, ApsisError> {
    use entities::device::{Column, Entity};

    let models = Entity::find()
        .filter(Column::RotationState.is_in([
            RotationState::Queued.as_str(),
            RotationState::Timeout.as_str(),
        ]))
        .order_by_asc(Column::Key)
        .all(db)
        .await?;

    models.into_iter().map(Device::from_model).collect()
}

/// Re-persist a `pending` transition discovered missing by the
/// reconciliation sweep: adopt the provider's actual secret and cache the
/// stale local one for a possible restore.
pub async fn repair_to_pending(
    db: &impl ConnectionTrait,
    device_id: &str,
    from: RotationState,
    adopted_secret_enc: &str,
    cached_enc: &str,
    now: i64,
) -> Result<bool, ApsisError> {
    use entities::device::{Column, Entity};

    assert_transition(device_id, from, RotationState::Pending)?;

    let result = Entity::update_many()
        .col_expr(
            Column::RotationState,
            Expr::value(RotationState::Pending.as_str()),
        )
        .col_expr(Column::Secret, Expr::value(adopted_secret_enc))
        .col_expr(Column::CachedSecret, Expr::value(cached_enc))
        .col_expr(Column::SecretCreatedAt, Expr::value(now))
        .col_expr(Column::LastRotationAttemptAt, Expr::value(now))
        .filter(Column::Id.eq(device_id))
        .filter(Column::RotationState.eq(from.as_str()))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

// Fleet schedule functions

const FLEET_SCHEDULE_ROW: i32 = 1;

/// Decide whether the periodic fleet trigger is due, and claim the window if
/// so. The decision lives in a single locked row so that concurrent worker
/// processes agree on whether the current window has already fired.
pub async fn rotation_due(
    db: &DatabaseConnection,
    interval_secs: i64,
    now: i64,
) -> Result<bool, ApsisError> {
    use entities::fleet_schedule::{ActiveModel, Column, Entity};

    let txn = db.begin().await?;

    let row = Entity::find()
        .filter(Column::Id.eq(FLEET_SCHEDULE_ROW))
        .lock_exclusive()
        .one(&txn)
        .await?;

    let due = match row {
        None => {
            // First tick ever: start the window now instead of rotating a
            // freshly provisioned fleet. A concurrent worker racing the same
            // insert loses on the primary key; either way the window is not
            // due yet.
            let insert = Entity::insert(ActiveModel {
                id: Set(FLEET_SCHEDULE_ROW),
                last_triggered_at: Set(now),
            })
            .on_conflict(OnConflict::column(Column::Id).do_nothing().to_owned())
            .exec(&txn)
            .await;

            match insert {
                Ok(_) | Err(DbErr::RecordNotInserted) => false,
                Err(e) => return Err(e.into()),
            }
        }
        Some(row) if now - row.last_triggered_at >= interval_secs => {
            Entity::update_many()
                .col_expr(Column::LastTriggeredAt, Expr::value(now))
                .filter(Column::Id.eq(FLEET_SCHEDULE_ROW))
                .filter(Column::LastTriggeredAt.eq(row.last_triggered_at))
                .exec(&txn)
                .await?
                .rows_affected
                == 1
        }
        Some(_) => false,
    };

    txn.commit().await?;
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_state_round_trip() {
        for state in [
            RotationState::Ok,
            RotationState::Queued,
            RotationState::Pending,
            RotationState::Timeout,
        ] {
            assert_eq!(RotationState::parse(state.as_str()).unwrap(), state);
        }
        assert!(RotationState::parse("bogus").is_err());
    }

    #[test]
    fn test_transition_guard_allows_enumerated_edges() {
        let edges = [
            (RotationState::Ok, RotationState::Queued),
            (RotationState::Queued, RotationState::Pending),
            (RotationState::Timeout, RotationState::Pending),
            (RotationState::Pending, RotationState::Timeout),
            (RotationState::Pending, RotationState::Ok),
        ];
        for (from, to) in edges {
            assert!(assert_transition("d1", from, to).is_ok());
        }
    }

    #[test]
    fn test_transition_guard_rejects_everything_else() {
        let states = [
            RotationState::Ok,
            RotationState::Queued,
            RotationState::Pending,
            RotationState::Timeout,
        ];
        let allowed = [
            (RotationState::Ok, RotationState::Queued),
            (RotationState::Queued, RotationState::Pending),
            (RotationState::Timeout, RotationState::Pending),
            (RotationState::Pending, RotationState::Timeout),
            (RotationState::Pending, RotationState::Ok),
        ];

        for from in states {
            for to in states {
                if allowed.contains(&(from, to)) {
                    continue;
                }
                let err = assert_transition("d1", from, to).unwrap_err();
                assert!(matches!(
                    err,
                    ApsisError::InvalidStateTransition { .. }
                ));
            }
        }
    }
}
