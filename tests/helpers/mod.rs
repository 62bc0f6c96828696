pub mod builders;
pub mod db;
pub mod mock_provider;

pub use builders::DeviceBuilder;
pub use db::TestDb;
pub use mock_provider::MockProvider;

use apsis::notify::NoopNotifier;
use apsis::rotation::RotationEngine;
use apsis::secret_cache::PlainCodec;
use apsis::settings;
use apsis::storage::{self, RotationState};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub fn test_rotation_settings() -> settings::Rotation {
    settings::Rotation {
        interval_secs: 3600,
        timeout_secs: 60,
        completion_skew_secs: 5,
        tick_schedule: "0 * * * * *".to_string(),
        reconcile_schedule: "0 */15 * * * *".to_string(),
        secret_passphrase: None,
    }
}

/// Engine over a plain codec and a silent notifier
pub fn make_engine(db: &DatabaseConnection, provider: Arc<MockProvider>) -> RotationEngine {
    RotationEngine::new(
        db.clone(),
        provider,
        Arc::new(PlainCodec),
        Arc::new(NoopNotifier),
        test_rotation_settings(),
    )
}

/// Assert the fleet-wide invariant: a cached secret exists exactly while a
/// restore might be needed (pending or timeout), and never otherwise.
pub async fn assert_cached_secret_invariant(db: &DatabaseConnection) {
    let devices = storage::list_devices(db).await.expect("list_devices failed");
    for device in devices {
        let restorable = matches!(
            device.rotation_state,
            RotationState::Pending | RotationState::Timeout
        );
        assert_eq!(
            device.cached_secret.is_some(),
            restorable,
            "cached_secret invariant violated for device {} in state {}",
            device.key,
            device.rotation_state.as_str()
        );
    }
}
