use apsis::entities;
use apsis::storage::{Device, RotationState};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

/// Builder for inserting devices in arbitrary rotation states
pub struct DeviceBuilder {
    key: String,
    name: Option<String>,
    state: RotationState,
    secret: String,
    cached_secret: Option<String>,
    secret_created_at: i64,
    last_rotation_attempt_at: Option<i64>,
}

impl DeviceBuilder {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            name: None,
            state: RotationState::Ok,
            secret: "seed-secret".to_string(),
            cached_secret: None,
            secret_created_at: Utc::now().timestamp(),
            last_rotation_attempt_at: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn state(mut self, state: RotationState) -> Self {
        self.state = state;
        self
    }

    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = secret.to_string();
        self
    }

    pub fn cached_secret(mut self, cached: &str) -> Self {
        self.cached_secret = Some(cached.to_string());
        self
    }

    pub fn secret_created_at(mut self, at: i64) -> Self {
        self.secret_created_at = at;
        self
    }

    pub fn last_rotation_attempt_at(mut self, at: i64) -> Self {
        self.last_rotation_attempt_at = Some(at);
        self
    }

    pub async fn insert(self, db: &DatabaseConnection) -> Device {
        let now = Utc::now().timestamp();

        let model = entities::device::ActiveModel {
            id: Set(format!("id-{}", self.key)),
            key: Set(self.key),
            name: Set(self.name),
            rotation_state: Set(self.state.as_str().to_string()),
            secret: Set(self.secret),
            cached_secret: Set(self.cached_secret),
            secret_created_at: Set(self.secret_created_at),
            last_rotation_attempt_at: Set(self.last_rotation_attempt_at),
            last_rotation_completed_at: Set(None),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("Failed to insert test device");

        Device::from_model(model).expect("Failed to convert test device")
    }
}
