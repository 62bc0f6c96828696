use apsis::credential_provider::CredentialProvider;
use apsis::errors::ApsisError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Scripted in-memory credential provider with error injection.
pub struct MockProvider {
    clients: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
    fail_create: AtomicBool,
    fail_regenerate: AtomicBool,
    fail_restore: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            fail_create: AtomicBool::new(false),
            fail_regenerate: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
        }
    }

    fn next_secret(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("generated-secret-{}", n)
    }

    /// Current secret the provider holds for a client
    pub fn secret_of(&self, client_id: &str) -> Option<String> {
        self.clients.lock().unwrap().get(client_id).cloned()
    }

    /// Force the provider-side secret, e.g. to simulate a rotation that was
    /// never recorded locally
    pub fn set_secret(&self, client_id: &str, secret: &str) {
        self.clients
            .lock()
            .unwrap()
            .insert(client_id.to_string(), secret.to_string());
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.clients.lock().unwrap().contains_key(client_id)
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_regenerate(&self, fail: bool) {
        self.fail_regenerate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialProvider for MockProvider {
    async fn create_or_get_client(&self, client_id: &str) -> Result<String, ApsisError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ApsisError::ExternalService(
                "mock: create_or_get_client failed".to_string(),
            ));
        }

        let mut clients = self.clients.lock().unwrap();
        if let Some(secret) = clients.get(client_id) {
            return Ok(secret.clone());
        }
        let secret = self.next_secret();
        clients.insert(client_id.to_string(), secret.clone());
        Ok(secret)
    }

    async fn regenerate_secret(&self, client_id: &str) -> Result<String, ApsisError> {
        if self.fail_regenerate.load(Ordering::SeqCst) {
            return Err(ApsisError::ExternalService(
                "mock: regenerate_secret failed".to_string(),
            ));
        }

        let secret = self.next_secret();
        self.clients
            .lock()
            .unwrap()
            .insert(client_id.to_string(), secret.clone());
        Ok(secret)
    }

    async fn restore_secret(&self, client_id: &str, secret: &str) -> Result<(), ApsisError> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(ApsisError::ExternalService(
                "mock: restore_secret failed".to_string(),
            ));
        }

        self.clients
            .lock()
            .unwrap()
            .insert(client_id.to_string(), secret.to_string());
        Ok(())
    }

    async fn delete_client(&self, client_id: &str) -> Result<(), ApsisError> {
        self.clients.lock().unwrap().remove(client_id);
        Ok(())
    }
}
