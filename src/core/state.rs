use anyhow::Result;
use std::sync::Arc;

use super::error::ApiError;
use crate::alerts::notify::Notifier;
use crate::config::AppConfig;
use crate::security::jwt::{JwtConfig, JwtManager};
use crate::security::password::{PasswordPolicy, PasswordService};
use crate::store::Store;

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub jwt: Arc<JwtManager>,
    pub passwords: Arc<PasswordService>,
    pub notifier: Arc<Notifier>,
}

impl AppState {
    /// Connects to the configured database and applies migrations.
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = Store::connect(&config.database)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: AppConfig, store: Store) -> Result<Self> {
        let jwt_config = JwtConfig {
            issuer: config.auth.issuer.clone(),
            audience: config.auth.audience.clone(),
            access_token_expiry_minutes: config.auth.access_ttl_minutes,
            ..JwtConfig::default()
        };
        let jwt = JwtManager::new(jwt_config, &config.auth.jwt_secret)?;
        let passwords = PasswordService::new(config.auth.argon2(), PasswordPolicy::default())?;
        let notifier = Notifier::new(&config.notifications)?;

        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            jwt: Arc::new(jwt),
            passwords: Arc::new(passwords),
            notifier: Arc::new(notifier),
        })
    }

    /// Runs store work on the blocking pool; diesel connections are synchronous.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(AppState) -> Result<T, ApiError> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        tokio::task::spawn_blocking(move || f(state))
            .await
            .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
    }
}
