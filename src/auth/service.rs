use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    AuthResponse, ChangePasswordRequest, ClientContext, LoginRequest, MeResponse, RefreshRequest,
    RegisterRequest,
};
use crate::core::error::ApiError;
use crate::core::state::AppState;
use crate::directory::{normalize_email, slugify, OrgStatus, Organization, User, UserStatus};
use crate::security::audit::{record_all, AuditEvent};
use crate::security::auth::{AuthenticatedUser, Role};
use crate::security::jwt::{JwtManager, TokenPair};
use crate::security::password::PasswordService;
use crate::security::session::RefreshToken;
use crate::security::validation::Validator;
use crate::store::Store;

const INVALID_CREDENTIALS: &str = "Invalid email or password";

pub struct AuthService<'a> {
    store: &'a Store,
    passwords: &'a PasswordService,
    jwt: &'a JwtManager,
    refresh_ttl: Duration,
}

enum RefreshOutcome {
    Rotated {
        user: User,
        organization: Organization,
        plaintext: String,
        expires_at: DateTime<Utc>,
    },
    Reused {
        user_id: Uuid,
        org_id: Uuid,
        revoked: usize,
    },
}

impl<'a> AuthService<'a> {
    pub fn new(
        store: &'a Store,
        passwords: &'a PasswordService,
        jwt: &'a JwtManager,
        refresh_ttl_days: i64,
    ) -> Self {
        Self {
            store,
            passwords,
            jwt,
            refresh_ttl: Duration::days(refresh_ttl_days),
        }
    }

    pub fn from_state(state: &'a AppState) -> Self {
        Self::new(
            &state.store,
            &state.passwords,
            &state.jwt,
            state.config.auth.refresh_ttl_days,
        )
    }

    /// Creates the organization and its first user in one transaction.
    pub fn register(&self, client: &ClientContext, req: RegisterRequest) -> Result<AuthResponse, ApiError> {
        let email = normalize_email(&req.email);
        let org_name = req.organization_name.trim().to_string();
        let slug = req
            .organization_slug
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_else(|| slugify(&org_name));

        Validator::new()
            .required(&org_name, "organization_name")
            .length(&org_name, "organization_name", None, Some(255))
            .slug(&slug, "organization_slug")
            .email(&email, "email")
            .length(&req.first_name, "first_name", None, Some(100))
            .length(&req.last_name, "last_name", None, Some(100))
            .validate()?;
        self.passwords.validate(&req.password, "password")?;

        let password_hash = self.passwords.hash_for_storage(&req.password)?;
        let expires_at = Utc::now() + self.refresh_ttl;

        let (organization, user, plaintext) = self.store.transaction(|tables| {
            let organization = tables
                .organizations()
                .insert(Organization::new(org_name, slug))
                .map_err(|e| ApiError::conflict_or(e, "An organization with this slug already exists"))?;

            let user = User::new(
                organization.id,
                email,
                password_hash,
                req.first_name.trim().to_string(),
                req.last_name.trim().to_string(),
                Role::ComplianceManager,
                UserStatus::Active,
            );
            let user = tables
                .users()
                .insert(user)
                .map_err(|e| ApiError::conflict_or(e, "A user with this email already exists"))?;

            let (token, plaintext) = RefreshToken::issue(
                user.id,
                organization.id,
                expires_at,
                client.ip_address.clone(),
                client.user_agent.clone(),
            );
            tables.refresh_tokens().insert(token)?;
            Ok::<_, ApiError>((organization, user, plaintext))
        })?;

        record_all(
            self.store,
            vec![
                self.client_event(client, organization.id, user.id, "organization.created", "organization", organization.id)
                    .with_metadata("slug", organization.slug.clone()),
                self.client_event(client, organization.id, user.id, "user.created", "user", user.id)
                    .with_metadata("email", user.email.clone())
                    .with_metadata("role", user.role.as_str()),
            ],
        );
        info!(org_id = %organization.id, "organization registered");

        let tokens = self.token_pair(&user, plaintext, expires_at)?;
        Ok(AuthResponse {
            user,
            organization,
            tokens,
        })
    }

    pub fn login(&self, client: &ClientContext, req: LoginRequest) -> Result<AuthResponse, ApiError> {
        let email = normalize_email(&req.email);
        let slug = req
            .organization_slug
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let mut candidates: Vec<(User, Organization)> = self
            .store
            .read(|tables| tables.users().memberships(&email))?
            .into_iter()
            .filter(|(_, org)| slug.as_deref().map_or(true, |s| org.slug == s))
            .collect();

        if candidates.len() > 1 {
            return Err(ApiError::field(
                "organization_slug",
                "is required because this email belongs to several organizations",
            ));
        }
        let Some((user, organization)) = candidates.pop() else {
            return Err(ApiError::Unauthorized(INVALID_CREDENTIALS.into()));
        };

        if !self.passwords.matches(&req.password, &user.password_hash) {
            self.login_failed(client, &user, "invalid_password");
            return Err(ApiError::Unauthorized(INVALID_CREDENTIALS.into()));
        }
        if user.is_deactivated() || organization.status != OrgStatus::Active {
            self.login_failed(client, &user, "account_inactive");
            return Err(ApiError::Unauthorized("Account is not active".into()));
        }

        let expires_at = Utc::now() + self.refresh_ttl;
        let (user, plaintext) = self.store.transaction(|tables| {
            let mut user = tables
                .users()
                .find(organization.id, user.id)?
                .ok_or_else(|| ApiError::Unauthorized(INVALID_CREDENTIALS.into()))?;
            let now = Utc::now();
            user.last_login_at = Some(now);
            if user.status == UserStatus::Invited {
                user.status = UserStatus::Active;
            }
            user.updated_at = now;
            let user = tables.users().update(user)?;

            let (token, plaintext) = RefreshToken::issue(
                user.id,
                user.org_id,
                expires_at,
                client.ip_address.clone(),
                client.user_agent.clone(),
            );
            tables.refresh_tokens().insert(token)?;
            Ok::<_, ApiError>((user, plaintext))
        })?;

        self.client_event(client, user.org_id, user.id, "user.login", "user", user.id)
            .record(self.store);

        let tokens = self.token_pair(&user, plaintext, expires_at)?;
        Ok(AuthResponse {
            user,
            organization,
            tokens,
        })
    }

    /// Rotates the presented refresh token. The replacement keeps the
    /// original expiry. Presenting an already revoked token revokes every
    /// outstanding token of its user, commits that, and then fails.
    pub fn refresh(&self, client: &ClientContext, req: RefreshRequest) -> Result<AuthResponse, ApiError> {
        if req.refresh_token.trim().is_empty() {
            return Err(ApiError::field("refresh_token", "is required"));
        }

        let outcome = self.store.transaction(|tables| {
            let now = Utc::now();
            let presented = tables
                .refresh_tokens()
                .find_by_plaintext(req.refresh_token.trim())?
                .ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".into()))?;

            if presented.is_revoked() {
                let revoked = tables.refresh_tokens().revoke_all_for_user(presented.user_id, now)?;
                return Ok(RefreshOutcome::Reused {
                    user_id: presented.user_id,
                    org_id: presented.org_id,
                    revoked,
                });
            }
            if presented.is_expired(now) {
                return Err(ApiError::Unauthorized("Refresh token has expired".into()));
            }

            let user = tables
                .users()
                .find(presented.org_id, presented.user_id)?
                .ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".into()))?;
            let organization = tables
                .organizations()
                .get(presented.org_id)?
                .ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".into()))?;
            if user.is_deactivated() || organization.status != OrgStatus::Active {
                return Err(ApiError::Unauthorized("Account is not active".into()));
            }

            let expires_at = presented.expires_at;
            let mut revoked = presented;
            revoked.revoked_at = Some(now);
            tables.refresh_tokens().update(revoked)?;

            let (token, plaintext) = RefreshToken::issue(
                user.id,
                user.org_id,
                expires_at,
                client.ip_address.clone(),
                client.user_agent.clone(),
            );
            tables.refresh_tokens().insert(token)?;

            Ok(RefreshOutcome::Rotated {
                user,
                organization,
                plaintext,
                expires_at,
            })
        })?;

        match outcome {
            RefreshOutcome::Reused {
                user_id,
                org_id,
                revoked,
            } => {
                warn!(user_id = %user_id, revoked, "refresh token reuse detected");
                self.client_event(client, org_id, user_id, "session.reuse_detected", "user", user_id)
                    .with_metadata("revoked_tokens", revoked)
                    .record(self.store);
                Err(ApiError::Unauthorized("Refresh token has been revoked".into()))
            }
            RefreshOutcome::Rotated {
                user,
                organization,
                plaintext,
                expires_at,
            } => {
                self.client_event(client, user.org_id, user.id, "session.refreshed", "user", user.id)
                    .record(self.store);
                let tokens = self.token_pair(&user, plaintext, expires_at)?;
                Ok(AuthResponse {
                    user,
                    organization,
                    tokens,
                })
            }
        }
    }

    /// Revokes the presented token. Unknown or already revoked tokens succeed.
    pub fn logout(&self, client: &ClientContext, req: RefreshRequest) -> Result<(), ApiError> {
        let revoked = self.store.transaction(|tables| {
            let Some(mut token) = tables.refresh_tokens().find_by_plaintext(req.refresh_token.trim())? else {
                return Ok(None);
            };
            if token.is_revoked() {
                return Ok(None);
            }
            token.revoked_at = Some(Utc::now());
            Ok::<_, ApiError>(Some(tables.refresh_tokens().update(token)?))
        })?;

        if let Some(token) = revoked {
            self.client_event(client, token.org_id, token.user_id, "user.logout", "user", token.user_id)
                .record(self.store);
        }
        Ok(())
    }

    pub fn me(&self, caller: &AuthenticatedUser) -> Result<MeResponse, ApiError> {
        self.store.read(|tables| {
            let user = tables
                .users()
                .find(caller.org_id, caller.user_id)?
                .ok_or_else(|| ApiError::not_found("User"))?;
            let organization = tables
                .organizations()
                .get(caller.org_id)?
                .ok_or_else(|| ApiError::not_found("Organization"))?;
            Ok(MeResponse { user, organization })
        })
    }

    /// Every refresh token of the user is revoked along with the change.
    pub fn change_password(&self, caller: &AuthenticatedUser, req: ChangePasswordRequest) -> Result<(), ApiError> {
        self.passwords.validate(&req.new_password, "new_password")?;
        if req.new_password == req.current_password {
            return Err(ApiError::field("new_password", "must differ from the current password"));
        }

        let current_hash = self
            .store
            .read(|tables| tables.users().find(caller.org_id, caller.user_id))?
            .map(|u| u.password_hash)
            .ok_or_else(|| ApiError::not_found("User"))?;
        if !self.passwords.matches(&req.current_password, &current_hash) {
            return Err(ApiError::field("current_password", "is incorrect"));
        }

        let new_hash = self.passwords.hash_for_storage(&req.new_password)?;
        let revoked = self.store.transaction(|tables| {
            let mut user = tables
                .users()
                .find(caller.org_id, caller.user_id)?
                .ok_or_else(|| ApiError::not_found("User"))?;
            let now = Utc::now();
            user.password_hash = new_hash;
            user.updated_at = now;
            tables.users().update(user)?;
            Ok::<_, ApiError>(tables.refresh_tokens().revoke_all_for_user(caller.user_id, now)?)
        })?;

        AuditEvent::new(caller, "user.password_changed", "user", caller.user_id)
            .with_metadata("revoked_tokens", revoked)
            .record(self.store);
        Ok(())
    }

    fn token_pair(&self, user: &User, refresh_token: String, refresh_expires_at: DateTime<Utc>) -> Result<TokenPair, ApiError> {
        let access_token = self
            .jwt
            .issue_access_token(user.id, user.org_id, &user.email, user.role)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".into(),
            expires_in: self.jwt.access_ttl_seconds(),
            refresh_expires_at,
        })
    }

    fn login_failed(&self, client: &ClientContext, user: &User, reason: &str) {
        self.client_event(client, user.org_id, user.id, "user.login_failed", "user", user.id)
            .with_metadata("reason", reason)
            .record(self.store);
    }

    fn client_event(
        &self,
        client: &ClientContext,
        org_id: Uuid,
        actor_id: Uuid,
        action: &str,
        resource_type: &str,
        resource_id: Uuid,
    ) -> AuditEvent {
        AuditEvent::system(org_id, action, resource_type, resource_id)
            .with_actor(actor_id)
            .with_client(client.ip_address.clone(), client.user_agent.clone())
            .with_request_id(client.request_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::jwt::JwtConfig;
    use crate::security::password::{Argon2Config, PasswordPolicy};
    use crate::store::StoreError;
    use crate::tests::test_util::{audit_actions, test_store, unique_slug};
    use crate::{assert_err, assert_ok};

    const PASSWORD: &str = "Correct-Horse-9";

    struct Fixture {
        store: Store,
        passwords: PasswordService,
        jwt: JwtManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: test_store(),
                passwords: assert_ok!(PasswordService::new(Argon2Config::minimal(), PasswordPolicy::default())),
                jwt: assert_ok!(JwtManager::new(JwtConfig::default(), "an-extremely-secret-signing-key-0123")),
            }
        }

        fn service(&self) -> AuthService<'_> {
            AuthService::new(&self.store, &self.passwords, &self.jwt, 7)
        }
    }

    fn client() -> ClientContext {
        ClientContext {
            request_id: "req-auth".into(),
            ip_address: Some("192.0.2.1".into()),
            user_agent: Some("tests".into()),
        }
    }

    fn register(fixture: &Fixture, slug: &str, email: &str) -> AuthResponse {
        assert_ok!(fixture.service().register(
            &client(),
            RegisterRequest {
                organization_name: "Acme Corp".into(),
                organization_slug: Some(slug.into()),
                email: email.into(),
                password: PASSWORD.into(),
                first_name: "Ana".into(),
                last_name: "Silva".into(),
            }
        ))
    }

    fn login(fixture: &Fixture, email: &str, slug: Option<&str>) -> Result<AuthResponse, ApiError> {
        fixture.service().login(
            &client(),
            LoginRequest {
                email: email.into(),
                password: PASSWORD.into(),
                organization_slug: slug.map(String::from),
            },
        )
    }

    fn refresh(fixture: &Fixture, token: &str) -> Result<AuthResponse, ApiError> {
        fixture.service().refresh(
            &client(),
            RefreshRequest {
                refresh_token: token.into(),
            },
        )
    }

    #[test]
    fn test_register_creates_org_and_manager() {
        let fixture = Fixture::new();
        let resp = register(&fixture, &unique_slug("acme"), "Ana@Acme.io");
        assert_eq!(resp.user.role, Role::ComplianceManager);
        assert_eq!(resp.user.org_id, resp.organization.id);
        assert_eq!(resp.user.email, "ana@acme.io");
        assert_eq!(resp.tokens.expires_in, 900);

        let actions = audit_actions(&fixture.store, resp.organization.id);
        assert_eq!(actions, vec!["organization.created", "user.created"]);
    }

    #[test]
    fn test_register_slug_conflict_rolls_back() {
        let fixture = Fixture::new();
        let slug = unique_slug("acme");
        let first = register(&fixture, &slug, "ana@acme.io");
        let err = assert_err!(fixture.service().register(
            &client(),
            RegisterRequest {
                organization_name: "Acme Again".into(),
                organization_slug: Some(slug.clone()),
                email: "bob@acme.io".into(),
                password: PASSWORD.into(),
                first_name: String::new(),
                last_name: String::new(),
            }
        ));
        assert_eq!(err.error_code(), "CONFLICT");
        let (members, strays) = assert_ok!(fixture.store.read(|t| Ok::<_, StoreError>((
            t.users().scan(first.organization.id)?.len(),
            t.users().memberships("bob@acme.io")?.len(),
        ))));
        assert_eq!((members, strays), (1, 0));
    }

    #[test]
    fn test_register_login_refresh_keep_identity() {
        let fixture = Fixture::new();
        let slug = unique_slug("acme");
        let registered = register(&fixture, &slug, "ana@acme.io");
        let logged_in = assert_ok!(login(&fixture, "ana@acme.io", None));
        let refreshed = assert_ok!(refresh(&fixture, &logged_in.tokens.refresh_token));
        let again = assert_ok!(login(&fixture, "ANA@acme.io", Some(&slug)));

        for resp in [&logged_in, &refreshed, &again] {
            assert_eq!(resp.user.id, registered.user.id);
            assert_eq!(resp.organization.id, registered.organization.id);
        }
        assert_eq!(refreshed.tokens.refresh_expires_at, logged_in.tokens.refresh_expires_at);
        assert!(logged_in.user.last_login_at.is_some());
    }

    #[test]
    fn test_refresh_reuse_revokes_every_token() {
        let fixture = Fixture::new();
        let p1 = register(&fixture, &unique_slug("acme"), "ana@acme.io");
        let p2 = assert_ok!(refresh(&fixture, &p1.tokens.refresh_token));

        let err = assert_err!(refresh(&fixture, &p1.tokens.refresh_token));
        assert_eq!(err.error_code(), "UNAUTHORIZED");
        let err = assert_err!(refresh(&fixture, &p2.tokens.refresh_token));
        assert_eq!(err.error_code(), "UNAUTHORIZED");

        let actions = audit_actions(&fixture.store, p1.organization.id);
        assert!(actions.contains(&"session.reuse_detected".to_string()));
    }

    #[test]
    fn test_refresh_token_plaintext_is_not_persisted() {
        let fixture = Fixture::new();
        let resp = register(&fixture, &unique_slug("acme"), "ana@acme.io");
        let plaintext = resp.tokens.refresh_token.clone();
        let rows = assert_ok!(fixture.store.read(|t| t.refresh_tokens().scan(resp.organization.id)));
        assert_eq!(rows.len(), 1);
        assert!(rows.iter().all(|r| r.token_hash != plaintext));
    }

    #[test]
    fn test_wrong_password_is_audited() {
        let fixture = Fixture::new();
        let resp = register(&fixture, &unique_slug("acme"), "ana@acme.io");
        let err = assert_err!(fixture.service().login(
            &client(),
            LoginRequest {
                email: "ana@acme.io".into(),
                password: "Wrong-Password-1".into(),
                organization_slug: None,
            }
        ));
        assert_eq!(err.error_code(), "UNAUTHORIZED");
        assert!(audit_actions(&fixture.store, resp.organization.id).contains(&"user.login_failed".to_string()));
    }

    #[test]
    fn test_ambiguous_email_needs_slug() {
        let fixture = Fixture::new();
        let globex = unique_slug("globex");
        register(&fixture, &unique_slug("acme"), "ana@acme.io");
        register(&fixture, &globex, "ana@acme.io");
        let err = assert_err!(login(&fixture, "ana@acme.io", None));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        let resp = assert_ok!(login(&fixture, "ana@acme.io", Some(&globex)));
        assert_eq!(resp.organization.slug, globex);
    }

    #[test]
    fn test_logout_is_idempotent() {
        let fixture = Fixture::new();
        let resp = register(&fixture, &unique_slug("acme"), "ana@acme.io");
        let req = || RefreshRequest {
            refresh_token: resp.tokens.refresh_token.clone(),
        };
        assert_ok!(fixture.service().logout(&client(), req()));
        assert_ok!(fixture.service().logout(&client(), req()));
        assert_ok!(fixture.service().logout(
            &client(),
            RefreshRequest {
                refresh_token: "unknown".into()
            }
        ));
        let logouts = audit_actions(&fixture.store, resp.organization.id)
            .into_iter()
            .filter(|a| a == "user.logout")
            .count();
        assert_eq!(logouts, 1);
    }

    #[test]
    fn test_password_change_revokes_sessions() {
        let fixture = Fixture::new();
        let resp = register(&fixture, &unique_slug("acme"), "ana@acme.io");
        let caller = crate::tests::test_util::as_caller(&resp.user);

        let err = assert_err!(fixture.service().change_password(
            &caller,
            ChangePasswordRequest {
                current_password: PASSWORD.into(),
                new_password: PASSWORD.into(),
            }
        ));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        assert_ok!(fixture.service().change_password(
            &caller,
            ChangePasswordRequest {
                current_password: PASSWORD.into(),
                new_password: "Another-Secret-77".into(),
            }
        ));
        let err = assert_err!(refresh(&fixture, &resp.tokens.refresh_token));
        assert_eq!(err.error_code(), "UNAUTHORIZED");
    }
}
