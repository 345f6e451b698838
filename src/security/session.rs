use chrono::{DateTime, Utc};
use diesel::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::schema::refresh_tokens::dsl;
use crate::store::table::entity;
use crate::store::{StoreError, Table};

/// Persisted half of a refresh token. The plaintext only ever exists in the
/// response that hands it out.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::refresh_tokens, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub token_hash: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

entity!(RefreshToken => refresh_tokens, tenant);

impl RefreshToken {
    /// Creates a new token row and returns it with the plaintext to hand out.
    pub fn issue(
        user_id: Uuid,
        org_id: Uuid,
        expires_at: DateTime<Utc>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> (Self, String) {
        let plaintext = generate_refresh_token();
        let row = Self {
            id: Uuid::new_v4(),
            user_id,
            org_id,
            token_hash: hash_token(&plaintext),
            user_agent,
            ip_address,
            expires_at,
            revoked_at: None,
            created_at: Utc::now(),
        };
        (row, plaintext)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

impl<'t> Table<'t, RefreshToken> {
    pub fn find_by_plaintext(self, plaintext: &str) -> Result<Option<RefreshToken>, StoreError> {
        let hash = hash_token(plaintext);
        Ok(dsl::refresh_tokens
            .filter(dsl::token_hash.eq(hash))
            .select(RefreshToken::as_select())
            .for_no_key_update()
            .first(self.connection())
            .optional()?)
    }

    /// Revokes every outstanding token of `user_id`. Returns how many were revoked.
    pub fn revoke_all_for_user(self, user_id: Uuid, now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(diesel::update(
            dsl::refresh_tokens
                .filter(dsl::user_id.eq(user_id))
                .filter(dsl::revoked_at.is_null()),
        )
        .set(dsl::revoked_at.eq(now))
        .execute(self.connection())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_plaintext_is_never_stored() {
        let (row, plaintext) = RefreshToken::issue(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Utc::now() + Duration::days(7),
            None,
            None,
        );
        assert_eq!(plaintext.len(), 64);
        assert_ne!(row.token_hash, plaintext);
        assert_eq!(row.token_hash, hash_token(&plaintext));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_refresh_token(), generate_refresh_token());
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_revoke_all_for_user() {
        use crate::security::auth::Role;
        use crate::tests::test_util::{seed_user, Tenant};

        let t = Tenant::new();
        let user = seed_user(&t.store, t.org_id, Role::Viewer).id;
        let other = seed_user(&t.store, t.org_id, Role::Viewer).id;
        let expiry = Utc::now() + Duration::days(7);
        t.store
            .transaction(|tables| {
                for _ in 0..3 {
                    tables.refresh_tokens().insert(RefreshToken::issue(user, t.org_id, expiry, None, None).0)?;
                }
                tables.refresh_tokens().insert(RefreshToken::issue(other, t.org_id, expiry, None, None).0)
            })
            .expect("insert");

        let revoke = || t.store.transaction(|tables| tables.refresh_tokens().revoke_all_for_user(user, Utc::now()));
        assert_eq!(revoke().expect("revoke"), 3);
        let revoked = t
            .store
            .read(|tables| tables.refresh_tokens().scan(t.org_id))
            .expect("scan")
            .iter()
            .filter(|row| row.is_revoked())
            .count();
        assert_eq!(revoked, 3);
        assert_eq!(revoke().expect("revoke"), 0);
    }

    #[test]
    fn test_find_by_plaintext() {
        use crate::security::auth::Role;
        use crate::tests::test_util::{seed_user, Tenant};

        let t = Tenant::new();
        let user = seed_user(&t.store, t.org_id, Role::Viewer).id;
        let (row, plaintext) = RefreshToken::issue(user, t.org_id, Utc::now(), None, None);
        let id = row.id;
        t.store.transaction(|tables| tables.refresh_tokens().insert(row)).expect("insert");

        let (found, missing) = t
            .store
            .transaction(|tables| {
                Ok::<_, StoreError>((
                    tables.refresh_tokens().find_by_plaintext(&plaintext)?,
                    tables.refresh_tokens().find_by_plaintext("unknown")?,
                ))
            })
            .expect("lookup");
        assert_eq!(found.map(|t| t.id), Some(id));
        assert!(missing.is_none());
    }
}
