//! PostgreSQL persistence.
//!
//! Every request unit of work runs in one database transaction through
//! [`Store::read`] or [`Store::transaction`]. Inside a write transaction
//! point lookups take `FOR NO KEY UPDATE` row locks, so read-modify-write
//! sequences on the same row serialize. Unique and partial-unique indexes
//! and per-organization sequences are enforced by the database; see
//! `migrations/`.
//!
//! Audit entries are appended on their own connection, outside the
//! transaction of the change they describe.

pub mod schema;
pub mod table;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub use table::{Entity, SequencedEntity, Table, TenantEntity};

use crate::alerts::types::{Alert, AlertRule};
use crate::compliance::types::{
    Control, ControlMapping, Framework, FrameworkVersion, OrgFramework, Requirement,
    RequirementScope,
};
use crate::config::DatabaseConfig;
use crate::core::pagination::{Page, PageRequest, SortOrder};
use crate::directory::{Organization, User};
use crate::risk::types::{Risk, RiskAssessment, RiskControl, RiskTreatment};
use crate::security::audit::{AuditLogEntry, AuditQuery};
use crate::security::session::RefreshToken;
use crate::test_engine::types::{ControlTest, TestResult, TestRun};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Advisory lock key held while migrations run, so replicas starting
/// together apply them once.
const MIGRATION_LOCK_KEY: i64 = 0x6772_6373_7276;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },
    #[error("row {0} does not exist")]
    MissingRow(Uuid),
    #[error("database error: {0}")]
    Query(DieselError),
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("migration failed: {0}")]
    Migration(String),
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::UniqueViolation {
                    constraint: info.constraint_name().unwrap_or("unknown").to_string(),
                }
            }
            other => StoreError::Query(other),
        }
    }
}

/// Carries either the caller's own error or a failure of the transaction
/// machinery out of `Connection::transaction`.
enum TxError<E> {
    Abort(E),
    Db(DieselError),
}

impl<E> From<DieselError> for TxError<E> {
    fn from(err: DieselError) -> Self {
        TxError::Db(err)
    }
}

/// Access to the typed tables from inside one transaction.
pub struct Tables<'c> {
    conn: &'c mut PgConnection,
    locking: bool,
}

macro_rules! table_accessors {
    ($($name:ident => $ty:ty),+ $(,)?) => {
        impl<'c> Tables<'c> {
            $(
                pub fn $name(&mut self) -> Table<'_, $ty> {
                    Table::new(self.conn, self.locking)
                }
            )+
        }
    };
}

table_accessors! {
    organizations => Organization,
    users => User,
    refresh_tokens => RefreshToken,
    frameworks => Framework,
    framework_versions => FrameworkVersion,
    requirements => Requirement,
    org_frameworks => OrgFramework,
    requirement_scopes => RequirementScope,
    controls => Control,
    control_mappings => ControlMapping,
    risks => Risk,
    risk_assessments => RiskAssessment,
    risk_treatments => RiskTreatment,
    risk_controls => RiskControl,
    tests => ControlTest,
    test_runs => TestRun,
    test_results => TestResult,
    alerts => Alert,
    alert_rules => AlertRule,
}

impl<'c> Tables<'c> {
    /// Raw connection for queries the typed tables do not cover.
    pub fn conn(&mut self) -> &mut PgConnection {
        self.conn
    }
}

#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.pool.state();
        f.debug_struct("Store")
            .field("connections", &state.connections)
            .field("idle_connections", &state.idle_connections)
            .finish()
    }
}

impl Store {
    /// Builds the pool and applies pending migrations.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<PgConnection>::new(&config.url);
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .build(manager)?;
        let store = Self::from_pool(pool);
        store.migrate()?;
        Ok(store)
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        run_migrations(&mut conn)
    }

    /// Runs `f` in a transaction without row locks.
    pub fn read<T, E>(&self, f: impl FnOnce(&mut Tables<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.run(false, f)
    }

    /// Runs `f` in a transaction that commits only if `f` returns `Ok`.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&mut Tables<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.run(true, f)
    }

    fn run<T, E>(&self, locking: bool, f: impl FnOnce(&mut Tables<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut pooled = self.pool.get().map_err(StoreError::from)?;
        let conn: &mut PgConnection = &mut pooled;
        let outcome = conn.transaction::<T, TxError<E>, _>(|conn| {
            let mut tables = Tables { conn, locking };
            f(&mut tables).map_err(TxError::Abort)
        });
        match outcome {
            Ok(value) => Ok(value),
            Err(TxError::Abort(err)) => Err(err),
            Err(TxError::Db(err)) => Err(StoreError::from(err).into()),
        }
    }

    pub fn append_audit(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        use schema::audit_logs::dsl::audit_logs;

        let mut conn = self.pool.get()?;
        diesel::insert_into(audit_logs).values(&entry).execute(&mut conn)?;
        Ok(())
    }

    /// Filtered page of the audit log by creation time, ties broken by
    /// append order.
    pub fn query_audit(&self, query: &AuditQuery, request: &PageRequest) -> Result<Page<AuditLogEntry>, StoreError> {
        use schema::audit_logs::dsl;

        let mut conn = self.pool.get()?;
        let total: i64 = query.filtered().count().get_result(&mut conn)?;
        let ordered = match request.order {
            SortOrder::Asc => query.filtered().order((dsl::created_at.asc(), dsl::seq.asc())),
            SortOrder::Desc => query.filtered().order((dsl::created_at.desc(), dsl::seq.desc())),
        };
        let items = ordered
            .select(AuditLogEntry::as_select())
            .limit(request.per_page as i64)
            .offset(request.offset() as i64)
            .load(&mut conn)?;
        Ok(Page {
            items,
            total: total.max(0) as usize,
            page: request.page,
            per_page: request.per_page,
        })
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        conn.batch_execute("SELECT 1")?;
        Ok(())
    }
}

pub fn run_migrations(conn: &mut PgConnection) -> Result<(), StoreError> {
    diesel::sql_query("SELECT pg_advisory_lock($1)")
        .bind::<diesel::sql_types::BigInt, _>(MIGRATION_LOCK_KEY)
        .execute(conn)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map(|versions| versions.len())
        .map_err(|e| StoreError::Migration(e.to_string()));
    diesel::sql_query("SELECT pg_advisory_unlock($1)")
        .bind::<diesel::sql_types::BigInt, _>(MIGRATION_LOCK_KEY)
        .execute(conn)?;
    let applied = applied?;
    if applied > 0 {
        info!(applied, "Applied database migrations");
    }
    Ok(())
}
