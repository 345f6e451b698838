use diesel::prelude::*;
use std::marker::PhantomData;
use uuid::Uuid;

use super::schema::org_sequences;
use super::StoreError;

/// A row type with its own table. Implemented with [`entity!`].
pub trait Entity: Sized {
    fn id(&self) -> Uuid;
    fn load(conn: &mut PgConnection, id: Uuid, lock: bool) -> QueryResult<Option<Self>>;
    fn load_all(conn: &mut PgConnection) -> QueryResult<Vec<Self>>;
    fn insert_row(conn: &mut PgConnection, row: &Self) -> QueryResult<Self>;
    fn update_row(conn: &mut PgConnection, row: &Self) -> QueryResult<Option<Self>>;
    fn delete_row(conn: &mut PgConnection, id: Uuid) -> QueryResult<usize>;
}

/// Rows owned by exactly one organization.
pub trait TenantEntity: Entity {
    fn org_id(&self) -> Uuid;
    fn load_in_org(conn: &mut PgConnection, org_id: Uuid, id: Uuid, lock: bool) -> QueryResult<Option<Self>>;
    fn load_org(conn: &mut PgConnection, org_id: Uuid) -> QueryResult<Vec<Self>>;
}

/// Rows numbered from a per-organization counter on insert.
pub trait SequencedEntity: TenantEntity {
    const SEQUENCE: &'static str;
    fn assign_number(&mut self, number: i64);
}

/// Handle on one table for the duration of a single call.
pub struct Table<'t, T> {
    conn: &'t mut PgConnection,
    locking: bool,
    row: PhantomData<T>,
}

impl<'t, T> Table<'t, T> {
    pub(crate) fn new(conn: &'t mut PgConnection, locking: bool) -> Self {
        Self {
            conn,
            locking,
            row: PhantomData,
        }
    }

    pub(crate) fn connection(self) -> &'t mut PgConnection {
        self.conn
    }
}

/// Runs `f` under a savepoint so a failed statement leaves the enclosing
/// transaction usable.
fn savepoint<R>(conn: &mut PgConnection, f: impl FnOnce(&mut PgConnection) -> QueryResult<R>) -> Result<R, StoreError> {
    conn.transaction(f).map_err(StoreError::from)
}

impl<'t, T: Entity> Table<'t, T> {
    pub fn get(self, id: Uuid) -> Result<Option<T>, StoreError> {
        Ok(T::load(self.conn, id, self.locking)?)
    }

    pub fn all(self) -> Result<Vec<T>, StoreError> {
        Ok(T::load_all(self.conn)?)
    }

    pub fn insert(self, row: T) -> Result<T, StoreError> {
        savepoint(self.conn, |conn| T::insert_row(conn, &row))
    }

    pub fn update(self, row: T) -> Result<T, StoreError> {
        let id = row.id();
        savepoint(self.conn, |conn| T::update_row(conn, &row))?.ok_or(StoreError::MissingRow(id))
    }

    /// Deletes the row. Returns whether it existed.
    pub fn remove(self, id: Uuid) -> Result<bool, StoreError> {
        Ok(savepoint(self.conn, |conn| T::delete_row(conn, id))? > 0)
    }
}

impl<'t, T: TenantEntity> Table<'t, T> {
    /// Tenant-checked lookup: a row of another organization is never returned.
    pub fn find(self, org_id: Uuid, id: Uuid) -> Result<Option<T>, StoreError> {
        Ok(T::load_in_org(self.conn, org_id, id, self.locking)?)
    }

    pub fn scan(self, org_id: Uuid) -> Result<Vec<T>, StoreError> {
        Ok(T::load_org(self.conn, org_id)?)
    }
}

impl<'t, T: SequencedEntity> Table<'t, T> {
    /// Takes the next number of the organization's counter and inserts the
    /// row under the same savepoint, so a rejected insert consumes nothing.
    pub fn insert_sequenced(self, mut row: T) -> Result<T, StoreError> {
        savepoint(self.conn, |conn| {
            row.assign_number(next_in_sequence(conn, row.org_id(), T::SEQUENCE)?);
            T::insert_row(conn, &row)
        })
    }
}

/// Increments and returns the organization's counter. The row lock it takes
/// is held until the transaction ends, which keeps numbers gap-free.
pub fn next_in_sequence(conn: &mut PgConnection, org_id: Uuid, name: &str) -> QueryResult<i64> {
    use org_sequences::dsl;

    diesel::insert_into(dsl::org_sequences)
        .values((dsl::org_id.eq(org_id), dsl::name.eq(name), dsl::value.eq(1i64)))
        .on_conflict((dsl::org_id, dsl::name))
        .do_update()
        .set(dsl::value.eq(dsl::value + 1i64))
        .returning(dsl::value)
        .get_result(conn)
}

/// Implements [`Entity`] for a row type over its `schema` table. `tenant`
/// adds [`TenantEntity`] keyed on `org_id`; `sequenced "name" => field`
/// adds [`SequencedEntity`]; each `method => column` pair adds a lookup of
/// every row whose uuid `column` equals the argument.
macro_rules! entity {
    (@base $ty:ty, $table:ident) => {
        impl $crate::store::Entity for $ty {
            fn id(&self) -> uuid::Uuid {
                self.id
            }

            fn load(conn: &mut diesel::PgConnection, id: uuid::Uuid, lock: bool) -> diesel::QueryResult<Option<Self>> {
                use diesel::prelude::*;
                use $crate::store::schema::$table::dsl;
                let query = dsl::$table.filter(dsl::id.eq(id)).select(<$ty>::as_select());
                if lock {
                    query.for_no_key_update().first(conn).optional()
                } else {
                    query.first(conn).optional()
                }
            }

            fn load_all(conn: &mut diesel::PgConnection) -> diesel::QueryResult<Vec<Self>> {
                use diesel::prelude::*;
                use $crate::store::schema::$table::dsl;
                dsl::$table.select(<$ty>::as_select()).order(dsl::id).load(conn)
            }

            fn insert_row(conn: &mut diesel::PgConnection, row: &Self) -> diesel::QueryResult<Self> {
                use diesel::prelude::*;
                use $crate::store::schema::$table::dsl;
                diesel::insert_into(dsl::$table)
                    .values(row)
                    .returning(<$ty>::as_returning())
                    .get_result(conn)
            }

            fn update_row(conn: &mut diesel::PgConnection, row: &Self) -> diesel::QueryResult<Option<Self>> {
                use diesel::prelude::*;
                use $crate::store::schema::$table::dsl;
                diesel::update(dsl::$table.filter(dsl::id.eq(row.id)))
                    .set(row)
                    .returning(<$ty>::as_returning())
                    .get_result(conn)
                    .optional()
            }

            fn delete_row(conn: &mut diesel::PgConnection, id: uuid::Uuid) -> diesel::QueryResult<usize> {
                use diesel::prelude::*;
                use $crate::store::schema::$table::dsl;
                diesel::delete(dsl::$table.filter(dsl::id.eq(id))).execute(conn)
            }
        }
    };
    (@tenant $ty:ty, $table:ident) => {
        impl $crate::store::TenantEntity for $ty {
            fn org_id(&self) -> uuid::Uuid {
                self.org_id
            }

            fn load_in_org(
                conn: &mut diesel::PgConnection,
                org_id: uuid::Uuid,
                id: uuid::Uuid,
                lock: bool,
            ) -> diesel::QueryResult<Option<Self>> {
                use diesel::prelude::*;
                use $crate::store::schema::$table::dsl;
                let query = dsl::$table
                    .filter(dsl::id.eq(id))
                    .filter(dsl::org_id.eq(org_id))
                    .select(<$ty>::as_select());
                if lock {
                    query.for_no_key_update().first(conn).optional()
                } else {
                    query.first(conn).optional()
                }
            }

            fn load_org(conn: &mut diesel::PgConnection, org_id: uuid::Uuid) -> diesel::QueryResult<Vec<Self>> {
                use diesel::prelude::*;
                use $crate::store::schema::$table::dsl;
                dsl::$table
                    .filter(dsl::org_id.eq(org_id))
                    .select(<$ty>::as_select())
                    .order(dsl::id)
                    .load(conn)
            }
        }
    };
    (@lookups $ty:ty, $table:ident, { $($method:ident => $column:ident),* $(,)? }) => {
        impl<'t> $crate::store::Table<'t, $ty> {
            $(
                pub fn $method(self, value: uuid::Uuid) -> Result<Vec<$ty>, $crate::store::StoreError> {
                    use diesel::prelude::*;
                    use $crate::store::schema::$table::dsl;
                    Ok(dsl::$table
                        .filter(dsl::$column.eq(value))
                        .select(<$ty>::as_select())
                        .order(dsl::id)
                        .load(self.connection())?)
                }
            )*
        }
    };
    ($ty:ty => $table:ident $(, { $($method:ident => $column:ident),* $(,)? })?) => {
        $crate::store::table::entity!(@base $ty, $table);
        $( $crate::store::table::entity!(@lookups $ty, $table, { $($method => $column),* }); )?
    };
    ($ty:ty => $table:ident, tenant $(, { $($method:ident => $column:ident),* $(,)? })?) => {
        $crate::store::table::entity!(@base $ty, $table);
        $crate::store::table::entity!(@tenant $ty, $table);
        $( $crate::store::table::entity!(@lookups $ty, $table, { $($method => $column),* }); )?
    };
    ($ty:ty => $table:ident, sequenced $seq:literal => $field:ident $(, { $($method:ident => $column:ident),* $(,)? })?) => {
        $crate::store::table::entity!($ty => $table, tenant $(, { $($method => $column),* })?);
        impl $crate::store::SequencedEntity for $ty {
            const SEQUENCE: &'static str = $seq;

            fn assign_number(&mut self, number: i64) {
                self.$field = number;
            }
        }
    };
}

pub(crate) use entity;
