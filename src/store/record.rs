//! The capability a row type needs to flow through the generic store.

use diesel::deserialize::QueryableByName;
use diesel::sqlite::Sqlite;

/// A work record as seen by the store.
///
/// The store is written once against this capability and instantiated per
/// concrete record type. A record only needs to be scannable from the
/// configured column projection and expose its identity; everything else
/// (payload shape, joined columns) is the consumer's business.
pub trait Record: QueryableByName<Sqlite> + Send + Sized + 'static {
    /// Stable primary-key identity used for all store operations.
    fn record_id(&self) -> i64;
}
