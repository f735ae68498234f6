pub use sea_orm;

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

/// Open the registry database.
///
/// SQLite gets a single pooled connection: the registry serializes access
/// anyway, and an in-memory database only exists on the connection that
/// created it.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_string());
    if database_url.starts_with("sqlite:") {
        opts.max_connections(1).min_connections(1);
        if database_url.contains(":memory:") {
            // Never let the pool recycle the connection holding the data.
            opts.idle_timeout(Duration::from_secs(u32::MAX as u64))
                .max_lifetime(Duration::from_secs(u32::MAX as u64));
        }
    }
    opts.sqlx_logging(false);
    Database::connect(opts).await
}
