//! Postgres pool construction shared by the service and its schedulers.

use std::str::FromStr;

use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

/// Ensures the connection string explicitly disables SSL for local usage.
/// Connection strings that already carry an sslmode are left alone.
pub fn ensure_sslmode_disable(url: &str) -> String {
    if url.to_ascii_lowercase().contains("sslmode=") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}sslmode=disable")
}

/// Builds the deadpool-backed connection pool used across the service.
pub fn build_pool(database_url: &str) -> Result<Pool> {
    let url = ensure_sslmode_disable(database_url);
    let cfg = tokio_postgres::Config::from_str(&url).context("parsing database url")?;
    let mgr = Manager::from_config(
        cfg,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(mgr)
        .max_size(16)
        .build()
        .context("building postgres pool")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sslmode_appended_once() {
        assert_eq!(
            ensure_sslmode_disable("postgres://u:p@h/db"),
            "postgres://u:p@h/db?sslmode=disable"
        );
        assert_eq!(
            ensure_sslmode_disable("postgres://u:p@h/db?x=1"),
            "postgres://u:p@h/db?x=1&sslmode=disable"
        );
        assert_eq!(
            ensure_sslmode_disable("postgres://u:p@h/db?sslmode=require"),
            "postgres://u:p@h/db?sslmode=require"
        );
    }
}
