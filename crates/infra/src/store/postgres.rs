//! Postgres adapters over the host application's tables.
//!
//! The jobs are synchronous, so [`PgDatabase`] owns a current-thread Tokio
//! runtime and blocks on each query. No runtime worker threads ever exist,
//! which keeps the process safe to spawn children from.
//!
//! The pool is created on first use and dropped whenever the connectivity
//! gate closes; the next query reconnects.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use mailops_core::{AccountId, EndpointId, EndpointStatus, ReleaseVersion, ServiceStatus};

use super::{
    Account, AccountDirectory, CampaignMonitor, Endpoint, EndpointRepository, SiteOptions,
    StoreError,
};
use crate::gate::ConnectivityGate;
use crate::notify::{Notification, Notifier, NotifyError};

const OPTION_CATEGORY: &str = "system.common";

/// Shared, lazily connected handle to the host database.
pub struct PgDatabase {
    runtime: Runtime,
    url: String,
    table_prefix: String,
    connect_timeout: Duration,
    pool: Mutex<Option<PgPool>>,
}

impl PgDatabase {
    pub fn new(
        url: impl Into<String>,
        table_prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let table_prefix = table_prefix.into();
        if !table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Unavailable(format!(
                "invalid table prefix `{table_prefix}`"
            )));
        }
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("runtime: {e}")))?;

        Ok(Self {
            runtime,
            url: url.into(),
            table_prefix,
            connect_timeout,
            pool: Mutex::new(None),
        })
    }

    /// Fully qualified name of a host table.
    pub fn table(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }

    pub fn is_connected(&self) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn pool(&self) -> Result<PgPool, StoreError> {
        let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        debug!("connecting to database");
        let pool = self
            .runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(2)
                    .acquire_timeout(self.connect_timeout)
                    .connect(&self.url),
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Run one query future to completion on the owned runtime.
    fn run<T, F, Fut>(&self, query: F) -> Result<T, StoreError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let pool = self.pool()?;
        self.runtime
            .block_on(query(pool))
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Close and forget the pool; the next query reconnects.
    pub fn disconnect(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            debug!("closing database pool");
            self.runtime.block_on(pool.close());
        }
    }
}

impl core::fmt::Debug for PgDatabase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PgDatabase")
            .field("table_prefix", &self.table_prefix)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Closes the pool while the job blocks on something slow.
#[derive(Debug, Clone)]
pub struct PgConnectivityGate {
    db: Arc<PgDatabase>,
}

impl PgConnectivityGate {
    pub fn new(db: Arc<PgDatabase>) -> Self {
        Self { db }
    }
}

impl ConnectivityGate for PgConnectivityGate {
    fn set_active(&self, active: bool) {
        if !active {
            self.db.disconnect();
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSiteOptions {
    db: Arc<PgDatabase>,
}

impl PgSiteOptions {
    pub fn new(db: Arc<PgDatabase>) -> Self {
        Self { db }
    }

    fn read(&self, key: &'static str) -> Result<String, StoreError> {
        let sql = format!(
            "SELECT value FROM {} WHERE category = $1 AND key = $2",
            self.db.table("option")
        );
        let value: Option<String> = self.db.run(|pool| async move {
            let row = sqlx::query(&sql)
                .bind(OPTION_CATEGORY)
                .bind(key)
                .fetch_optional(&pool)
                .await?;
            row.map(|r| r.try_get::<String, _>("value")).transpose()
        })?;
        value.ok_or_else(|| StoreError::Missing(format!("option {OPTION_CATEGORY}.{key}")))
    }
}

impl SiteOptions for PgSiteOptions {
    fn app_version(&self) -> Result<ReleaseVersion, StoreError> {
        Ok(ReleaseVersion::parse(&self.read("version")?)?)
    }

    fn service_status(&self) -> Result<ServiceStatus, StoreError> {
        Ok(self.read("site_status")?.parse()?)
    }

    fn set_service_status(&self, status: ServiceStatus) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (category, key, value, serialized, date_added, last_updated)
            VALUES ($1, 'site_status', $2, 0, NOW(), NOW())
            ON CONFLICT (category, key)
            DO UPDATE SET value = EXCLUDED.value, last_updated = NOW()
            "#,
            self.db.table("option")
        );
        self.db.run(|pool| async move {
            sqlx::query(&sql)
                .bind(OPTION_CATEGORY)
                .bind(status.as_str())
                .execute(&pool)
                .await
                .map(|_| ())
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgCampaignMonitor {
    db: Arc<PgDatabase>,
}

impl PgCampaignMonitor {
    pub fn new(db: Arc<PgDatabase>) -> Self {
        Self { db }
    }
}

impl CampaignMonitor for PgCampaignMonitor {
    fn processing_count(&self) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE status = 'processing'",
            self.db.table("campaign")
        );
        let n: i64 = self.db.run(|pool| async move {
            sqlx::query(&sql).fetch_one(&pool).await?.try_get("n")
        })?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
pub struct PgEndpointRepository {
    db: Arc<PgDatabase>,
}

impl PgEndpointRepository {
    pub fn new(db: Arc<PgDatabase>) -> Self {
        Self { db }
    }

    fn select(&self, filter: &str) -> String {
        format!(
            "SELECT server_id, hostname, username, status FROM {} WHERE {filter} ORDER BY server_id",
            self.db.table("bounce_server")
        )
    }
}

type EndpointRow = (i64, String, String, String);

fn endpoint_from_row((id, hostname, username, status): EndpointRow) -> Result<Endpoint, StoreError> {
    let id = u64::try_from(id)
        .map_err(|_| StoreError::Query(format!("negative endpoint id {id}")))?;
    Ok(Endpoint {
        id: EndpointId::new(id),
        hostname,
        username,
        status: status.parse()?,
    })
}

fn endpoint_key(id: EndpointId) -> Result<i64, StoreError> {
    i64::try_from(id.get()).map_err(|_| StoreError::Query(format!("endpoint id {id} out of range")))
}

impl EndpointRepository for PgEndpointRepository {
    fn reset_running(&self) -> Result<usize, StoreError> {
        let sql = format!(
            "UPDATE {} SET status = $1, last_updated = NOW() WHERE status = $2",
            self.db.table("bounce_server")
        );
        let affected = self.db.run(|pool| async move {
            sqlx::query(&sql)
                .bind(EndpointStatus::Active.as_str())
                .bind(EndpointStatus::Running.as_str())
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
        })?;
        Ok(usize::try_from(affected).unwrap_or(usize::MAX))
    }

    fn list_active(&self) -> Result<Vec<Endpoint>, StoreError> {
        let sql = self.select("status = $1");
        let rows: Vec<EndpointRow> = self.db.run(|pool| async move {
            sqlx::query_as(&sql)
                .bind(EndpointStatus::Active.as_str())
                .fetch_all(&pool)
                .await
        })?;
        rows.into_iter().map(endpoint_from_row).collect()
    }

    fn get(&self, id: EndpointId) -> Result<Option<Endpoint>, StoreError> {
        let key = endpoint_key(id)?;
        let sql = self.select("server_id = $1");
        let row: Option<EndpointRow> = self.db.run(|pool| async move {
            sqlx::query_as(&sql).bind(key).fetch_optional(&pool).await
        })?;
        row.map(endpoint_from_row).transpose()
    }

    fn set_status(&self, id: EndpointId, status: EndpointStatus) -> Result<(), StoreError> {
        let key = endpoint_key(id)?;
        let sql = format!(
            "UPDATE {} SET status = $1, last_updated = NOW() WHERE server_id = $2",
            self.db.table("bounce_server")
        );
        let affected = self.db.run(|pool| async move {
            sqlx::query(&sql)
                .bind(status.as_str())
                .bind(key)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
        })?;
        if affected == 0 {
            return Err(StoreError::Missing(format!("endpoint {id}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgAccountDirectory {
    db: Arc<PgDatabase>,
}

impl PgAccountDirectory {
    pub fn new(db: Arc<PgDatabase>) -> Self {
        Self { db }
    }
}

impl AccountDirectory for PgAccountDirectory {
    fn notifiable_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let sql = format!(
            r#"
            SELECT user_id, TRIM(CONCAT(first_name, ' ', last_name)) AS name, email
            FROM {}
            WHERE status = 'active' AND removable = 'no'
            ORDER BY user_id
            "#,
            self.db.table("user")
        );
        let rows: Vec<(i64, String, String)> = self
            .db
            .run(|pool| async move { sqlx::query_as(&sql).fetch_all(&pool).await })?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, name, email)| match u64::try_from(id) {
                Ok(id) => Some(Account {
                    id: AccountId::new(id),
                    name,
                    email,
                }),
                Err(_) => {
                    warn!(user_id = id, "skipping account with invalid id");
                    None
                }
            })
            .collect())
    }
}

/// Queues transactional emails and in-app messages in the host tables.
#[derive(Debug, Clone)]
pub struct PgNotifier {
    db: Arc<PgDatabase>,
    from_name: String,
}

impl PgNotifier {
    pub fn new(db: Arc<PgDatabase>, from_name: impl Into<String>) -> Self {
        Self {
            db,
            from_name: from_name.into(),
        }
    }

    fn delivery_error(to: &Account, err: StoreError) -> NotifyError {
        NotifyError::Delivery {
            recipient: to.email.clone(),
            reason: err.to_string(),
        }
    }
}

impl Notifier for PgNotifier {
    fn send_email(&self, to: &Account, notification: &Notification) -> Result<(), NotifyError> {
        let sql = format!(
            r#"
            INSERT INTO {} (to_name, to_email, from_name, subject, body, status, date_added, last_updated)
            VALUES ($1, $2, $3, $4, $5, 'unsent', NOW(), NOW())
            "#,
            self.db.table("transactional_email")
        );
        let (name, email) = (to.name.clone(), to.email.clone());
        let from_name = self.from_name.clone();
        let (subject, body) = (notification.subject.clone(), notification.body.clone());
        self.db
            .run(|pool| async move {
                sqlx::query(&sql)
                    .bind(name)
                    .bind(email)
                    .bind(from_name)
                    .bind(subject)
                    .bind(body)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            })
            .map_err(|e| Self::delivery_error(to, e))
    }

    fn post_message(&self, to: &Account, notification: &Notification) -> Result<(), NotifyError> {
        let user_id = i64::try_from(to.id.get()).map_err(|_| NotifyError::Delivery {
            recipient: to.email.clone(),
            reason: "account id out of range".to_string(),
        })?;
        let sql = format!(
            r#"
            INSERT INTO {} (user_id, title, message, status, date_added, last_updated)
            VALUES ($1, $2, $3, 'unseen', NOW(), NOW())
            "#,
            self.db.table("user_message")
        );
        let (title, body) = (notification.subject.clone(), notification.body.clone());
        self.db
            .run(|pool| async move {
                sqlx::query(&sql)
                    .bind(user_id)
                    .bind(title)
                    .bind(body)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            })
            .map_err(|e| Self::delivery_error(to, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_carry_the_prefix() {
        let db = PgDatabase::new("postgres://localhost/mail", "mw_", Duration::from_secs(1)).unwrap();
        assert_eq!(db.table("bounce_server"), "mw_bounce_server");
        assert!(!db.is_connected());
    }

    #[test]
    fn hostile_prefix_is_rejected() {
        let err = PgDatabase::new("postgres://localhost/mail", "x; DROP", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn endpoint_rows_map_host_literals() {
        let endpoint = endpoint_from_row((
            4,
            "imap.example.com".to_string(),
            "bounces".to_string(),
            "cron-running".to_string(),
        ))
        .unwrap();
        assert_eq!(endpoint.id, EndpointId::new(4));
        assert_eq!(endpoint.status, EndpointStatus::Running);

        assert!(endpoint_from_row((-1, String::new(), String::new(), "active".to_string())).is_err());
    }

    #[test]
    fn closing_gate_without_pool_is_harmless() {
        let db = Arc::new(
            PgDatabase::new("postgres://localhost/mail", "mw_", Duration::from_secs(1)).unwrap(),
        );
        let gate = PgConnectivityGate::new(db.clone());
        gate.set_active(false);
        gate.set_active(true);
        assert!(!db.is_connected());
    }
}
