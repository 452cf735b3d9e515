use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineConfig};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

#[derive(Clone)]
pub struct TenantOptions {
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for TenantOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

/// One tenant's engine and the hub its notifications go to.
#[derive(Clone)]
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub notify: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// sweeper + notification hub. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    options: TenantOptions,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, options: TenantOptions) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        self.open(tenant).map(|t| t.engine)
    }

    /// The hub the tenant's notifications are dispatched to.
    pub fn notify_hub(&self, tenant: &str) -> std::io::Result<Arc<NotifyHub>> {
        self.open(tenant).map(|t| t.notify)
    }

    /// Get or lazily open a tenant.
    pub fn open(&self, tenant: &str) -> std::io::Result<Tenant> {
        if let Some(existing) = self.tenants.get(tenant) {
            return Ok(existing.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; the entry lock
        // makes sure only one engine (and one WAL writer) wins.
        let entry = self.tenants.entry(tenant.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(
            wal_path,
            notify.clone(),
            self.options.engine.clone(),
        )?);

        tokio::spawn(reaper::run_sweeper(
            engine.clone(),
            self.options.sweep_interval,
            self.shutdown.child_token(),
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.options.compact_threshold,
            self.shutdown.child_token(),
        ));

        let opened = Tenant { engine, notify };
        entry.or_insert(opened.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        tracing::info!(tenant = %safe_name, "tenant opened");
        Ok(opened)
    }

    /// Stop every tenant's background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("agenda_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn resource(id: Ulid) -> ResourceInfo {
        ResourceInfo { id, name: None, bookable: true }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, TenantOptions::default());

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same resource id in both tenants
        let rid = Ulid::new();
        eng_a.create_resource(resource(rid)).await.unwrap();
        eng_b.create_resource(resource(rid)).await.unwrap();

        let sid = Ulid::new();
        eng_a
            .create_service(Service { id: sid, name: None, duration_min: 30, eligible_resources: vec![] })
            .await
            .unwrap();

        assert_eq!(eng_a.list_services().len(), 1);
        assert!(eng_b.list_services().is_empty());
        tm.shutdown();
    }

    #[tokio::test]
    async fn notifications_stay_within_their_tenant() {
        let dir = test_data_dir("notify_isolation");
        let tm = TenantManager::new(dir, TenantOptions::default());
        let client = Ulid::new();
        let mut rx_a = tm.notify_hub("tenant_a").unwrap().subscribe(client);
        let mut rx_b = tm.notify_hub("tenant_b").unwrap().subscribe(client);
        assert!(Arc::ptr_eq(&tm.notify_hub("tenant_a").unwrap(), &tm.open("tenant_a").unwrap().notify));

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let rid = Ulid::new();
        eng_a.create_resource(resource(rid)).await.unwrap();
        eng_a.create_schedule(Schedule {
            id: Ulid::new(),
            resource_id: rid,
            effective_from: chrono::NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            effective_to: None,
            timezone: chrono_tz::Tz::UTC,
            entries: vec![ScheduleEntry {
                day_of_week: 1,
                hours: DayHours {
                    start: chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                    end: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    break_window: None,
                },
            }],
            created_at: 0,
        })
        .await
        .unwrap();
        let sid = Ulid::new();
        eng_a
            .create_service(Service { id: sid, name: None, duration_min: 30, eligible_resources: vec![] })
            .await
            .unwrap();
        eng_a
            .create_booking(crate::engine::BookingRequest {
                id: Ulid::new(),
                resource_id: rid,
                service_id: sid,
                // 2030-01-07 08:00 UTC, a Monday
                start: 1_894_003_200_000,
                client_id: client,
                subject_id: None,
                notes: None,
            })
            .await
            .unwrap();

        assert_eq!(rx_a.try_recv().unwrap().kind, crate::notify::TemplateKind::BookingConfirmed);
        assert!(rx_b.try_recv().is_err());
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), TenantOptions::default());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, TenantOptions::default());

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), TenantOptions::default());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
        tm.shutdown();
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, TenantOptions::default());

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, TenantOptions::default());

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
        tm.shutdown();
    }
}
