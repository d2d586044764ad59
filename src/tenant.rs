use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::{MAX_TENANTS, MAX_TENANT_NAME_LEN};
use crate::notify::NotifyHub;

/// Lazily materialized per-tenant engines, keyed by the database name of
/// the pgwire startup message. Each engine owns one WAL file under
/// `data_dir` and a background compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Strip anything that could escape the data directory. `None` when
/// nothing survives.
fn sanitize(tenant: &str) -> Option<String> {
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!safe.is_empty()).then_some(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Return the tenant's engine, creating it (and replaying its WAL)
    /// on first use.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        let safe_name = sanitize(tenant)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"))?;

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
