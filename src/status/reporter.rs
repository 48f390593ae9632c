//! Status snapshots

use super::diagnostics::{detect_gpu, disk_free_gb, GpuInfo};
use crate::bridge::{ConnectionState, SharedConnectionState};
use crate::config::BridgeConfig;
use crate::models::installed_models;
use crate::supervisor::{ObservedState, ProcessSupervisor, SupervisedProcess};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Inputs for system facts
#[derive(Debug, Clone)]
pub struct FactsConfig {
    pub machine_name: String,
    pub models_dir: PathBuf,
    /// How long gathered facts stay fresh
    pub refresh_interval: Duration,
    pub gpu_detect_timeout: Duration,
}

impl FactsConfig {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            machine_name: config.resolved_machine_name(),
            models_dir: config.default_model_path.clone(),
            refresh_interval: config.heartbeat_interval().max(Duration::from_secs(30)),
            gpu_detect_timeout: Duration::from_secs(3),
        }
    }
}

/// Basic facts about this machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub machine_name: String,
    pub agent_version: String,
    pub os_info: String,
    pub uptime_seconds: u64,
    pub disk_free_gb: Option<f64>,
    pub installed_models: Vec<String>,
    pub gpu_available: bool,
    pub gpu_name: Option<String>,
    /// When the facts were last gathered
    pub facts_refreshed_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub connection: ConnectionState,
    pub processes: Vec<SupervisedProcess>,
    pub system: SystemFacts,
    pub taken_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Processes that exhausted their restart budget
    pub fn failed_processes(&self) -> impl Iterator<Item = &SupervisedProcess> {
        self.processes
            .iter()
            .filter(|p| p.observed_state == ObservedState::Failed)
    }
}

#[derive(Debug, Default)]
struct CachedFacts {
    disk_free_gb: Option<f64>,
    installed_models: Vec<String>,
    gpu: GpuInfo,
    refreshed: Option<Instant>,
    refreshed_at: Option<DateTime<Utc>>,
}

struct Inner {
    connection: SharedConnectionState,
    supervisor: ProcessSupervisor,
    config: FactsConfig,
    started: Instant,
    cached: RwLock<CachedFacts>,
    refreshing: AtomicBool,
}

/// Read-only aggregator of bridge status
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<Inner>,
}

impl StatusReporter {
    pub fn new(
        connection: SharedConnectionState,
        supervisor: ProcessSupervisor,
        config: FactsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                supervisor,
                config,
                started: Instant::now(),
                cached: RwLock::new(CachedFacts::default()),
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Current snapshot.
    ///
    /// Never waits on fact gathering: stale facts are served while a background
    /// refresh runs.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let connection = self.inner.connection.read().await.clone();
        let processes = self.inner.supervisor.list().await;
        let system = self.system_facts().await;
        StatusSnapshot {
            connection,
            processes,
            system,
            taken_at: Utc::now(),
        }
    }

    /// Gather the facts again and wait for them.
    pub async fn refresh_now(&self) {
        let cached = gather_facts(&self.inner.config).await;
        *self.inner.cached.write().await = cached;
    }

    async fn system_facts(&self) -> SystemFacts {
        let config = &self.inner.config;
        let cached = self.inner.cached.read().await;
        let stale = cached
            .refreshed
            .map_or(true, |at| at.elapsed() >= config.refresh_interval);

        let facts = SystemFacts {
            machine_name: config.machine_name.clone(),
            agent_version: crate::VERSION.to_string(),
            os_info: os_info(),
            uptime_seconds: self.inner.started.elapsed().as_secs(),
            disk_free_gb: cached.disk_free_gb,
            installed_models: cached.installed_models.clone(),
            gpu_available: cached.gpu.available,
            gpu_name: cached.gpu.name.clone(),
            facts_refreshed_at: cached.refreshed_at,
        };
        drop(cached);

        if stale {
            self.spawn_refresh();
        }
        facts
    }

    fn spawn_refresh(&self) {
        if self
            .inner
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let reporter = self.clone();
        tokio::spawn(async move {
            reporter.refresh_now().await;
            reporter.inner.refreshing.store(false, Ordering::Release);
            tracing::debug!("System facts refreshed");
        });
    }
}

async fn gather_facts(config: &FactsConfig) -> CachedFacts {
    let gpu = detect_gpu(config.gpu_detect_timeout).await;
    let disk_path = if config.models_dir.is_dir() {
        config.models_dir.clone()
    } else {
        dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    };
    CachedFacts {
        disk_free_gb: disk_free_gb(&disk_path),
        installed_models: installed_models(&config.models_dir),
        gpu,
        refreshed: Some(Instant::now()),
        refreshed_at: Some(Utc::now()),
    }
}

fn os_info() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{ConfiguredLauncher, RestartPolicy};

    fn reporter(models_dir: PathBuf) -> (StatusReporter, SharedConnectionState) {
        let connection = ConnectionState::shared();
        let supervisor = ProcessSupervisor::new(
            Arc::new(ConfiguredLauncher::new("true", "true", &models_dir)),
            RestartPolicy::default(),
        );
        let config = FactsConfig {
            machine_name: "rig-1".to_string(),
            models_dir,
            refresh_interval: Duration::from_secs(60),
            gpu_detect_timeout: Duration::from_millis(200),
        };
        (StatusReporter::new(connection.clone(), supervisor, config), connection)
    }

    #[tokio::test]
    async fn test_snapshot_reflects_connection() {
        let dir = tempfile::TempDir::new().unwrap();
        let (reporter, connection) = reporter(dir.path().to_path_buf());

        connection.write().await.record_failure("refused");
        let snapshot = reporter.snapshot().await;

        assert_eq!(snapshot.connection.consecutive_failures, 1);
        assert!(snapshot.processes.is_empty());
        assert_eq!(snapshot.system.machine_name, "rig-1");
        assert_eq!(snapshot.system.agent_version, crate::VERSION);
        assert_eq!(snapshot.failed_processes().count(), 0);
    }

    #[tokio::test]
    async fn test_facts_refreshed_in_background() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("org--model")).unwrap();
        let (reporter, _) = reporter(dir.path().to_path_buf());

        let first = reporter.snapshot().await;
        assert!(first.system.facts_refreshed_at.is_none());

        let mut refreshed = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let snapshot = reporter.snapshot().await;
            if snapshot.system.facts_refreshed_at.is_some() {
                refreshed = Some(snapshot);
                break;
            }
        }
        let snapshot = refreshed.unwrap();
        assert_eq!(snapshot.system.installed_models, vec!["org--model"]);
    }

    #[tokio::test]
    async fn test_refresh_now_updates_facts() {
        let dir = tempfile::TempDir::new().unwrap();
        let (reporter, _) = reporter(dir.path().to_path_buf());
        reporter.refresh_now().await;
        std::fs::create_dir_all(dir.path().join("late--model")).unwrap();

        // Still fresh, so the cached list is served
        let snapshot = reporter.snapshot().await;
        assert!(snapshot.system.facts_refreshed_at.is_some());
        assert!(snapshot.system.installed_models.is_empty());

        reporter.refresh_now().await;
        let snapshot = reporter.snapshot().await;
        assert_eq!(snapshot.system.installed_models, vec!["late--model"]);
    }
}
