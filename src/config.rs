//! Configuration loading and hot reload.
//!
//! The config directory holds `*.yaml` files whose top-level keys are job
//! names, except two reserved keys: `saltpeter_config` (runtime settings)
//! and `saltpeter_maintenance` (merged across files). The loader exposes an
//! atomic [`ConfigSnapshot`]; readers clone an `Arc` and never block the
//! reload path. A file that fails to parse keeps its last good contents.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::schedule::CronSpec;

pub const CONFIG_KEY: &str = "saltpeter_config";
pub const MAINTENANCE_KEY: &str = "saltpeter_maintenance";

// ---------------------------------------------------------------------------
// Job definitions
// ---------------------------------------------------------------------------

/// How the `targets` expression is interpreted by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[default]
    Glob,
    Pcre,
    List,
    Grain,
    GrainPcre,
    Pillar,
    PillarPcre,
    Nodegroup,
    Range,
    Compound,
    Ipcidr,
}

/// Immutable snapshot of one YAML job entry. Unknown keys (including the
/// historical `soft_timeout`/`hard_timeout` variants) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(skip)]
    pub name: String,

    #[serde(flatten)]
    pub schedule: CronSpec,

    pub command: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub custom_env: HashMap<String, String>,

    pub targets: String,
    #[serde(default)]
    pub target_type: TargetType,
    /// 0 = all matching machines, N = pick N uniformly at random.
    #[serde(default)]
    pub number_of_targets: usize,

    /// Hard-kill timeout in seconds, enforced both by the monitor and by the
    /// agent itself.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_true")]
    pub use_agent: bool,
    #[serde(default)]
    pub agent_path: Option<String>,
    #[serde(default)]
    pub agent_log_level: Option<String>,
    #[serde(default)]
    pub agent_log_dir: Option<String>,
}

fn default_timeout() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Runtime & maintenance
// ---------------------------------------------------------------------------

/// `saltpeter_config`: daemon settings. Ports, bind address and the daemon
/// log directory are read once at startup; the verbose flag is re-applied
/// on reload, and the agent defaults and channel URL are read per dispatch
/// and therefore apply live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub api_port: u16,
    pub channel_port: u16,
    pub bind_addr: String,
    /// URL agents dial back to; must be reachable from the targets.
    pub channel_url: String,
    /// Command line that starts the agent on a target.
    pub agent_path: String,
    pub agent_log_level: Option<String>,
    pub agent_log_dir: Option<String>,
    pub log_dir: String,
    pub verbose: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_port: 8888,
            channel_port: 8889,
            bind_addr: "0.0.0.0".to_string(),
            channel_url: "ws://127.0.0.1:8889/ws".to_string(),
            agent_path: "/usr/local/bin/saltpeter agent".to_string(),
            agent_log_level: None,
            agent_log_dir: None,
            log_dir: "/var/log/saltpeter".to_string(),
            verbose: false,
        }
    }
}

/// `saltpeter_maintenance`, union-merged across all files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Suppresses every new dispatch while set.
    pub global: bool,
    /// Machines subtracted from every target set before dispatch.
    pub machines: BTreeSet<String>,
}

impl MaintenanceConfig {
    fn merge(&mut self, other: MaintenanceConfig) {
        self.global |= other.global;
        self.machines.extend(other.machines);
    }
}

/// Consistent view of the whole config directory.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub jobs: HashMap<String, JobDefinition>,
    pub maintenance: MaintenanceConfig,
    pub runtime: RuntimeConfig,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

pub struct ConfigLoader {
    dir: PathBuf,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    /// Last successfully parsed document per file, reused when a rewrite of
    /// that file is unparseable.
    file_cache: Mutex<HashMap<PathBuf, serde_yaml::Mapping>>,
    /// Jobs already reported as broken, so reloads don't repeat the error.
    bad_jobs: Mutex<BTreeSet<String>>,
}

impl ConfigLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            snapshot: RwLock::new(Arc::new(ConfigSnapshot::default())),
            file_cache: Mutex::new(HashMap::new()),
            bad_jobs: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current snapshot; cheap, never blocks a reload for long.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap())
    }

    /// Read every `*.yaml` file and swap in a fresh snapshot. Fails only
    /// when the directory itself is unreadable (fatal at startup).
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        let entries = self.yaml_files()?;

        let mut docs: Vec<(PathBuf, serde_yaml::Mapping)> = Vec::new();
        {
            let mut cache = self.file_cache.lock().unwrap();
            for path in entries {
                match Self::parse_file(&path) {
                    Ok(doc) => {
                        cache.insert(path.clone(), doc.clone());
                        docs.push((path, doc));
                    }
                    Err(e) => {
                        error!(file = %path.display(), error = %e, "config file skipped");
                        if let Some(last_good) = cache.get(&path) {
                            docs.push((path, last_good.clone()));
                        }
                    }
                }
            }
            // Files that disappeared must not linger in the cache.
            cache.retain(|path, _| path.exists());
        }

        let snapshot = Arc::new(self.assemble(docs));
        *self.snapshot.write().unwrap() = Arc::clone(&snapshot);
        Ok(snapshot)
    }

    /// Parse the directory once and report every problem. Used by
    /// `check-config`; does not touch the live snapshot.
    pub fn validate(&self) -> Result<Vec<ConfigError>> {
        let mut problems = Vec::new();
        for path in self.yaml_files()? {
            let doc = match Self::parse_file(&path) {
                Ok(doc) => doc,
                Err(e) => {
                    problems.push(e);
                    continue;
                }
            };
            for (key, value) in doc {
                let Some(name) = key.as_str() else { continue };
                if name == CONFIG_KEY || name == MAINTENANCE_KEY {
                    continue;
                }
                if let Err(e) = Self::parse_job(name, value) {
                    problems.push(e);
                }
            }
        }
        Ok(problems)
    }

    fn yaml_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("reading config directory {}", self.dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "yaml").unwrap_or(false))
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn parse_file(path: &Path) -> Result<serde_yaml::Mapping, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn parse_job(name: &str, value: serde_yaml::Value) -> Result<JobDefinition, ConfigError> {
        let mut job: JobDefinition =
            serde_yaml::from_value(value).map_err(|e| ConfigError::BadJob {
                job: name.to_string(),
                reason: e.to_string(),
            })?;
        job.name = name.to_string();
        // Reject jobs whose schedule can never compile, so the scheduler
        // loop only ever sees valid expressions.
        job.schedule.compile().map_err(|e| ConfigError::BadJob {
            job: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(job)
    }

    fn assemble(&self, docs: Vec<(PathBuf, serde_yaml::Mapping)>) -> ConfigSnapshot {
        let mut jobs = HashMap::new();
        let mut maintenance = MaintenanceConfig::default();
        let mut runtime = RuntimeConfig::default();
        let mut bad_jobs = self.bad_jobs.lock().unwrap();
        let mut still_bad = BTreeSet::new();

        for (path, doc) in docs {
            for (key, value) in doc {
                let Some(name) = key.as_str().map(str::to_string) else {
                    warn!(file = %path.display(), "ignoring non-string top-level key");
                    continue;
                };
                match name.as_str() {
                    CONFIG_KEY => match serde_yaml::from_value::<RuntimeConfig>(value) {
                        Ok(rc) => runtime = rc,
                        Err(e) => {
                            error!(file = %path.display(), error = %e, "bad saltpeter_config");
                        }
                    },
                    MAINTENANCE_KEY => match serde_yaml::from_value::<MaintenanceConfig>(value) {
                        Ok(mc) => maintenance.merge(mc),
                        Err(e) => {
                            error!(file = %path.display(), error = %e, "bad saltpeter_maintenance");
                        }
                    },
                    _ => match Self::parse_job(&name, value) {
                        Ok(job) => {
                            bad_jobs.remove(&name);
                            jobs.insert(name, job);
                        }
                        Err(e) => {
                            if bad_jobs.insert(name.clone()) {
                                error!(job = %name, error = %e, "job definition skipped");
                            }
                            still_bad.insert(name);
                        }
                    },
                }
            }
        }

        bad_jobs.retain(|name| still_bad.contains(name));
        ConfigSnapshot {
            jobs,
            maintenance,
            runtime,
        }
    }
}

/// Watch the config directory and reload on every change, debounced.
/// `on_reload` runs after each successful reload so live settings (today:
/// the verbose flag) can follow the new snapshot.
///
/// The returned watcher must be kept alive for the lifetime of the daemon.
pub fn spawn_watcher(
    loader: Arc<ConfigLoader>,
    on_reload: impl Fn(&ConfigSnapshot) + Send + 'static,
) -> Result<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if event.is_ok() {
            let _ = tx.send(());
        }
    })
    .context("creating config watcher")?;
    watcher
        .watch(loader.dir(), RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", loader.dir().display()))?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Collapse bursts of events from a single editor save.
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            while rx.try_recv().is_ok() {}
            match loader.reload() {
                Ok(snapshot) => {
                    info!(jobs = snapshot.jobs.len(), "configuration reloaded");
                    on_reload(&snapshot);
                }
                Err(e) => error!(error = %e, "configuration reload failed"),
            }
        }
    });

    Ok(watcher)
}
