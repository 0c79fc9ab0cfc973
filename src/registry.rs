use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::algorithms::{AlgorithmConfig, AlgorithmKind, DynAggregator};
use crate::error::{AggregatorError, Result};

// ─── Configuration ───────────────────────────────────────────────

/// Extension of plugin manifest files.
const MANIFEST_EXTENSION: &str = "json";

/// Directory scanned when nothing else is configured.
pub const DEFAULT_PLUGINS_PATH: &str = "/usr/lib/combaine/custom";

/// How long a loaded mapping is served before the directory is re-scanned.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(300);

// ─── Manifest format ─────────────────────────────────────────────

/// One plugin module: the aggregators it registers, by exported name.
///
/// ```json
/// {"aggregators": {"Multimetrics": {"algorithm": "multimetrics", "defaults": {"rps": "no"}}}}
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    aggregators: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    algorithm: AlgorithmKind,
    #[serde(default)]
    defaults: AlgorithmConfig,
}

// ─── Registry entries ────────────────────────────────────────────

/// A registered aggregator: an algorithm plus the module's default config.
#[derive(Debug, Clone)]
pub struct PluginEntry {
    name: String,
    module: String,
    kind: AlgorithmKind,
    defaults: AlgorithmConfig,
}

impl PluginEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn kind(&self) -> AlgorithmKind {
        self.kind
    }

    /// Build the algorithm for one request; request keys override defaults.
    pub fn construct(&self, config: &AlgorithmConfig) -> Result<Box<dyn DynAggregator>> {
        let mut merged = self.defaults.clone();
        merged.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.kind.build(&merged)
    }
}

pub type PluginMap = HashMap<String, Arc<PluginEntry>>;

/// Exported aggregator names start with an uppercase letter.
fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// Module name of a directory entry, if it looks like a plugin manifest.
fn module_name(file_name: &str) -> Option<&str> {
    if file_name.starts_with('_') {
        return None;
    }
    let (stem, extension) = file_name.rsplit_once('.')?;
    (extension == MANIFEST_EXTENSION && !stem.is_empty()).then_some(stem)
}

fn load_module(module: &str, file: &Path) -> Result<Vec<PluginEntry>> {
    let plugin_load = |reason: String| AggregatorError::PluginLoad {
        module: module.to_owned(),
        reason,
    };
    let raw = std::fs::read(file).map_err(|e| plugin_load(e.to_string()))?;
    let manifest: Manifest = serde_json::from_slice(&raw).map_err(|e| plugin_load(e.to_string()))?;

    let mut entries = Vec::with_capacity(manifest.aggregators.len());
    for (name, entry) in manifest.aggregators {
        if !is_exported(&name) {
            tracing::warn!(module, name = %name, "skip aggregator: name must start with an uppercase letter");
            continue;
        }
        entries.push(PluginEntry {
            name,
            module: module.to_owned(),
            kind: entry.algorithm,
            defaults: entry.defaults,
        });
    }
    Ok(entries)
}

/// Scan `path` and load every plugin module in it.
///
/// Only a failure to list the directory is an error; a module that fails
/// to load is logged and left out.
pub fn load(path: &Path) -> std::io::Result<PluginMap> {
    let modules: BTreeSet<String> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(module_name).map(str::to_owned))
        .collect();

    let mut plugins = PluginMap::new();
    for module in modules {
        let file = path.join(format!("{module}.{MANIFEST_EXTENSION}"));
        match load_module(&module, &file) {
            Ok(entries) => {
                tracing::debug!(module = %module, count = entries.len(), "import aggregators");
                for entry in entries {
                    if let Some(previous) = plugins.get(&entry.name) {
                        tracing::warn!(
                            name = %entry.name,
                            previous = %previous.module,
                            module = %module,
                            "aggregator redefined"
                        );
                    }
                    plugins.insert(entry.name.clone(), Arc::new(entry));
                }
            }
            Err(err) => tracing::error!("{err}"),
        }
    }

    let mut names: Vec<&str> = plugins.keys().map(String::as_str).collect();
    names.sort_unstable();
    tracing::info!(path = %path.display(), "available aggregators: {names:?}");
    Ok(plugins)
}

// ─── PluginRegistry ──────────────────────────────────────────────

struct Snapshot {
    plugins: Arc<PluginMap>,
    loaded_at: Instant,
}

/// Process-wide cache of the plugin directory, refreshed on a timer.
///
/// Readers always get a complete mapping: a reload builds the new map
/// off to the side and swaps it in under the write lock.
pub struct PluginRegistry {
    path: PathBuf,
    reload_interval: Duration,
    current: RwLock<Snapshot>,
    reloading: Mutex<()>,
}

impl PluginRegistry {
    pub fn new(path: impl Into<PathBuf>, reload_interval: Duration) -> Self {
        let path = path.into();
        let plugins = load(&path).unwrap_or_else(|e| {
            tracing::error!(path = %path.display(), "unable to read plugin directory: {e}");
            PluginMap::new()
        });
        Self {
            path,
            reload_interval,
            current: RwLock::new(Snapshot {
                plugins: Arc::new(plugins),
                loaded_at: Instant::now(),
            }),
            reloading: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mapping currently served.
    pub fn plugins(&self) -> Arc<PluginMap> {
        Arc::clone(&self.current.read().plugins)
    }

    pub fn get(&self, name: &str) -> Result<Arc<PluginEntry>> {
        self.current
            .read()
            .plugins
            .get(name)
            .cloned()
            .ok_or_else(|| AggregatorError::PluginNotFound(name.to_owned()))
    }

    fn is_stale(&self) -> bool {
        self.current.read().loaded_at.elapsed() >= self.reload_interval
    }

    /// Re-scan the directory if the reload interval has passed.
    ///
    /// Cheap when fresh. Only one caller re-scans at a time; the others
    /// keep using the current mapping meanwhile.
    pub fn maybe_reload(&self) -> Arc<PluginMap> {
        if !self.is_stale() {
            return self.plugins();
        }
        let Some(_guard) = self.reloading.try_lock() else {
            return self.plugins();
        };
        if self.is_stale() {
            self.reload();
        }
        self.plugins()
    }

    /// Unconditionally re-scan. A directory that cannot be listed keeps
    /// the previous mapping until the next interval.
    pub fn reload(&self) {
        let loaded = load(&self.path);
        let mut current = self.current.write();
        current.loaded_at = Instant::now();
        match loaded {
            Ok(plugins) => current.plugins = Arc::new(plugins),
            Err(e) => {
                tracing::error!(path = %self.path.display(), "unable to read plugin directory, keeping previous plugins: {e}");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────
