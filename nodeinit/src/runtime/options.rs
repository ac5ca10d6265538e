//! Configuration for the node initialization runtime.

use crate::scheduler::RetryPolicy;
use dirs::home_dir;
use nodeinit_shared::{NodeId, NodeinitError, NodeinitResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default home directory.
pub const NODEINIT_HOME: &str = "NODEINIT_HOME";
const NODEINIT_DIR: &str = ".nodeinit";

// ============================================================================
// Stage Timeouts
// ============================================================================

/// Per-request timeouts, chosen by a stage's reach.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageTimeouts {
    /// Requests answered by the controller itself.
    pub local_ms: u64,
    /// Requests that travel through the mesh to the node.
    pub routed_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            local_ms: 1_000,
            routed_ms: 5_000,
        }
    }
}

impl StageTimeouts {
    pub fn local(&self) -> Duration {
        Duration::from_millis(self.local_ms)
    }

    pub fn routed(&self) -> Duration {
        Duration::from_millis(self.routed_ms)
    }
}

// ============================================================================
// Scheduler Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Nodes that may have a stage in flight at the same time.
    ///
    /// Default: 4
    pub max_in_flight: usize,

    /// Executions allowed per stage before its budget is exhausted.
    ///
    /// Default: 3
    pub max_attempts: u32,

    pub retry: RetryPolicy,
    pub timeouts: StageTimeouts,

    /// Node id of the controller, written into lifelines and return routes.
    pub controller_id: NodeId,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            controller_id: NodeId::new(1),
        }
    }
}

// ============================================================================
// Heal Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealOptions {
    /// Run a heal of every ready node on a timer.
    ///
    /// Default: false
    pub periodic: bool,

    /// Base period between network-wide heals.
    ///
    /// Default: 24h
    pub interval_secs: u64,

    /// Fraction of the interval added or removed at random, in `[0, 1)`.
    ///
    /// Default: 0.1
    pub jitter: f64,
}

impl Default for HealOptions {
    fn default() -> Self {
        Self {
            periodic: false,
            interval_secs: 24 * 60 * 60,
            jitter: 0.1,
        }
    }
}

impl HealOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ============================================================================
// Runtime Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Root for the database and log files.
    ///
    /// Default: `$NODEINIT_HOME`, else `~/.nodeinit`
    pub home_dir: PathBuf,

    /// Keep static data in memory only.
    ///
    /// Default: false
    pub ephemeral: bool,

    pub scheduler: SchedulerOptions,
    pub heal: HealOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let home_dir = std::env::var(NODEINIT_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(NODEINIT_DIR);
                path
            });

        Self {
            home_dir,
            ephemeral: false,
            scheduler: SchedulerOptions::default(),
            heal: HealOptions::default(),
        }
    }
}

impl RuntimeOptions {
    /// Read options from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> NodeinitResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NodeinitError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let options: RuntimeOptions = serde_json::from_str(&raw).map_err(|e| {
            NodeinitError::Config(format!("Invalid options in {}: {}", path.display(), e))
        })?;
        options.sanitize()
    }

    /// Reject values the engine cannot run with.
    pub fn sanitize(self) -> NodeinitResult<Self> {
        let scheduler = &self.scheduler;
        if scheduler.max_in_flight == 0 {
            return Err(NodeinitError::Config(
                "scheduler.max_in_flight must be at least 1".into(),
            ));
        }
        if scheduler.max_attempts == 0 {
            return Err(NodeinitError::Config(
                "scheduler.max_attempts must be at least 1".into(),
            ));
        }
        if scheduler.timeouts.local_ms == 0 || scheduler.timeouts.routed_ms == 0 {
            return Err(NodeinitError::Config("stage timeouts must be non-zero".into()));
        }
        if !scheduler.controller_id.is_assignable() {
            return Err(NodeinitError::Config(format!(
                "controller id {} is reserved",
                scheduler.controller_id
            )));
        }
        scheduler.retry.validate()?;

        if !(0.0..1.0).contains(&self.heal.jitter) {
            return Err(NodeinitError::Config(format!(
                "heal.jitter must be in [0, 1), got {}",
                self.heal.jitter
            )));
        }
        if self.heal.periodic && self.heal.interval_secs == 0 {
            return Err(NodeinitError::Config(
                "heal.interval_secs must be non-zero when periodic heals are on".into(),
            ));
        }
        if !self.ephemeral && !self.home_dir.is_absolute() {
            return Err(NodeinitError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }
        Ok(self)
    }

    pub fn db_path(&self) -> PathBuf {
        self.home_dir.join("db").join("nodeinit.db")
    }
}
