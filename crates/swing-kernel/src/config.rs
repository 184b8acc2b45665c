use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a vat worker runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ManagerType {
    /// In the kernel's own thread.
    #[default]
    Local,
    /// On a dedicated OS thread, exchanging deliveries and syscalls over channels.
    Thread,
}

impl FromStr for ManagerType {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ManagerType::Local),
            "thread" => Ok(ManagerType::Thread),
            other => Err(KernelError::Config(format!("unknown manager type '{other}'"))),
        }
    }
}

/// What happens when a replayed delivery makes different syscalls than the
/// transcript recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplayCheck {
    #[default]
    Strict,
    Off,
}

impl FromStr for ReplayCheck {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(ReplayCheck::Strict),
            "off" => Ok(ReplayCheck::Off),
            other => Err(KernelError::Config(format!("unknown replay check '{other}'"))),
        }
    }
}

/// Automatic bring-out-your-dead cadence for one vat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReapInterval {
    Never,
    Deliveries(u64),
}

impl ReapInterval {
    pub fn from_option(deliveries: Option<u64>) -> Self {
        deliveries.map_or(ReapInterval::Never, ReapInterval::Deliveries)
    }

    pub fn deliveries(self) -> Option<u64> {
        match self {
            ReapInterval::Never => None,
            ReapInterval::Deliveries(n) => Some(n),
        }
    }

    pub(crate) fn encode(self) -> String {
        match self {
            ReapInterval::Never => "never".to_string(),
            ReapInterval::Deliveries(n) => n.to_string(),
        }
    }

    pub(crate) fn decode(s: &str) -> Result<Self, KernelError> {
        if s == "never" {
            return Ok(ReapInterval::Never);
        }
        s.parse()
            .map(ReapInterval::Deliveries)
            .map_err(|_| KernelError::corrupt(format!("bad reap interval '{s}'")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub snapshot_initial: u64,
    pub snapshot_interval: u64,
    pub default_reap_interval: Option<u64>,
    pub max_vats_online: usize,
    pub replay_check: ReplayCheck,
    pub default_manager: ManagerType,
    pub default_crank_computron_limit: Option<u64>,
    pub restart_worker_on_snapshot: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            snapshot_initial: 3,
            snapshot_interval: 200,
            default_reap_interval: Some(1000),
            max_vats_online: 50,
            replay_check: ReplayCheck::Strict,
            default_manager: ManagerType::Local,
            default_crank_computron_limit: None,
            restart_worker_on_snapshot: false,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Result<T, KernelError> {
    raw.parse()
        .map_err(|_| KernelError::Config(format!("{name}: cannot parse '{raw}'")))
}

impl KernelConfig {
    /// Defaults overlaid with `SWING_*` environment variables.
    pub fn from_env() -> Result<Self, KernelError> {
        let mut cfg = Self::default();
        if let Some(raw) = env_var("SWING_SNAPSHOT_INITIAL") {
            cfg.snapshot_initial = parse_env("SWING_SNAPSHOT_INITIAL", &raw)?;
        }
        if let Some(raw) = env_var("SWING_SNAPSHOT_INTERVAL") {
            cfg.snapshot_interval = parse_env("SWING_SNAPSHOT_INTERVAL", &raw)?;
        }
        if let Some(raw) = env_var("SWING_REAP_INTERVAL") {
            cfg.default_reap_interval = match raw.as_str() {
                "never" => None,
                _ => Some(parse_env("SWING_REAP_INTERVAL", &raw)?),
            };
        }
        if let Some(raw) = env_var("SWING_MAX_VATS_ONLINE") {
            cfg.max_vats_online = parse_env("SWING_MAX_VATS_ONLINE", &raw)?;
        }
        if let Some(raw) = env_var("SWING_REPLAY_CHECK") {
            cfg.replay_check = raw.parse()?;
        }
        if let Some(raw) = env_var("SWING_MANAGER") {
            cfg.default_manager = raw.parse()?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.snapshot_interval == 0 {
            return Err(KernelError::Config("snapshot_interval must be positive".into()));
        }
        if self.max_vats_online == 0 {
            return Err(KernelError::Config("max_vats_online must be positive".into()));
        }
        if self.default_reap_interval == Some(0) {
            return Err(KernelError::Config("reap interval must be positive".into()));
        }
        Ok(())
    }
}

/// Per-vat options, persisted as JSON under `vN.options`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VatOptions {
    pub name: String,
    /// `None` uses the kernel's default manager.
    pub manager_type: Option<ManagerType>,
    pub enable_pipelining: bool,
    /// `None` uses the kernel's default reap interval.
    pub reap_interval: Option<ReapInterval>,
    pub crank_computron_limit: Option<u64>,
    /// Terminating a critical vat panics the kernel.
    pub critical: bool,
    /// Without a transcript the vat is never evicted, snapshotted or replayed.
    pub use_transcript: bool,
}

impl Default for VatOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            manager_type: None,
            enable_pipelining: false,
            reap_interval: None,
            crank_computron_limit: None,
            critical: false,
            use_transcript: true,
        }
    }
}

impl VatOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_manager(mut self, manager: ManagerType) -> Self {
        self.manager_type = Some(manager);
        self
    }

    pub fn with_pipelining(mut self, enable: bool) -> Self {
        self.enable_pipelining = enable;
        self
    }

    pub fn with_reap_interval(mut self, interval: ReapInterval) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    pub fn with_computron_limit(mut self, limit: u64) -> Self {
        self.crank_computron_limit = Some(limit);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn without_transcript(mut self) -> Self {
        self.use_transcript = false;
        self
    }
}
