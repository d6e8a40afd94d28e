use crate::error::ConfigError;
use crate::models::{Device, DeviceId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub backing: BackingConf,
    pub engine: EngineConfig,
    pub fleet: FleetConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackingMode {
    /// Table PostgREST + relais MQTT des changements.
    Rest,
    /// Table en mémoire, rien d'externe.
    #[default]
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackingConf {
    pub mode: BackingMode,
    pub table: String,
    pub rest: Option<RestConf>,
    pub mqtt: MqttConf,
}

impl Default for BackingConf {
    fn default() -> Self {
        Self {
            mode: BackingMode::Memory,
            table: "bin_updates".into(),
            rest: None,
            mqtt: MqttConf::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RestConf {
    pub url: String, // ex: "https://xyz.supabase.co"
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub topic: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            topic: "bintel/telemetry/changes@v1".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FleetConf {
    /// Remplace la flotte par défaut si non vide.
    pub devices: Vec<Device>,
}

/// Tous les réglages du moteur de réconciliation.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub poll: PollConf,
    pub liveness: LivenessConf,
    pub synthetic: SyntheticConf,
    pub reconnect: ReconnectConf,
    pub probe: ProbeConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollConf {
    pub interval_ms: u64,
    pub limit: usize,
}

impl Default for PollConf {
    fn default() -> Self {
        Self { interval_ms: 5_000, limit: 20 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessConf {
    pub device_id: DeviceId,
    pub tick_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { device_id: 1001, tick_secs: 30, timeout_secs: 120 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyntheticConf {
    pub tick_ms: u64,
    pub update_probability: f64,
    pub delta_min: i32,
    pub delta_max: i32,
    pub servicing_probability: f64,
    /// Niveau retiré lors d'une collecte simulée.
    pub collection_drop: f64,
    pub battery_drain_probability: f64,
    /// Graine RNG fixe ; aléatoire si absente.
    pub seed: Option<u64>,
}

impl Default for SyntheticConf {
    fn default() -> Self {
        Self {
            tick_ms: 5_000,
            update_probability: 0.3,
            delta_min: -2,
            delta_max: 5,
            servicing_probability: 0.02,
            collection_drop: 20.0,
            battery_drain_probability: 0.2,
            seed: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConf {
    pub enabled: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self { enabled: true, initial_backoff_ms: 1_000, max_backoff_ms: 30_000 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeConf {
    /// Insère une ligne d'auto-test après le premier abonnement confirmé.
    pub enabled: bool,
    pub device_id: DeviceId,
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self { enabled: false, device_id: 9999 }
    }
}

impl PollConf {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl LivenessConf {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyntheticConf {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("poll.interval_ms", self.poll.interval_ms),
            ("poll.limit", self.poll.limit as u64),
            ("liveness.tick_secs", self.liveness.tick_secs),
            ("liveness.timeout_secs", self.liveness.timeout_secs),
            ("synthetic.tick_ms", self.synthetic.tick_ms),
            ("reconnect.initial_backoff_ms", self.reconnect.initial_backoff_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        let s = &self.synthetic;
        for (name, value) in [
            ("synthetic.update_probability", s.update_probability),
            ("synthetic.servicing_probability", s.servicing_probability),
            ("synthetic.battery_drain_probability", s.battery_drain_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Probability { name, value });
            }
        }
        if s.delta_min > s.delta_max {
            return Err(ConfigError::InvertedDelta { min: s.delta_min, max: s.delta_max });
        }
        Ok(())
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backing.mode == BackingMode::Rest && self.backing.rest.is_none() {
            return Err(ConfigError::MissingRestUrl);
        }
        self.engine.validate()
    }
}

/// Charge `BINTEL_KERNEL_CONFIG` (`kernel.yaml` par défaut) ; au moindre souci, valeurs par défaut.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("BINTEL_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: impl AsRef<Path>) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return KernelConfig::default();
    }

    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return KernelConfig::default();
        }
    };
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }

    let cfg: KernelConfig = match serde_yaml::from_str(&txt) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            return KernelConfig::default();
        }
    };
    if let Err(e) = cfg.validate() {
        warn!(path = %path.display(), error = %e, "config rejected, using defaults");
        return KernelConfig::default();
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        KernelConfig::default().validate().unwrap();
        let e = EngineConfig::default();
        assert_eq!(e.poll.limit, 20);
        assert_eq!(e.liveness.timeout(), Duration::from_secs(120));
        assert_eq!(e.synthetic.update_probability, 0.3);
    }

    #[test]
    fn rejects_bad_probability_and_delta() {
        let mut e = EngineConfig::default();
        e.synthetic.update_probability = 1.5;
        assert!(matches!(e.validate(), Err(ConfigError::Probability { .. })));

        let mut e = EngineConfig::default();
        e.synthetic.delta_min = 6;
        assert!(matches!(e.validate(), Err(ConfigError::InvertedDelta { .. })));

        let mut e = EngineConfig::default();
        e.poll.interval_ms = 0;
        assert!(matches!(e.validate(), Err(ConfigError::ZeroValue("poll.interval_ms"))));
    }

    #[tokio::test]
    async fn partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "backing:\n  mode: memory\nengine:\n  poll:\n    interval_ms: 3000\n  liveness:\n    device_id: 42"
        )
        .unwrap();

        let cfg = load_config_from(file.path()).await;
        assert_eq!(cfg.engine.poll.interval_ms, 3000);
        assert_eq!(cfg.engine.poll.limit, 20);
        assert_eq!(cfg.engine.liveness.device_id, 42);
        assert_eq!(cfg.engine.liveness.timeout_secs, 120);
    }

    #[tokio::test]
    async fn invalid_yaml_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "engine: [not, a, map]").unwrap();
        let cfg = load_config_from(file.path()).await;
        assert_eq!(cfg.engine.poll.interval_ms, 5_000);
    }

    #[tokio::test]
    async fn rest_mode_without_url_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backing:\n  mode: rest").unwrap();
        let cfg = load_config_from(file.path()).await;
        assert_eq!(cfg.backing.mode, BackingMode::Memory);
    }
}
