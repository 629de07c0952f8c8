use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{error, warn};

/// Méthode de commutation du PSU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchingMethod {
    None,
    Gcode,
    System,
    Gpio,
    Plugin,
}

/// Méthode de sensing de l'état réel du PSU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensingMethod {
    Internal,
    System,
    Gpio,
    Plugin,
}

/// Bias de la broche de sensing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensePull {
    Disabled,
    Up,
    Down,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

/// Snapshot immuable des réglages du daemon, rechargé en bloc.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PsuConfig {
    pub switching_method: SwitchingMethod,
    pub on_gcode_command: String,
    pub off_gcode_command: String,
    pub on_system_command: String,
    pub off_system_command: String,
    pub switching_backend: String,
    pub onoff_gpio_pin: u8,
    pub invert_onoff_gpio_pin: bool,
    pub enable_pseudo_on_off: bool,
    pub pseudo_on_gcode_command: String,
    pub pseudo_off_gcode_command: String,
    /// Délai supplémentaire après commutation on, en secondes
    pub post_on_delay: f64,
    /// Délai avant reconnexion de l'imprimante, en secondes
    pub post_connect_delay: f64,
    pub connect_on_power_on: bool,
    pub disconnect_on_power_off: bool,
    pub sensing_method: SensingMethod,
    pub sense_gpio_pin: u8,
    pub invert_sense_gpio_pin: bool,
    pub sense_gpio_pull: SensePull,
    pub sense_system_command: String,
    pub sensing_backend: String,
    /// Intervalle de la poll loop, en secondes
    pub sense_polling_interval: u64,
    pub auto_on: bool,
    pub auto_on_trigger_gcode_commands: String,
    pub power_off_when_idle: bool,
    /// Durée d'inactivité avant coupure, en minutes
    pub idle_timeout: u64,
    pub idle_ignore_commands: String,
    /// Seuil de refroidissement des heaters, en °C
    pub idle_timeout_wait_temp: f64,
    pub turn_off_when_error: bool,
    pub mqtt: MqttConf,
    pub http_port: u16,

    #[serde(skip)]
    pub auto_on_set: HashSet<String>,
    #[serde(skip)]
    pub idle_ignore_set: HashSet<String>,
}

impl Default for PsuConfig {
    fn default() -> Self {
        Self {
            switching_method: SwitchingMethod::Gcode,
            on_gcode_command: "M80".into(),
            off_gcode_command: "M81".into(),
            on_system_command: String::new(),
            off_system_command: String::new(),
            switching_backend: String::new(),
            onoff_gpio_pin: 0,
            invert_onoff_gpio_pin: false,
            enable_pseudo_on_off: false,
            pseudo_on_gcode_command: "M80".into(),
            pseudo_off_gcode_command: "M81".into(),
            post_on_delay: 0.0,
            post_connect_delay: 0.0,
            connect_on_power_on: false,
            disconnect_on_power_off: false,
            sensing_method: SensingMethod::Internal,
            sense_gpio_pin: 0,
            invert_sense_gpio_pin: false,
            sense_gpio_pull: SensePull::Disabled,
            sense_system_command: String::new(),
            sensing_backend: String::new(),
            sense_polling_interval: 5,
            auto_on: false,
            auto_on_trigger_gcode_commands:
                "G0,G1,G2,G3,G10,G11,G28,G29,G32,M104,M106,M109,M140,M190".into(),
            power_off_when_idle: false,
            idle_timeout: 30,
            idle_ignore_commands: "M105".into(),
            idle_timeout_wait_temp: 50.0,
            turn_off_when_error: false,
            mqtt: MqttConf { host: "localhost".into(), port: 1883 },
            http_port: 5005,
            auto_on_set: HashSet::new(),
            idle_ignore_set: HashSet::new(),
        }
    }
}

impl PsuConfig {
    /// Corrige les conflits de configuration et précalcule les sets de
    /// commandes. Jamais fatal : on dégrade avec un warning.
    pub fn normalize(&mut self) {
        if self.enable_pseudo_on_off && self.switching_method == SwitchingMethod::Gcode {
            warn!("Pseudo On/Off cannot be used in conjunction with GCODE switching. Disabling.");
            self.enable_pseudo_on_off = false;
        }

        self.auto_on_set = split_commands(&self.auto_on_trigger_gcode_commands);
        self.idle_ignore_set = split_commands(&self.idle_ignore_commands);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sense_polling_interval.max(1))
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout * 60)
    }

    /// Délai de stabilisation après commutation on (borne minimale 100ms).
    pub fn settle_after_on(&self) -> Duration {
        Duration::from_secs_f64(0.1 + self.post_on_delay.max(0.0))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.post_connect_delay.max(0.0))
    }
}

fn split_commands(csv: &str) -> HashSet<String> {
    csv.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub async fn load_config() -> PsuConfig {
    let path = std::env::var("PSUCTL_CONFIG").unwrap_or_else(|_| "psuctl.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> PsuConfig {
    let mut cfg = if Path::new(path).exists() {
        let txt = fs::read_to_string(path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            PsuConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                error!("config invalide: {e}");
                PsuConfig::default()
            })
        }
    } else {
        warn!("pas de {path}, usage config par défaut");
        PsuConfig::default()
    };
    cfg.normalize();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_settings() {
        let cfg = PsuConfig::default();
        assert_eq!(cfg.switching_method, SwitchingMethod::Gcode);
        assert_eq!(cfg.on_gcode_command, "M80");
        assert_eq!(cfg.off_gcode_command, "M81");
        assert_eq!(cfg.sensing_method, SensingMethod::Internal);
        assert_eq!(cfg.sense_polling_interval, 5);
        assert_eq!(cfg.idle_timeout, 30);
        assert_eq!(cfg.idle_timeout_wait_temp, 50.0);
        assert!(!cfg.auto_on);
        assert!(!cfg.power_off_when_idle);
    }

    #[test]
    fn pseudo_on_off_conflicts_with_gcode_switching() {
        let mut cfg = PsuConfig::default();
        cfg.enable_pseudo_on_off = true;
        cfg.normalize();
        assert!(!cfg.enable_pseudo_on_off);

        let mut cfg = PsuConfig::default();
        cfg.switching_method = SwitchingMethod::Gpio;
        cfg.enable_pseudo_on_off = true;
        cfg.normalize();
        assert!(cfg.enable_pseudo_on_off);
    }

    #[test]
    fn command_lists_are_parsed_into_sets() {
        let mut cfg = PsuConfig::default();
        cfg.normalize();
        assert!(cfg.auto_on_set.contains("G28"));
        assert!(cfg.auto_on_set.contains("M190"));
        assert!(!cfg.auto_on_set.contains("M105"));
        assert!(cfg.idle_ignore_set.contains("M105"));

        cfg.auto_on_trigger_gcode_commands = " G28 , M104 ,".into();
        cfg.normalize();
        assert_eq!(cfg.auto_on_set.len(), 2);
        assert!(cfg.auto_on_set.contains("M104"));
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let cfg = load_config_from("/nonexistent/psuctl.yaml").await;
        assert_eq!(cfg.switching_method, SwitchingMethod::Gcode);
        assert!(cfg.auto_on_set.contains("G28"));
    }

    #[tokio::test]
    async fn yaml_overrides_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("psuctl.yaml");
        tokio::fs::write(
            &path,
            r#"
switching_method: SYSTEM
on_system_command: "power-strip on"
sensing_method: GPIO
sense_gpio_pin: 17
sense_gpio_pull: up
power_off_when_idle: true
idle_timeout: 10
mqtt:
  host: broker.local
  port: 1884
"#,
        )
        .await
        .unwrap();

        let cfg = load_config_from(path.to_str().unwrap()).await;
        assert_eq!(cfg.switching_method, SwitchingMethod::System);
        assert_eq!(cfg.on_system_command, "power-strip on");
        assert_eq!(cfg.sensing_method, SensingMethod::Gpio);
        assert_eq!(cfg.sense_gpio_pin, 17);
        assert_eq!(cfg.sense_gpio_pull, SensePull::Up);
        assert!(cfg.power_off_when_idle);
        assert_eq!(cfg.idle_timeout_duration(), Duration::from_secs(600));
        assert_eq!(cfg.mqtt.host, "broker.local");
        // champ absent du YAML -> défaut
        assert_eq!(cfg.off_gcode_command, "M81");
    }
}
