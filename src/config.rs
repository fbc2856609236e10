use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::device::modbus::PollingConfig;
use crate::device::{DeviceAddress, DeviceInfo};
use crate::ocpp::manager::OcppClientConfig;
use crate::ocpp::translator::MappingTemplate;
use crate::ocpp::transport::WebSocketConfig;

/// Top-level gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub csms: CsmsConfig,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,

    #[serde(default)]
    pub evses: Vec<EvseEntry>,

    /// Directory of YAML mapping templates.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
}

/// CSMS connection configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CsmsConfig {
    #[validate(url)]
    pub url: String,

    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,

    #[serde(default)]
    pub client_key_path: Option<PathBuf>,

    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,

    #[serde(default = "default_connect_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_reconnect_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_max_reconnect_interval_secs")]
    #[validate(range(min = 1, max = 86400))]
    pub max_reconnect_interval_secs: u64,

    /// 0 = retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_heartbeat_interval_secs")]
    #[validate(range(min = 5, max = 86400))]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_charge_point_model")]
    #[validate(length(min = 1))]
    pub charge_point_model: String,

    #[serde(default = "default_charge_point_vendor")]
    #[validate(length(min = 1))]
    pub charge_point_vendor: String,

    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
}

/// One field device to bridge
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub template_id: String,
    pub address: DeviceAddress,
    #[serde(default)]
    pub polling: Option<PollingConfig>,
}

/// One (EVSE, connector) pair and the device backing it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvseEntry {
    pub evse_id: i32,
    #[serde(default = "default_connector_id")]
    pub connector_id: i32,
    pub device_id: String,
    /// Seconds between meter-value samples while charging.
    #[serde(default = "default_meter_interval_secs")]
    pub meter_value_interval_secs: u64,
}

fn default_verify_peer() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_max_reconnect_interval_secs() -> u64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    300
}

fn default_charge_point_model() -> String {
    "OCPP Gateway".to_string()
}

fn default_charge_point_vendor() -> String {
    "OCPP Gateway".to_string()
}

fn default_firmware_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_connector_id() -> i32 {
    1
}

fn default_meter_interval_secs() -> u64 {
    60
}

impl CsmsConfig {
    pub fn client_config(&self) -> OcppClientConfig {
        OcppClientConfig {
            csms_url: self.url.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            verify_peer: self.verify_peer,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            max_reconnect_interval: Duration::from_secs(self.max_reconnect_interval_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            charge_point_model: self.charge_point_model.clone(),
            charge_point_vendor: self.charge_point_vendor.clone(),
            firmware_version: self.firmware_version.clone(),
        }
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            url: self.url.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            verify_peer: self.verify_peer,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            max_reconnect_interval: Duration::from_secs(self.max_reconnect_interval_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

impl DeviceEntry {
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            name: if self.name.is_empty() {
                self.id.clone()
            } else {
                self.name.clone()
            },
            model: String::new(),
            manufacturer: String::new(),
            firmware_version: String::new(),
            address: self.address.clone(),
            template_id: self.template_id.clone(),
            online: true,
            last_seen: None,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config/gateway.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        // Environment variables override the file (OCPP_GW__CSMS__URL -> csms.url).
        let config: AppConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("OCPP_GW__").split("__"))
            .extract()
            .context("Failed to parse configuration")?;

        config.validated()
    }

    pub fn validated(self) -> Result<Self> {
        self.validate()
            .context("Configuration validation failed")?;

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                anyhow::bail!("duplicate device id: {}", device.id);
            }
            device
                .address
                .validate()
                .with_context(|| format!("device {}", device.id))?;
        }

        for evse in &self.evses {
            if !self.devices.iter().any(|d| d.id == evse.device_id) {
                anyhow::bail!(
                    "EVSE {} connector {} references unknown device {}",
                    evse.evse_id,
                    evse.connector_id,
                    evse.device_id
                );
            }
        }

        Ok(self)
    }

    /// Load every `*.yaml` mapping template under `templates_dir`.
    pub fn load_templates(&self) -> Result<Vec<MappingTemplate>> {
        let Some(dir) = &self.templates_dir else {
            return Ok(Vec::new());
        };

        let mut templates = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read templates dir {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let template: MappingTemplate = serde_yaml::from_str(&text)
                .with_context(|| format!("invalid mapping template {}", path.display()))?;
            templates.push(template);
        }
        Ok(templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Parity;

    fn parse(toml: &str) -> Result<AppConfig> {
        let config: AppConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .context("parse")?;
        config.validated()
    }

    const MINIMAL: &str = r#"
        [csms]
        url = "wss://csms.example.com/ocpp"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert!(config.csms.verify_peer);
        assert_eq!(config.csms.connect_timeout_secs, 10);
        assert_eq!(config.csms.reconnect_interval_secs, 5);
        assert_eq!(config.csms.max_reconnect_interval_secs, 300);
        assert_eq!(config.csms.max_reconnect_attempts, 0);
        assert_eq!(config.csms.heartbeat_interval_secs, 300);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
            [csms]
            url = "wss://csms.example.com/ocpp"
            charge_point_model = "GW-1"
            charge_point_vendor = "Acme"

            [[devices]]
            id = "charger1"
            template_id = "echonet_lite_charger"
            [devices.address]
            protocol = "echonet_lite"
            ip = "192.168.1.30"

            [[devices]]
            id = "meter1"
            template_id = "modbus_meter"
            [devices.address]
            protocol = "modbus_tcp"
            ip = "192.168.1.40"
            unit_id = 1

            [[devices]]
            id = "rtu1"
            template_id = "modbus_meter"
            [devices.address]
            protocol = "modbus_rtu"
            port = "/dev/ttyUSB0"
            baud_rate = 19200
            parity = "E"
            unit_id = 3

            [[evses]]
            evse_id = 1
            device_id = "charger1"
            "#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 3);
        match &config.devices[0].address {
            DeviceAddress::EchonetLite { ip, port } => {
                assert_eq!(ip, "192.168.1.30");
                assert_eq!(*port, 3610);
            }
            other => panic!("unexpected address {other:?}"),
        }
        match &config.devices[2].address {
            DeviceAddress::ModbusRtu {
                baud_rate, parity, ..
            } => {
                assert_eq!(*baud_rate, 19200);
                assert_eq!(*parity, Parity::Even);
            }
            other => panic!("unexpected address {other:?}"),
        }
        assert_eq!(config.evses[0].connector_id, 1);
        assert_eq!(config.evses[0].meter_value_interval_secs, 60);
    }

    #[test]
    fn unknown_parity_rejected() {
        let result = parse(
            r#"
            [csms]
            url = "wss://csms.example.com/ocpp"

            [[devices]]
            id = "rtu1"
            template_id = "t"
            [devices.address]
            protocol = "modbus_rtu"
            port = "/dev/ttyUSB0"
            parity = "X"
            unit_id = 1
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_device_ids_rejected() {
        let result = parse(
            r#"
            [csms]
            url = "wss://csms.example.com/ocpp"

            [[devices]]
            id = "dev"
            template_id = "t"
            [devices.address]
            protocol = "modbus_tcp"
            ip = "10.0.0.1"
            unit_id = 1

            [[devices]]
            id = "dev"
            template_id = "t"
            [devices.address]
            protocol = "modbus_tcp"
            ip = "10.0.0.2"
            unit_id = 1
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn evse_must_reference_known_device() {
        let result = parse(
            r#"
            [csms]
            url = "wss://csms.example.com/ocpp"

            [[evses]]
            evse_id = 1
            device_id = "ghost"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn bad_unit_id_rejected() {
        let result = parse(
            r#"
            [csms]
            url = "wss://csms.example.com/ocpp"

            [[devices]]
            id = "dev"
            template_id = "t"
            [devices.address]
            protocol = "modbus_tcp"
            ip = "10.0.0.1"
            unit_id = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn client_config_conversion() {
        let config = parse(MINIMAL).unwrap();
        let client = config.csms.client_config();
        assert_eq!(client.csms_url, "wss://csms.example.com/ocpp");
        assert_eq!(client.heartbeat_interval, Duration::from_secs(300));
        let ws = config.csms.websocket_config();
        assert_eq!(ws.max_reconnect_interval, Duration::from_secs(300));
    }

    #[test]
    fn mapping_template_yaml_parses() {
        let template: MappingTemplate = serde_yaml::from_str(
            r#"
            id: modbus_meter
            description: basic energy meter
            variables:
              - name: MeterValue.Energy.Active.Import.Register
                data_type: u32
                scale: 0.1
                read_only: true
                register:
                  register_type: holding_register
                  address: 100
                  count: 2
              - name: Status
                data_type: u16
                register:
                  register_type: holding_register
                  address: 0
                enum_map:
                  0: Available
                  1: Charging
            "#,
        )
        .unwrap();

        assert_eq!(template.id, "modbus_meter");
        assert_eq!(template.variables.len(), 2);
        let meter = template
            .variable("MeterValue.Energy.Active.Import.Register")
            .unwrap();
        assert!(meter.read_only);
        assert_eq!(meter.scale, 0.1);
        assert_eq!(meter.register.count, 2);
        let status = template.variable("Status").unwrap();
        assert_eq!(
            status.enum_map.as_ref().unwrap().get(&1).unwrap(),
            "Charging"
        );
    }
}
