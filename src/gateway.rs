//! Gateway assembly
//!
//! Builds the protocol adapters and the OCPP client manager from the loaded
//! configuration, binds device liveness to EVSE fault events, and runs the
//! variable-refresh loop that lifts mapped meter registers into each state
//! machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::device::echonet_lite::EchonetLiteAdapter;
use crate::device::modbus::{ModbusRtuAdapter, ModbusTcpAdapter};
use crate::device::{DeviceAdapter, DeviceProtocol, RegisterAddress, RegisterType};
use crate::error::{GatewayError, Result};
use crate::ocpp::evse::{EvseEvent, EvseStateMachine, METER_VALUE_VARIABLE};
use crate::ocpp::manager::ClientManager;
use crate::ocpp::translator::{DeviceData, MappingTemplate, OcppValue, VariableTranslator};
use crate::ocpp::transport::TungsteniteTransport;

const VARIABLE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// A mapped meter register to keep fresh on one state machine.
struct RefreshBinding {
    machine: EvseStateMachine,
    adapter: Arc<dyn DeviceAdapter>,
    device_id: String,
    address: RegisterAddress,
    translator: Arc<VariableTranslator>,
}

pub struct Gateway {
    config: AppConfig,
    manager: ClientManager,
    echonet: Arc<EchonetLiteAdapter>,
    modbus_tcp: Arc<ModbusTcpAdapter>,
    modbus_rtu: Arc<ModbusRtuAdapter>,
    translators: HashMap<String, Arc<VariableTranslator>>,
    refresh: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Gateway {
    pub fn new(config: AppConfig) -> Result<Self> {
        let transport = Arc::new(TungsteniteTransport::new(config.csms.websocket_config()));
        let manager = ClientManager::new(config.csms.client_config(), transport);

        let templates = config
            .load_templates()
            .map_err(|e| GatewayError::ConfigValidation(e.to_string()))?;
        let translators = templates
            .into_iter()
            .map(|t: MappingTemplate| (t.id.clone(), Arc::new(VariableTranslator::new(t))))
            .collect();

        Ok(Self {
            config,
            manager,
            echonet: Arc::new(EchonetLiteAdapter::new()),
            modbus_tcp: Arc::new(ModbusTcpAdapter::new()),
            modbus_rtu: Arc::new(ModbusRtuAdapter::new()),
            translators,
            refresh: Mutex::new(None),
        })
    }

    pub fn manager(&self) -> &ClientManager {
        &self.manager
    }

    fn adapter_for(&self, protocol: DeviceProtocol) -> Arc<dyn DeviceAdapter> {
        match protocol {
            DeviceProtocol::EchonetLite => self.echonet.clone(),
            DeviceProtocol::ModbusTcp => self.modbus_tcp.clone(),
            DeviceProtocol::ModbusRtu => self.modbus_rtu.clone(),
        }
    }

    /// Register configured devices, start the adapters that have any, wire
    /// the EVSE machines and connect to the CSMS.
    pub async fn start(&self) -> Result<()> {
        info!("starting gateway");

        let mut used = Vec::new();
        for entry in &self.config.devices {
            let adapter = self.adapter_for(entry.address.protocol());
            adapter.add_device(entry.device_info())?;
            if let Some(polling) = &entry.polling {
                match entry.address.protocol() {
                    DeviceProtocol::ModbusTcp => {
                        self.modbus_tcp.set_polling_config(&entry.id, polling.clone())
                    }
                    DeviceProtocol::ModbusRtu => {
                        self.modbus_rtu.set_polling_config(&entry.id, polling.clone())
                    }
                    DeviceProtocol::EchonetLite => {
                        warn!(device_id = %entry.id, "polling config ignored for ECHONET Lite")
                    }
                }
            }
            if !used.contains(&entry.address.protocol()) {
                used.push(entry.address.protocol());
            }
        }

        for protocol in used {
            let adapter = self.adapter_for(protocol);
            adapter.initialize().await?;
            adapter.start().await?;
        }

        let mut bindings = Vec::new();
        for entry in &self.config.evses {
            self.manager.add_evse(entry.evse_id, entry.connector_id)?;
            let machine = self
                .manager
                .evse(entry.evse_id, entry.connector_id)
                .ok_or_else(|| GatewayError::Internal("EVSE vanished after add".into()))?;
            machine.set_meter_value_interval(Duration::from_secs(entry.meter_value_interval_secs));

            let device = self
                .config
                .devices
                .iter()
                .find(|d| d.id == entry.device_id)
                .ok_or_else(|| {
                    GatewayError::ConfigValidation(format!(
                        "EVSE {} references unknown device {}",
                        entry.evse_id, entry.device_id
                    ))
                })?;
            let adapter = self.adapter_for(device.address.protocol());

            // Device liveness drives the fault events.
            {
                let machine = machine.clone();
                adapter.set_status_callback(
                    &device.id,
                    Arc::new(move |device_id: &str, online: bool| {
                        info!(device_id, online, "device status changed");
                        if online {
                            machine.process_event(EvseEvent::FaultCleared);
                        } else {
                            machine.process_event(EvseEvent::FaultDetected);
                        }
                    }),
                )?;
            }

            match self.meter_binding(&machine, adapter, device) {
                Some(binding) => bindings.push(binding),
                None => debug!(
                    device_id = %device.id,
                    "no meter variable mapped, skipping refresh binding"
                ),
            }
        }

        self.spawn_refresh(bindings);
        self.manager.start()?;
        Ok(())
    }

    fn meter_binding(
        &self,
        machine: &EvseStateMachine,
        adapter: Arc<dyn DeviceAdapter>,
        device: &crate::config::DeviceEntry,
    ) -> Option<RefreshBinding> {
        let translator = self.translators.get(&device.template_id)?;
        let mapping = translator.template().variable(METER_VALUE_VARIABLE)?;
        Some(RefreshBinding {
            machine: machine.clone(),
            adapter,
            device_id: device.id.clone(),
            address: mapping.register,
            translator: translator.clone(),
        })
    }

    fn spawn_refresh(&self, bindings: Vec<RefreshBinding>) {
        if bindings.is_empty() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(VARIABLE_REFRESH_INTERVAL) => {}
                }

                for binding in &bindings {
                    if token.is_cancelled() {
                        break;
                    }
                    refresh_one(binding).await;
                }
            }
            debug!("variable refresh task stopped");
        });

        if let Some((old_cancel, old_task)) = self.refresh.lock().replace((cancel, task)) {
            old_cancel.cancel();
            old_task.abort();
        }
    }

    pub async fn stop(&self) {
        info!("stopping gateway");

        if let Some((cancel, task)) = self.refresh.lock().take() {
            cancel.cancel();
            task.abort();
        }

        self.manager.stop().await;
        self.echonet.stop().await;
        self.modbus_tcp.stop().await;
        self.modbus_rtu.stop().await;
    }
}

/// Read one mapped meter register and store the translated value on the
/// machine. The translated value is already in OCPP units, so the stored
/// variable carries no further scale.
async fn refresh_one(binding: &RefreshBinding) {
    let result = binding
        .adapter
        .read_register(&binding.device_id, &binding.address)
        .await;
    if !result.success {
        debug!(
            device_id = %binding.device_id,
            address = %binding.address,
            error = %result.error_message,
            "meter read failed"
        );
        return;
    }

    let data = if binding.address.register_type == RegisterType::Epc {
        DeviceData::EchonetLite(result.value.data)
    } else {
        DeviceData::Modbus(result.value.data)
    };

    match binding.translator.translate_to_ocpp(METER_VALUE_VARIABLE, &data) {
        Ok(value) => {
            let text = match value {
                OcppValue::Bool(b) => b.to_string(),
                OcppValue::Int(i) => i.to_string(),
                OcppValue::Float(f) => f.to_string(),
                OcppValue::Text(s) => s,
            };
            binding
                .machine
                .set_variable(METER_VALUE_VARIABLE, &text, "float64", None, None, None);
        }
        Err(e) => warn!(
            device_id = %binding.device_id,
            error = %e,
            "meter translation failed"
        ),
    }
}
