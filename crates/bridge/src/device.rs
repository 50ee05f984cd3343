//! The simulated device as exported over USB/IP

use crate::config::DeviceSettings;
use protocol::{ExportedDevice, OpReply, UsbIpDevice, UsbIpInterface};
use tracing::{info, warn};

/// Reply status for an import of a bus id we do not export
const IMPORT_UNKNOWN_BUSID: u32 = 1;

/// Static description of the one device behind the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDevice {
    exported: ExportedDevice,
}

impl SimulatedDevice {
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        let interfaces: Vec<UsbIpInterface> = settings
            .interfaces
            .iter()
            .map(|i| UsbIpInterface {
                class: i.class,
                subclass: i.subclass,
                protocol: i.protocol,
            })
            .collect();

        let device = UsbIpDevice {
            path: settings.path.clone(),
            busid: settings.busid(),
            busnum: settings.busnum,
            devnum: settings.devnum,
            speed: settings.speed,
            id_vendor: settings.vendor_id,
            id_product: settings.product_id,
            bcd_device: settings.bcd_device,
            device_class: settings.device_class,
            device_subclass: settings.device_subclass,
            device_protocol: settings.device_protocol,
            configuration_value: settings.configuration_value,
            num_configurations: settings.num_configurations,
            num_interfaces: interfaces.len().min(u8::MAX as usize) as u8,
        };

        Self {
            exported: ExportedDevice { device, interfaces },
        }
    }

    pub fn busid(&self) -> &str {
        &self.exported.device.busid
    }

    /// Bus address the device is given at session start
    pub fn address(&self) -> u8 {
        (self.exported.device.devnum & 0x7F) as u8
    }

    pub fn usbip_device(&self) -> &UsbIpDevice {
        &self.exported.device
    }

    pub fn exported(&self) -> &ExportedDevice {
        &self.exported
    }

    /// Answer an OP_REQ_IMPORT for `busid`
    pub fn import_reply(&self, busid: &str) -> OpReply {
        if busid == self.busid() {
            info!("Client imported device {}", busid);
            OpReply::import(self.exported.device.clone())
        } else {
            warn!(
                "Import of unknown bus id '{}' (exporting '{}')",
                busid,
                self.busid()
            );
            OpReply::import_failed(IMPORT_UNKNOWN_BUSID)
        }
    }
}
