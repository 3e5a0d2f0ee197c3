use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use log::{debug, warn};

use crate::address::{Address, MessageType};
use crate::frame::Frame;

/// The result of a resolved Status Request: the database delta byte and
/// the light level as a percentage, per the device handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub db_delta: u8,
    pub level_percent: u8,
}

fn percent_from_level(level: u8) -> u8 {
    ((level as u32 * 100 + 127) / 255) as u8
}

struct Expectation {
    tx: oneshot::Sender<DeviceStatus>,
}

#[derive(Default)]
struct DeviceInner {
    category: Option<u8>,
    subcategory: Option<u8>,
    firmware: Option<u8>,
    last_status: Option<DeviceStatus>,
    expectation: Option<Expectation>,
}

/// Everything known about one INSTEON device, plus the single outstanding
/// Status Request expectation a caller may be waiting on.
///
/// Two locks, deliberately: `status_gate` is held by a caller across an
/// entire `send_status_request` round trip (serializing concurrent
/// callers per device), while `inner` guards only synchronous field
/// reads/writes and is never held across an `.await`; the reader task
/// that resolves an expectation must never block on a lock a caller is
/// holding for the whole round trip.
pub struct Device {
    pub address: Address,
    status_gate: futures::lock::Mutex<()>,
    inner: Mutex<DeviceInner>,
}

impl Device {
    fn new(address: Address) -> Self {
        Device {
            address,
            status_gate: futures::lock::Mutex::new(()),
            inner: Mutex::new(DeviceInner::default()),
        }
    }

    /// Serializes concurrent `send_status_request` calls against this
    /// device, per the registry's Open Question resolution: a second
    /// caller waits for the first to finish rather than racing it or
    /// erroring out.
    pub async fn status_gate(&self) -> futures::lock::MutexGuard<'_, ()> {
        self.status_gate.lock().await
    }

    /// Arm a new Status Request expectation. Must be called (by the
    /// caller holding `status_gate`) before the request frame is
    /// submitted, so the reader task has somewhere to deliver an ACK
    /// that races ahead of the echo.
    pub fn arm_status_expectation(&self) -> oneshot::Receiver<DeviceStatus> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().expectation = Some(Expectation { tx });
        rx
    }

    /// Remove and fail any outstanding expectation without resolving it
    /// (the receiver will observe a dropped sender). Used both when the
    /// echo NAKs and when the caller's timeout fires first.
    pub fn clear_expectation(&self) {
        self.inner.lock().unwrap().expectation.take();
    }

    pub fn category(&self) -> Option<u8> {
        self.inner.lock().unwrap().category
    }

    pub fn subcategory(&self) -> Option<u8> {
        self.inner.lock().unwrap().subcategory
    }

    pub fn firmware(&self) -> Option<u8> {
        self.inner.lock().unwrap().firmware
    }

    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.inner.lock().unwrap().last_status
    }

    fn set_identity(&self, category: u8, subcategory: u8, firmware: u8) {
        let mut guard = self.inner.lock().unwrap();
        guard.category = Some(category);
        guard.subcategory = Some(subcategory);
        guard.firmware = Some(firmware);
    }

    fn resolve_status(&self, status: DeviceStatus) {
        let mut guard = self.inner.lock().unwrap();
        guard.last_status = Some(status);
        if let Some(expectation) = guard.expectation.take() {
            let _ = expectation.tx.send(status);
        }
    }

    fn has_pending_status_expectation(&self) -> bool {
        self.inner.lock().unwrap().expectation.is_some()
    }
}

/// Tracks one [`Device`] per address seen on the wire and dispatches
/// inbound frames to the right one.
///
/// Grounded on `original_source`'s `InsteonBasePLM.devices` lazy-creation
/// map and `_InsteonDevice.processReceivedMessage`'s dispatch-by-command
/// shape.
#[derive(Default)]
pub struct Registry {
    devices: Mutex<HashMap<Address, Arc<Device>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { devices: Mutex::new(HashMap::new()) }
    }

    /// Return the device for `address`, creating it on first use.
    pub fn get_or_create(&self, address: Address) -> Arc<Device> {
        let mut guard = self.devices.lock().unwrap();
        guard
            .entry(address)
            .or_insert_with(|| Arc::new(Device::new(address)))
            .clone()
    }

    /// Look up an already-created device without creating one.
    pub fn get(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    /// Handle the PLM's echo of a submitted `SendStandard`/`SendExtended`
    /// frame. A NAK'd Status Request fails its expectation immediately
    /// instead of waiting out the full timeout.
    pub fn on_echo(&self, frame: &Frame) {
        if let Frame::SendEcho { to, cmd1: 0x19, ack: false, .. } = *frame {
            if let Some(device) = self.get(to) {
                warn!("status request to {} was NAK'd by the modem", to);
                device.clear_expectation();
            }
        }
    }

    /// Dispatch an inbound device message, per the handler table: device
    /// identity broadcasts, group on/off notices, Status Request ACKs,
    /// and extended product-data replies.
    pub fn on_receive(&self, frame: &Frame) {
        match *frame {
            Frame::ReceiveStandard { from, to, flags, cmd1, cmd2 } => {
                self.dispatch_standard(from, to, flags.message_type(), cmd1, cmd2);
            }
            Frame::ReceiveExtended { from, to, flags, cmd1, cmd2, ref user_data } => {
                self.dispatch_standard(from, to, flags.message_type(), cmd1, cmd2);
                if cmd1 == 0x03 && cmd2 == 0x00 {
                    let device = self.get_or_create(from);
                    device.set_identity(user_data[4], user_data[5], user_data[6]);
                    let _ = to;
                }
            }
            _ => {}
        }
    }

    fn dispatch_standard(
        &self,
        from: Address,
        to: Address,
        message_type: MessageType,
        cmd1: u8,
        cmd2: u8,
    ) {
        let device = self.get_or_create(from);

        match (message_type, cmd1, cmd2) {
            (MessageType::Broadcast, 0x01, 0x00) => {
                device.set_identity(to.high(), to.middle(), to.low());
            }
            (MessageType::GroupBroadcast, 0x11, 0x00) => {
                debug!("device {} turned group {} on", from, to.low());
            }
            (MessageType::GroupCleanupDirect, 0x11, 0x01) => {
                debug!("device {} group-cleanup on", from);
            }
            (MessageType::GroupBroadcast, 0x13, 0x00) => {
                debug!("device {} turned group {} off", from, to.low());
            }
            (MessageType::GroupCleanupDirect, 0x13, 0x00) | (MessageType::GroupCleanupDirect, 0x13, 0x01) => {
                debug!("device {} group-cleanup off", from);
            }
            (MessageType::AckOfDirect, _, _) if device.has_pending_status_expectation() => {
                let status = DeviceStatus { db_delta: cmd1, level_percent: percent_from_level(cmd2) };
                device.resolve_status(status);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MessageFlags;
    use std::str::FromStr;

    #[test]
    fn percent_rounding_matches_spec_examples() {
        assert_eq!(percent_from_level(0xff), 100);
        assert_eq!(percent_from_level(0x00), 0);
        assert_eq!(percent_from_level(0x80), 50);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = Registry::new();
        let addr = Address::from_str("11.22.33").unwrap();
        let a = registry.get_or_create(addr);
        let b = registry.get_or_create(addr);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn status_ack_resolves_armed_expectation() {
        let registry = Registry::new();
        let addr = Address::from_str("11.22.33").unwrap();
        let device = registry.get_or_create(addr);
        let rx = device.arm_status_expectation();

        let mut flags = MessageFlags::default_direct();
        flags.set_message_type(MessageType::AckOfDirect);
        registry.on_receive(&Frame::ReceiveStandard {
            from: addr,
            to: Address::from_str("00.00.00").unwrap(),
            flags,
            cmd1: 0x00,
            cmd2: 0xff,
        });

        let status = rx.await.unwrap();
        assert_eq!(status, DeviceStatus { db_delta: 0x00, level_percent: 100 });
        assert!(device.last_status().is_some());
    }

    #[test]
    fn nak_on_echo_clears_expectation_without_resolving() {
        let registry = Registry::new();
        let addr = Address::from_str("11.22.33").unwrap();
        let device = registry.get_or_create(addr);
        let mut rx = device.arm_status_expectation();

        registry.on_echo(&Frame::SendEcho {
            to: addr,
            flags: MessageFlags::default_direct(),
            cmd1: 0x19,
            cmd2: 0x00,
            user_data: None,
            ack: false,
        });

        assert_eq!(rx.try_recv(), Err(oneshot::Canceled));
        assert!(!device.has_pending_status_expectation());
    }

    #[test]
    fn broadcast_identity_is_recorded() {
        let registry = Registry::new();
        let addr = Address::from_str("11.22.33").unwrap();

        let mut flags = MessageFlags::default_direct();
        flags.set_message_type(MessageType::Broadcast);
        registry.on_receive(&Frame::ReceiveStandard {
            from: addr,
            to: Address::from_str("01.02.03").unwrap(),
            flags,
            cmd1: 0x01,
            cmd2: 0x00,
        });

        let device = registry.get_or_create(addr);
        assert_eq!(device.category(), Some(0x01));
        assert_eq!(device.subcategory(), Some(0x02));
        assert_eq!(device.firmware(), Some(0x03));
    }
}
