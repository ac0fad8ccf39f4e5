//! The HID transport: fixed-size 64-byte report exchange with a
//! USB-HID-attached CMSIS-DAP probe.
//!
//! Kept as a thin trait over [`hidapi::HidDevice`] so the codec and engine
//! above it can be exercised in tests without real hardware, mirroring the
//! split the teacher crate draws between `CmsisDapDevice` (the transport)
//! and the command encoders that drive it.

use std::time::Duration;

use crate::error::HidError;

/// Size of a CMSIS-DAP HID report payload, not counting the report-id byte.
pub const REPORT_SIZE: usize = 64;

/// Immutable identity of an enumerated probe. Equality is by `path` so a
/// probe replugged into the same port is recognized as the same device.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub path: String,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

impl PartialEq for ProbeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}
impl Eq for ProbeInfo {}

/// Blocking read/write exchange with a single HID report endpoint.
///
/// Implementors must pad writes to [`REPORT_SIZE`] payload bytes (plus a
/// leading report-id byte of `0`), and always return a full 64-byte report
/// from `read`.
pub trait HidDevice: std::fmt::Debug + Send {
    /// Write one HID OUT report. `payload` must be at most [`REPORT_SIZE`]
    /// bytes; it is padded with zeroes.
    fn write_report(&mut self, payload: &[u8]) -> Result<(), HidError>;

    /// Block for one HID IN report, always exactly [`REPORT_SIZE`] bytes.
    fn read_report(&mut self, timeout: Duration) -> Result<[u8; REPORT_SIZE], HidError>;
}

/// Enumerate probes with hidapi, and open one by its enumerated path.
#[derive(Debug)]
pub struct HidBackend {
    api: hidapi::HidApi,
}

impl HidBackend {
    pub fn new() -> Result<Self, HidError> {
        Ok(Self {
            api: hidapi::HidApi::new()?,
        })
    }

    /// List every HID-attached probe matching `(vid, pid)`.
    pub fn enumerate(&mut self, vid: u16, pid: u16) -> Result<Vec<ProbeInfo>, HidError> {
        self.api.refresh_devices()?;
        let probes = self
            .api
            .device_list()
            .filter(|d| d.vendor_id() == vid && d.product_id() == pid)
            .map(|d| ProbeInfo {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                path: d.path().to_string_lossy().into_owned(),
                manufacturer: d.manufacturer_string().unwrap_or_default().to_owned(),
                product: d.product_string().unwrap_or_default().to_owned(),
                serial: d.serial_number().unwrap_or_default().to_owned(),
            })
            .collect();
        Ok(probes)
    }

    /// Open the probe at `path`, returning a live HID handle.
    pub fn open(&self, probe: &ProbeInfo) -> Result<RealHidDevice, HidError> {
        let path = std::ffi::CString::new(probe.path.clone()).map_err(|_| HidError::NotFound {
            vid: probe.vendor_id,
            pid: probe.product_id,
            path: probe.path.clone(),
        })?;
        let handle = self.api.open_path(&path)?;
        Ok(RealHidDevice { handle })
    }
}

/// A live HID handle to a real probe.
#[derive(Debug)]
pub struct RealHidDevice {
    handle: hidapi::HidDevice,
}

impl HidDevice for RealHidDevice {
    fn write_report(&mut self, payload: &[u8]) -> Result<(), HidError> {
        debug_assert!(payload.len() <= REPORT_SIZE);
        let mut buf = [0u8; REPORT_SIZE + 1];
        buf[1..1 + payload.len()].copy_from_slice(payload);
        self.handle.write(&buf)?;
        Ok(())
    }

    fn read_report(&mut self, timeout: Duration) -> Result<[u8; REPORT_SIZE], HidError> {
        let mut buf = [0u8; REPORT_SIZE];
        let timeout_ms = timeout.as_millis().try_into().unwrap_or(i32::MAX);
        self.handle.read_timeout(&mut buf, timeout_ms)?;
        Ok(buf)
    }
}
