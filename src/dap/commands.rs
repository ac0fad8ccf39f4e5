//! Command packet encoding/decoding for the subset of CMSIS-DAP operations
//! the debug-port engine needs: connect/disconnect, SWJ sequencing, transfer
//! configuration, DAP_Transfer / DAP_TransferBlock, and DAP_Info queries.
//!
//! Byte layouts follow the CMSIS-DAP command reference; command IDs and
//! field order are the same ones `probe-rs`'s `cmsisdap` driver uses.

use std::time::Duration;

use crate::error::{Ack, CmsisDapError, TransferError};
use crate::hid::{HidDevice, REPORT_SIZE};

mod id {
    pub const INFO: u8 = 0x00;
    pub const CONNECT: u8 = 0x02;
    pub const DISCONNECT: u8 = 0x03;
    pub const TRANSFER_CONFIGURE: u8 = 0x04;
    pub const TRANSFER: u8 = 0x05;
    pub const TRANSFER_BLOCK: u8 = 0x06;
    pub const WRITE_ABORT: u8 = 0x08;
    pub const RESET_TARGET: u8 = 0x0A;
    pub const SWJ_PINS: u8 = 0x10;
    pub const SWJ_CLOCK: u8 = 0x11;
    pub const SWJ_SEQUENCE: u8 = 0x12;
    pub const SWD_CONFIGURE: u8 = 0x13;
    pub const JTAG_CONFIGURE: u8 = 0x15;
    pub const JTAG_IDCODE: u8 = 0x16;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// The transport-level wire protocol negotiated with `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Swd,
    Jtag,
}

/// A known `DAP_Info` attribute id. The wire protocol names these the way
/// CMSIS-DAP's own documentation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DapInfoId {
    VendorId,
    ProductId,
    SerialNumber,
    FirmwareVersion,
    TargetDeviceVendor,
    TargetDeviceName,
    Capabilities,
    PacketCount,
    PacketSize,
}

impl DapInfoId {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "VENDOR_ID" => DapInfoId::VendorId,
            "PRODUCT_ID" => DapInfoId::ProductId,
            "SERIAL_NUMBER" => DapInfoId::SerialNumber,
            "CMSIS_DAP_FW_VERSION" => DapInfoId::FirmwareVersion,
            "TARGET_DEVICE_VENDOR" => DapInfoId::TargetDeviceVendor,
            "TARGET_DEVICE_NAME" => DapInfoId::TargetDeviceName,
            "CAPABILITIES" => DapInfoId::Capabilities,
            "PACKET_COUNT" => DapInfoId::PacketCount,
            "PACKET_SIZE" => DapInfoId::PacketSize,
            _ => return None,
        })
    }

    fn request_byte(self) -> u8 {
        match self {
            DapInfoId::VendorId => 0x01,
            DapInfoId::ProductId => 0x02,
            DapInfoId::SerialNumber => 0x03,
            DapInfoId::FirmwareVersion => 0x04,
            DapInfoId::TargetDeviceVendor => 0x05,
            DapInfoId::TargetDeviceName => 0x06,
            DapInfoId::Capabilities => 0xF0,
            DapInfoId::PacketCount => 0xFE,
            DapInfoId::PacketSize => 0xFF,
        }
    }

    fn is_string(self) -> bool {
        matches!(
            self,
            DapInfoId::VendorId
                | DapInfoId::ProductId
                | DapInfoId::SerialNumber
                | DapInfoId::FirmwareVersion
                | DapInfoId::TargetDeviceVendor
                | DapInfoId::TargetDeviceName
        )
    }
}

/// The value returned by `dap_info`, mirroring the wire's `str|i32|null`.
#[derive(Debug, Clone, PartialEq)]
pub enum DapInfoValue {
    Str(String),
    Int(i32),
    None,
}

/// A single DAP_Transfer entry: one DP or AP register access.
#[derive(Debug, Clone, Copy)]
pub struct TransferItem {
    pub ap: bool,
    pub read: bool,
    pub a2: bool,
    pub a3: bool,
    pub data: Option<u32>,
}

impl TransferItem {
    fn request_byte(self) -> u8 {
        (self.ap as u8)
            | (self.read as u8) << 1
            | (self.a2 as u8) << 2
            | (self.a3 as u8) << 3
    }
}

fn parse_ack(byte: u8) -> Ack {
    if byte & 0x08 != 0 {
        return Ack::Protocol;
    }
    match byte & 0x07 {
        0x01 => Ack::Ok,
        0x02 => Ack::Wait,
        0x04 => Ack::Fault,
        _ => Ack::NoAck,
    }
}

/// Drives a [`HidDevice`] with the CMSIS-DAP command set.
#[derive(Debug)]
pub struct Codec<D> {
    device: D,
}

impl<D: HidDevice> Codec<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    fn exchange(&mut self, command: u8, payload: &[u8]) -> Result<[u8; REPORT_SIZE], CmsisDapError> {
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(command);
        buf.extend_from_slice(payload);
        self.device.write_report(&buf).map_err(CmsisDapError::Hid)?;
        let report = self
            .device
            .read_report(DEFAULT_TIMEOUT)
            .map_err(CmsisDapError::Hid)?;
        if report[0] != command {
            return Err(CmsisDapError::UnexpectedAnswer {
                command,
                got: report[0],
            });
        }
        Ok(report)
    }

    /// `DAP_Connect`: selects SWD if the probe supports it, else JTAG.
    pub fn connect(&mut self) -> Result<WireProtocol, CmsisDapError> {
        // 0x00 = DEFAULT_PORT: let the probe pick SWD if it can, JTAG otherwise.
        let report = self.exchange(id::CONNECT, &[0x00])?;
        match report[1] {
            0x01 => Ok(WireProtocol::Swd),
            0x02 => Ok(WireProtocol::Jtag),
            _ => Err(CmsisDapError::NoSupportedProtocol),
        }
    }

    /// `DAP_Disconnect`.
    pub fn disconnect(&mut self) -> Result<(), CmsisDapError> {
        self.exchange(id::DISCONNECT, &[])?;
        Ok(())
    }

    /// `DAP_SWJ_Clock`.
    pub fn swj_clock(&mut self, freq_hz: u32) -> Result<(), CmsisDapError> {
        self.exchange(id::SWJ_CLOCK, &freq_hz.to_le_bytes())?;
        Ok(())
    }

    /// `DAP_SWJ_Sequence`. `bits` is sent as given, MSB-first within each byte.
    pub fn swj_sequence(&mut self, bits: &[u8]) -> Result<(), CmsisDapError> {
        debug_assert!(bits.len() <= 32);
        let bit_count = if bits.len() == 32 { 0 } else { (bits.len() * 8) as u8 };
        let mut payload = Vec::with_capacity(1 + bits.len());
        payload.push(bit_count);
        payload.extend_from_slice(bits);
        self.exchange(id::SWJ_SEQUENCE, &payload)?;
        Ok(())
    }

    /// `DAP_SWJ_Pins`. `mask` names the symbolic pin to toggle; returns the
    /// pin state read back.
    pub fn swj_pins(&mut self, output: u8, mask: &str) -> Result<u8, CmsisDapError> {
        let select = pin_mask(mask);
        let mut payload = Vec::with_capacity(6);
        payload.push(output);
        payload.push(select);
        payload.extend_from_slice(&0u32.to_le_bytes());
        let report = self.exchange(id::SWJ_PINS, &payload)?;
        Ok(report[1])
    }

    /// `DAP_TransferConfigure`.
    pub fn transfer_configure(
        &mut self,
        idle_cycles: u8,
        wait_retry: u16,
        match_retry: u16,
    ) -> Result<(), CmsisDapError> {
        let mut payload = Vec::with_capacity(5);
        payload.push(idle_cycles);
        payload.extend_from_slice(&wait_retry.to_le_bytes());
        payload.extend_from_slice(&match_retry.to_le_bytes());
        self.exchange(id::TRANSFER_CONFIGURE, &payload)?;
        Ok(())
    }

    /// `DAP_SWD_Configure` with the default turnaround/data-phase settings.
    pub fn swd_configure(&mut self) -> Result<(), CmsisDapError> {
        self.exchange(id::SWD_CONFIGURE, &[0x00])?;
        Ok(())
    }

    /// `DAP_JTAG_Configure` for a single downstream device.
    pub fn jtag_configure(&mut self, ir_length: u8) -> Result<(), CmsisDapError> {
        self.exchange(id::JTAG_CONFIGURE, &[0x01, ir_length])?;
        Ok(())
    }

    /// `DAP_JTAG_IDCODE` for device index 0.
    pub fn jtag_id_code(&mut self) -> Result<u32, CmsisDapError> {
        let report = self.exchange(id::JTAG_IDCODE, &[0x00])?;
        if report.len() < 5 {
            return Err(CmsisDapError::NotEnoughData);
        }
        Ok(u32::from_le_bytes([report[1], report[2], report[3], report[4]]))
    }

    /// `DAP_WriteABORT`.
    pub fn write_abort(&mut self, mask: u32) -> Result<(), CmsisDapError> {
        self.exchange(id::WRITE_ABORT, &mask.to_le_bytes())?;
        Ok(())
    }

    /// `DAP_ResetTarget`.
    pub fn reset_target(&mut self) -> Result<(), CmsisDapError> {
        self.exchange(id::RESET_TARGET, &[])?;
        Ok(())
    }

    /// `DAP_Info`. Unknown ids return [`DapInfoValue::None`] rather than an
    /// error, mirroring the CMSIS-DAP convention of a zero-length response.
    pub fn dap_info(&mut self, info: DapInfoId) -> Result<DapInfoValue, CmsisDapError> {
        let report = self.exchange(id::INFO, &[info.request_byte()])?;
        let len = report[1] as usize;
        if len == 0 {
            return Ok(DapInfoValue::None);
        }
        let data = &report[2..2 + len];
        if info.is_string() {
            let s = String::from_utf8_lossy(data)
                .trim_end_matches('\0')
                .to_string();
            Ok(DapInfoValue::Str(s))
        } else {
            let value = match len {
                1 => data[0] as i32,
                2 => u16::from_le_bytes([data[0], data[1]]) as i32,
                4 => i32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                _ => return Err(CmsisDapError::NotEnoughData),
            };
            Ok(DapInfoValue::Int(value))
        }
    }

    /// `DAP_Transfer`: a batch of up to 12 DP/AP register accesses.
    /// Returns the values of the reads, in request order.
    pub fn transfer(&mut self, dap_index: u8, items: &[TransferItem]) -> Result<Vec<u32>, CmsisDapError> {
        let mut payload = Vec::with_capacity(2 + items.len() * 5);
        payload.push(dap_index);
        payload.push(items.len() as u8);
        for item in items {
            payload.push(item.request_byte());
            if let Some(data) = item.data {
                payload.extend_from_slice(&data.to_le_bytes());
            }
        }

        let report = self.exchange(id::TRANSFER, &payload)?;
        let executed = report[1] as usize;
        let ack = parse_ack(report[2]);

        let mut reads = Vec::new();
        let mut offset = 3;
        for item in items.iter().take(executed) {
            if item.read {
                if offset + 4 > report.len() {
                    return Err(CmsisDapError::NotEnoughData);
                }
                reads.push(u32::from_le_bytes([
                    report[offset],
                    report[offset + 1],
                    report[offset + 2],
                    report[offset + 3],
                ]));
                offset += 4;
            }
        }

        if executed < items.len() || ack != Ack::Ok {
            return Err(TransferError {
                ack,
                executed,
                requested: items.len(),
            }
            .into());
        }

        Ok(reads)
    }

    /// `DAP_TransferBlock`: a run of same-kind 32-bit accesses sharing one
    /// request byte. `write_words` is empty for a read of `count` words.
    pub fn transfer_block(
        &mut self,
        dap_index: u8,
        ap: bool,
        read: bool,
        count: u16,
        write_words: &[u32],
    ) -> Result<Vec<u32>, CmsisDapError> {
        let request_byte = (ap as u8) | (read as u8) << 1;
        let mut payload = Vec::with_capacity(4 + write_words.len() * 4);
        payload.push(dap_index);
        payload.extend_from_slice(&count.to_le_bytes());
        payload.push(request_byte);
        for word in write_words {
            payload.extend_from_slice(&word.to_le_bytes());
        }

        // DAP_TransferBlock responses can exceed one HID report for large
        // block reads; the real protocol assembles them across multiple USB
        // transactions, but our 64-byte mock/report abstraction keeps this
        // single-report for the sizes this broker batches in one call.
        let report = self.send_block(&payload)?;
        let executed = u16::from_le_bytes([report[1], report[2]]) as usize;
        let ack = parse_ack(report[3]);

        let mut reads = Vec::new();
        if read {
            let mut offset = 4;
            for _ in 0..executed {
                if offset + 4 > report.len() {
                    break;
                }
                reads.push(u32::from_le_bytes([
                    report[offset],
                    report[offset + 1],
                    report[offset + 2],
                    report[offset + 3],
                ]));
                offset += 4;
            }
        }

        if executed < count as usize || ack != Ack::Ok {
            return Err(TransferError {
                ack,
                executed,
                requested: count as usize,
            }
            .into());
        }

        Ok(reads)
    }

    fn send_block(&mut self, payload: &[u8]) -> Result<Vec<u8>, CmsisDapError> {
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(id::TRANSFER_BLOCK);
        buf.extend_from_slice(payload);
        self.device.write_report(&buf).map_err(CmsisDapError::Hid)?;
        let report = self
            .device
            .read_report(DEFAULT_TIMEOUT)
            .map_err(CmsisDapError::Hid)?;
        if report[0] != id::TRANSFER_BLOCK {
            return Err(CmsisDapError::UnexpectedAnswer {
                command: id::TRANSFER_BLOCK,
                got: report[0],
            });
        }
        Ok(report.to_vec())
    }
}

/// Maps a symbolic SWJ pin name to the bit CMSIS-DAP assigns it in the
/// `DAP_SWJ_Pins` mask/output bytes.
fn pin_mask(name: &str) -> u8 {
    match name {
        "nRESET" => 0x80,
        "nTRST" => 0x20,
        "TDO" => 0x08,
        "TDI" => 0x04,
        "SWDIO_TMS" => 0x02,
        "SWCLK_TCK" => 0x01,
        _ => 0x00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::mock::MockHidDevice;

    fn codec_with(responses: &[&[u8]]) -> Codec<MockHidDevice> {
        let mut device = MockHidDevice::default();
        for r in responses {
            device.push_response(r);
        }
        Codec::new(device)
    }

    #[test]
    fn connect_picks_swd() {
        let mut codec = codec_with(&[&[id::CONNECT, 0x01]]);
        assert_eq!(codec.connect().unwrap(), WireProtocol::Swd);
    }

    #[test]
    fn connect_fails_without_a_protocol() {
        let mut codec = codec_with(&[&[id::CONNECT, 0x00]]);
        assert!(codec.connect().is_err());
    }

    #[test]
    fn pin_mask_matches_cmsis_dap_layout() {
        assert_eq!(pin_mask("nRESET"), 0x80);
        assert_eq!(pin_mask("SWCLK_TCK"), 0x01);
    }

    #[test]
    fn transfer_reports_values_in_request_order() {
        // one write (no data in response), one read
        let mut resp = vec![id::TRANSFER, 2, 0x01];
        resp.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let mut codec = codec_with(&[&resp]);

        let items = [
            TransferItem { ap: false, read: false, a2: false, a3: false, data: Some(0) },
            TransferItem { ap: false, read: true, a2: true, a3: false, data: None },
        ];
        let reads = codec.transfer(0, &items).unwrap();
        assert_eq!(reads, vec![0xDEAD_BEEF]);
    }

    #[test]
    fn transfer_raises_on_short_count() {
        let resp = vec![id::TRANSFER, 0, 0x04]; // FAULT, nothing executed
        let mut codec = codec_with(&[&resp]);
        let items = [TransferItem { ap: false, read: false, a2: false, a3: false, data: Some(0) }];
        let err = codec.transfer(0, &items).unwrap_err();
        assert!(matches!(err, CmsisDapError::Transfer(_)));
    }

    #[test]
    fn dap_info_unknown_is_none() {
        let resp = vec![id::INFO, 0];
        let mut codec = codec_with(&[&resp]);
        assert_eq!(codec.dap_info(DapInfoId::TargetDeviceName).unwrap(), DapInfoValue::None);
    }

    #[test]
    fn dap_info_string() {
        let mut resp = vec![id::INFO, 5];
        resp.extend_from_slice(b"ARM\0\0");
        let mut codec = codec_with(&[&resp]);
        assert_eq!(
            codec.dap_info(DapInfoId::VendorId).unwrap(),
            DapInfoValue::Str("ARM".to_string())
        );
    }
}
