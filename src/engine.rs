//! The debug-port engine: batches DP/AP/memory accesses into CMSIS-DAP
//! DAP_Transfer packets, caches `DP.SELECT`/`AP.CSW` to elide redundant
//! writes, and recovers from sticky bus errors.
//!
//! Grounded on pyDAPLink's `DAPLinkCore` (see `daplink/core.py` in the
//! retrieved original sources): the queueing discipline, cache-elision
//! rules, and constants below (`CSW_VALUE`, `COMMANDS_PER_DAP_TRANSFER`,
//! the JTAG-to-SWD magic sequence) all come from that engine.

use tracing::{debug, trace, warn};

use crate::dap::commands::{Codec, DapInfoId, DapInfoValue, TransferItem, WireProtocol};
use crate::error::{CmsisDapError, EngineError, TransferError};
use crate::hid::HidDevice;

pub mod dp {
    pub const ABORT: u32 = 0x00;
    pub const CTRL_STAT: u32 = 0x04;
    pub const SELECT: u32 = 0x08;
    pub const IDCODE: u32 = 0x00;
}

pub mod ap {
    pub const CSW: u32 = 0x00;
    pub const TAR: u32 = 0x04;
    pub const DRW: u32 = 0x0C;
}

const APSEL_MASK: u32 = 0xff00_0000;
const APBANKSEL_MASK: u32 = 0x0000_00f0;

const CSW_SIZE8: u32 = 0x0000_0000;
const CSW_SIZE16: u32 = 0x0000_0001;
const CSW_SIZE32: u32 = 0x0000_0002;
const CSW_SADDRINC: u32 = 0x0000_0010;
const CSW_DBGSTAT: u32 = 0x0000_0040;
const CSW_HPROT: u32 = 0x0200_0000;
const CSW_MSTRDBG: u32 = 0x2000_0000;
const CSW_RESERVED: u32 = 0x0100_0000;
const CSW_VALUE: u32 = CSW_RESERVED | CSW_MSTRDBG | CSW_HPROT | CSW_DBGSTAT | CSW_SADDRINC;

const CTRLSTAT_STICKYORUN: u32 = 0x0000_0002;
const CTRLSTAT_STICKYCMP: u32 = 0x0000_0010;
const CTRLSTAT_STICKYERR: u32 = 0x0000_0020;

/// Number of DAP_Transfer entries queued before an eager flush.
pub const COMMANDS_PER_DAP_TRANSFER: usize = 12;

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSize {
    U8,
    U16,
    U32,
}

impl MemSize {
    fn csw_bits(self) -> u32 {
        match self {
            MemSize::U8 => CSW_SIZE8,
            MemSize::U16 => CSW_SIZE16,
            MemSize::U32 => CSW_SIZE32,
        }
    }

    fn lane_shift(self, addr: u32) -> u32 {
        match self {
            MemSize::U8 => (addr & 0x3) << 3,
            MemSize::U16 => (addr & 0x2) << 3,
            MemSize::U32 => 0,
        }
    }

    fn mask(self) -> u32 {
        match self {
            MemSize::U8 => 0xff,
            MemSize::U16 => 0xffff,
            MemSize::U32 => 0xffff_ffff,
        }
    }
}

/// One pending decoder: how to turn the next N words out of the response
/// queue into a value handed back to the caller. Modeled as a tagged enum
/// rather than a boxed closure so `flush()` stays allocation-light.
#[derive(Debug)]
enum ReadDecoder {
    /// A raw 32-bit DP or AP register read.
    Register,
    /// A sub-word memory read that needs unshifting/masking.
    Mem { size: MemSize, addr: u32 },
    /// A whole aligned 32-bit block, `count` words long.
    Block32 { count: usize },
}

/// The value produced by one decoded read, in the order reads were issued.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadValue {
    Word(u32),
    Block(Vec<u32>),
}

/// `UNINIT -> CONNECTED(mode) -> UNINIT`. No other transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninit,
    Connected(WireProtocol),
}

/// One session's live connection to a probe. Owns the codec, the queues
/// described in the data model, and the DP.SELECT/AP.CSW caches.
pub struct DebugEngine<D> {
    codec: Codec<D>,
    state: State,
    csw_cache: Option<u32>,
    dp_select_cache: Option<u32>,
    request_queue: Vec<TransferItem>,
    decoder_queue: Vec<ReadDecoder>,
    response_words: Vec<u32>,
    pending_block_results: Vec<Vec<u32>>,
}

impl<D: HidDevice> DebugEngine<D> {
    pub fn new(device: D) -> Self {
        Self {
            codec: Codec::new(device),
            state: State::Uninit,
            csw_cache: None,
            dp_select_cache: None,
            request_queue: Vec::new(),
            decoder_queue: Vec::new(),
            response_words: Vec::new(),
            pending_block_results: Vec::new(),
        }
    }

    pub fn mode(&self) -> Option<WireProtocol> {
        match self.state {
            State::Connected(mode) => Some(mode),
            State::Uninit => None,
        }
    }

    fn require_connected(&self) -> Result<(), EngineError> {
        match self.state {
            State::Connected(_) => Ok(()),
            State::Uninit => Err(EngineError::NotConnected),
        }
    }

    /// Flush, connect, negotiate clock/transfer parameters, and bring the
    /// target debug port out of reset. See `daplink/core.py::init`.
    pub fn init(&mut self, frequency_hz: u32) -> Result<(), EngineError> {
        if self.state != State::Uninit {
            return Err(EngineError::AlreadyConnected);
        }
        self.flush()?;

        let mode = self.codec.connect()?;
        self.codec.swj_clock(frequency_hz)?;
        self.codec.transfer_configure(0, 64, 0)?;

        match mode {
            WireProtocol::Swd => {
                self.codec.swd_configure()?;
                self.jtag_to_swd()?;
                self.state = State::Connected(mode);
                self.read_dp(dp::IDCODE)?;
                let idcode = self.flush()?;
                debug!(?idcode, "read IDCODE after JTAG-to-SWD switch");
                self.codec.write_abort(0x1e)?;
            }
            WireProtocol::Jtag => {
                self.codec.jtag_configure(4)?;
                self.codec.swj_sequence(&[0x1f])?;
                let idcode = self.codec.jtag_id_code()?;
                debug!(idcode, "read JTAG IDCODE");
                self.state = State::Connected(mode);
                self.write_dp(
                    dp::CTRL_STAT,
                    CTRLSTAT_STICKYERR | CTRLSTAT_STICKYCMP | CTRLSTAT_STICKYORUN,
                )?;
                self.flush()?;
            }
        }

        self.csw_cache = None;
        self.dp_select_cache = None;
        Ok(())
    }

    fn jtag_to_swd(&mut self) -> Result<(), EngineError> {
        self.codec.swj_sequence(&[0xff; 7])?;
        self.codec.swj_sequence(&[0x9e, 0xe7])?;
        self.codec.swj_sequence(&[0xff; 7])?;
        self.codec.swj_sequence(&[0x00])?;
        Ok(())
    }

    /// Flush then `DAP_Disconnect`.
    pub fn uninit(&mut self) -> Result<(), EngineError> {
        self.flush()?;
        self.codec.disconnect()?;
        self.state = State::Uninit;
        Ok(())
    }

    /// `DAP_Info`, issued synchronously (bypassing the batch).
    pub fn info(&mut self, info: DapInfoId) -> Result<DapInfoValue, EngineError> {
        self.flush()?;
        Ok(self.codec.dap_info(info)?)
    }

    pub fn write_dp(&mut self, addr: u32, value: u32) -> Result<(), EngineError> {
        self.require_connected()?;
        if addr == dp::SELECT {
            if self.dp_select_cache == Some(value) {
                return Ok(());
            }
            self.dp_select_cache = Some(value);
        }
        self.queue_write(false, addr, value)
    }

    pub fn read_dp(&mut self, addr: u32) -> Result<(), EngineError> {
        self.require_connected()?;
        self.queue_read(false, addr, ReadDecoder::Register)
    }

    fn select_ap_bank(&mut self, addr: u32) -> Result<(), EngineError> {
        let select = (addr & APSEL_MASK) | (addr & APBANKSEL_MASK);
        self.write_dp(dp::SELECT, select)
    }

    pub fn write_ap(&mut self, addr: u32, value: u32) -> Result<(), EngineError> {
        self.require_connected()?;
        self.select_ap_bank(addr)?;
        if addr == ap::CSW {
            if self.csw_cache == Some(value) {
                return Ok(());
            }
            self.csw_cache = Some(value);
        }
        self.queue_write(true, addr, value)
    }

    pub fn read_ap(&mut self, addr: u32) -> Result<(), EngineError> {
        self.require_connected()?;
        self.select_ap_bank(addr)?;
        self.queue_read(true, addr, ReadDecoder::Register)
    }

    /// Write `value` (truncated/shifted into the correct lane for `size`)
    /// to target memory at `addr`.
    pub fn write_mem(&mut self, addr: u32, value: u32, size: MemSize) -> Result<(), EngineError> {
        self.require_connected()?;
        self.write_ap(ap::CSW, CSW_VALUE | size.csw_bits())?;
        let shifted = (value & size.mask()) << size.lane_shift(addr);
        self.queue_write(true, ap::TAR, addr)?;
        self.queue_write(true, ap::DRW, shifted)
    }

    /// Read target memory at `addr`; result is queued and produced by the
    /// next `flush()`.
    pub fn read_mem(&mut self, addr: u32, size: MemSize) -> Result<(), EngineError> {
        self.require_connected()?;
        self.write_ap(ap::CSW, CSW_VALUE | size.csw_bits())?;
        self.queue_write(true, ap::TAR, addr)?;
        self.queue_read(true, ap::DRW, ReadDecoder::Mem { size, addr })
    }

    /// Aligned 32-bit block write via `DAP_TransferBlock`, flushed
    /// immediately so it never shares a batch with the 12-command queue.
    pub fn write_block_32(&mut self, addr: u32, words: &[u32]) -> Result<(), EngineError> {
        self.require_connected()?;
        self.write_ap(ap::CSW, CSW_VALUE | CSW_SIZE32)?;
        self.write_ap(ap::TAR, addr)?;
        self.flush_batch()?;

        match self.codec.transfer_block(0, true, false, words.len() as u16, words) {
            Ok(_) => Ok(()),
            Err(CmsisDapError::Transfer(e)) => {
                self.recover_from_transfer_error(e)?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Aligned 32-bit block read of `count` words via `DAP_TransferBlock`.
    pub fn read_block_32(&mut self, addr: u32, count: usize) -> Result<(), EngineError> {
        self.require_connected()?;
        self.write_ap(ap::CSW, CSW_VALUE | CSW_SIZE32)?;
        self.write_ap(ap::TAR, addr)?;
        self.flush_batch()?;

        match self.codec.transfer_block(0, true, true, count as u16, &[]) {
            Ok(words) => {
                self.decoder_queue.push(ReadDecoder::Block32 { count: words.len() });
                self.pending_block_results.push(words);
                Ok(())
            }
            Err(CmsisDapError::Transfer(e)) => {
                self.recover_from_transfer_error(e)?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `nRESET` low for 100ms then high.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.flush_batch()?;
        self.codec.swj_pins(0x00, "nRESET")?;
        std::thread::sleep(std::time::Duration::from_millis(100));
        self.codec.swj_pins(0x80, "nRESET")?;
        std::thread::sleep(std::time::Duration::from_millis(100));
        Ok(())
    }

    /// Drive (or release) `nRESET` without the 100ms timing.
    pub fn assert_reset(&mut self, asserted: bool) -> Result<(), EngineError> {
        self.flush_batch()?;
        if asserted {
            self.codec.swj_pins(0x00, "nRESET")?;
        } else {
            self.codec.swj_pins(0x80, "nRESET")?;
        }
        Ok(())
    }

    pub fn set_clock(&mut self, frequency_hz: u32) -> Result<(), EngineError> {
        self.flush_batch()?;
        self.codec.swj_clock(frequency_hz)?;
        Ok(())
    }

    fn clear_sticky_err(&mut self) -> Result<(), EngineError> {
        match self.state {
            State::Connected(WireProtocol::Swd) => {
                self.codec.write_abort(1 << 2)?;
            }
            State::Connected(WireProtocol::Jtag) => {
                self.queue_write(false, dp::CTRL_STAT, CTRLSTAT_STICKYERR)?;
                self.flush_batch()?;
            }
            State::Uninit => {}
        }
        Ok(())
    }

    fn recover_from_transfer_error(&mut self, err: TransferError) -> Result<(), EngineError> {
        warn!(?err, "transfer error; resetting caches and clearing sticky bits");
        self.request_queue.clear();
        self.decoder_queue.clear();
        self.response_words.clear();
        self.pending_block_results.clear();
        self.csw_cache = None;
        self.dp_select_cache = None;
        self.clear_sticky_err()
    }

    fn queue_write(&mut self, ap: bool, addr: u32, value: u32) -> Result<(), EngineError> {
        let item = TransferItem {
            ap,
            read: false,
            a2: (addr >> 2) & 1 != 0,
            a3: (addr >> 3) & 1 != 0,
            data: Some(value),
        };
        self.enqueue(item)
    }

    fn queue_read(&mut self, ap: bool, addr: u32, decoder: ReadDecoder) -> Result<(), EngineError> {
        let item = TransferItem {
            ap,
            read: true,
            a2: (addr >> 2) & 1 != 0,
            a3: (addr >> 3) & 1 != 0,
            data: None,
        };
        self.decoder_queue.push(decoder);
        self.enqueue(item)
    }

    fn enqueue(&mut self, item: TransferItem) -> Result<(), EngineError> {
        self.request_queue.push(item);
        if self.request_queue.len() >= COMMANDS_PER_DAP_TRANSFER {
            self.flush_batch()?;
        }
        Ok(())
    }

    /// Dispatch the pending batch to the probe without draining decoders.
    fn flush_batch(&mut self) -> Result<(), EngineError> {
        if self.request_queue.is_empty() {
            return Ok(());
        }
        debug_assert!(self.request_queue.len() <= COMMANDS_PER_DAP_TRANSFER);
        trace!(count = self.request_queue.len(), "flushing DAP_Transfer batch");

        let items = std::mem::take(&mut self.request_queue);
        match self.codec.transfer(0, &items) {
            Ok(words) => {
                self.response_words.extend(words);
                Ok(())
            }
            Err(CmsisDapError::Transfer(e)) => {
                self.recover_from_transfer_error(e)?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch any pending batch, then apply every queued decoder in
    /// order, producing one [`ReadValue`] per queued read.
    pub fn flush(&mut self) -> Result<Vec<ReadValue>, EngineError> {
        self.flush_batch()?;

        let decoders = std::mem::take(&mut self.decoder_queue);
        let mut words = std::mem::take(&mut self.response_words).into_iter();
        let mut blocks = std::mem::take(&mut self.pending_block_results).into_iter();
        let mut results = Vec::with_capacity(decoders.len());

        for decoder in decoders {
            match decoder {
                ReadDecoder::Register => {
                    let word = words.next().ok_or(EngineError::NotConnected)?;
                    results.push(ReadValue::Word(word));
                }
                ReadDecoder::Mem { size, addr } => {
                    let raw = words.next().ok_or(EngineError::NotConnected)?;
                    let value = (raw >> size.lane_shift(addr)) & size.mask();
                    results.push(ReadValue::Word(value));
                }
                ReadDecoder::Block32 { count: _ } => {
                    let block = blocks.next().unwrap_or_default();
                    results.push(ReadValue::Block(block));
                }
            }
        }

        Ok(results)
    }
}
