//! Per-connection state machine and command dispatch.
//!
//! Grounded on pyDAPLink's `Connection` (`server/connection.py`): one
//! `Session` per accepted socket, holding the probe lock, the live engine,
//! and dispatching one wire command at a time. `Connection` there keeps
//! `ifs`/`id`/`daplink`/`dapreads`; this keeps the same shape as
//! `selection`/`probe_id`/`engine`, enforcing the explicit state machine
//! the distilled design calls out (pyDAPLink enforces the same ordering
//! implicitly, by which fields happen to be `None`).

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::dap::commands::{DapInfoId, DapInfoValue};
use crate::engine::{DebugEngine, MemSize, ReadValue};
use crate::error::{BrokerError, CommandError, EngineError};
use crate::hid::{HidDevice, ProbeInfo};
use crate::registry::{InterfaceSelection, ProbeId, RegistryTable, SelectionError};
use crate::wire::Frame;

/// `FRESH -> HAS_SELECTION -> HAS_PROBE -> HAS_ENGINE -> HAS_PROBE ->
/// HAS_SELECTION -> CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    HasSelection,
    HasProbe,
    HasEngine,
    Closed,
}

/// Opens a live device of type `D` for a selected probe. Production code
/// wires this to `InterfaceSelection::open`; tests supply one that hands
/// back a pre-programmed mock.
pub type Opener<D> = Arc<dyn Fn(&InterfaceSelection, &ProbeInfo) -> Result<D, BrokerError> + Send + Sync>;

/// One client connection's server-side state. Generic over the HID device
/// type so tests can drive it against the mock transport.
pub struct Session<D> {
    connection_id: u64,
    registry: Arc<RegistryTable>,
    opener: Opener<D>,
    state: State,
    selection: Option<Arc<InterfaceSelection>>,
    probe_id: Option<ProbeId>,
    engine: Option<DebugEngine<D>>,
}

impl<D: HidDevice> Session<D> {
    pub fn new(connection_id: u64, registry: Arc<RegistryTable>, opener: Opener<D>) -> Self {
        Self {
            connection_id,
            registry,
            opener,
            state: State::Fresh,
            selection: None,
            probe_id: None,
            engine: None,
        }
    }

    /// Release the probe lock (if held) and drop the engine. Called on
    /// disconnect.
    pub fn close(&mut self) {
        self.release_probe();
        self.selection = None;
        self.state = State::Closed;
    }

    fn release_probe(&mut self) {
        if let (Some(selection), Some(id)) = (&self.selection, self.probe_id) {
            selection.deselect(id, self.connection_id);
        }
        self.engine = None;
        self.probe_id = None;
    }

    /// Dispatch one request frame, producing the response fields to send
    /// back under `response: <command>`.
    pub fn dispatch(&mut self, command: &str, params: &Map<String, Value>) -> Result<Frame, BrokerError> {
        let fields = self.handle(command, params)?;
        Ok(Frame::response(command, fields))
    }

    fn handle(&mut self, command: &str, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        match command {
            "server_info" => Ok(self.server_info()),
            "board_enumerate" => self.board_enumerate(params),
            "board_select" => self.board_select(params),
            "board_deselect" => {
                self.release_probe();
                if self.state != State::Fresh {
                    self.state = State::HasSelection;
                }
                Ok(Map::new())
            }
            "board_info" => self.board_info(params),
            "dap_init" => self.dap_init(params),
            "dap_uninit" => self.dap_uninit(),
            "dap_clock" => self.dap_clock(params),
            "dap_info" => self.dap_info(params),
            "reset" => self.with_engine(|e| e.reset()).map(|_| Map::new()),
            "reset_assert" => self.with_engine(|e| e.assert_reset(true)).map(|_| Map::new()),
            "reset_deassert" => self.with_engine(|e| e.assert_reset(false)).map(|_| Map::new()),
            "write_dp" => self.write_reg(params, DebugEngine::write_dp),
            "read_dp" => self.read_reg(params, DebugEngine::read_dp),
            "write_ap" => self.write_reg(params, DebugEngine::write_ap),
            "read_ap" => self.read_reg(params, DebugEngine::read_ap),
            "write_8" => self.write_mem(params, MemSize::U8),
            "write_16" => self.write_mem(params, MemSize::U16),
            "write_32" => self.write_mem(params, MemSize::U32),
            "read_8" => self.read_mem(params, MemSize::U8),
            "read_16" => self.read_mem(params, MemSize::U16),
            "read_32" => self.read_mem(params, MemSize::U32),
            "write_block" => self.write_block(params),
            "read_block" => self.read_block(params),
            "flush" => self.flush(),
            other => Err(CommandError::UnknownCommand(other.to_string()).into()),
        }
    }

    fn server_info(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        fields
    }

    fn board_enumerate(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        let vid = field_u16(params, "vid")?;
        let pid = field_u16(params, "pid")?;
        // a session may enumerate more than one (vid, pid) family over its
        // lifetime; only the most recently enumerated selection is held, so
        // release whatever the old one had locked before replacing it.
        self.release_probe();
        self.selection = None;
        let selection = self.registry.get_or_create(vid, pid);
        let listing = selection.enumerate().map_err(|e| BrokerError::Other(e.to_string()))?;
        self.selection = Some(selection);
        self.state = State::HasSelection;

        let ids: Vec<Value> = listing.iter().map(|p| json!(p.id)).collect();
        let mut fields = Map::new();
        fields.insert("ids".to_string(), Value::Array(ids));
        Ok(fields)
    }

    fn board_select(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        if self.state != State::HasSelection {
            return Err(CommandError::NoProbeSelected.into());
        }
        let id = field_u16(params, "id")?;
        let selection = self.selection.clone().ok_or(CommandError::NoProbeSelected)?;
        let info = match selection.select(id, self.connection_id) {
            Ok(info) => info,
            Err(SelectionError::AlreadySelected(_)) => {
                let mut fields = Map::new();
                fields.insert("selected".to_string(), json!(false));
                return Ok(fields);
            }
            Err(SelectionError::UnknownId(id)) => return Err(CommandError::UnknownProbeId(id).into()),
            Err(e) => return Err(BrokerError::Other(e.to_string())),
        };
        let device = (self.opener)(&selection, &info)?;

        self.probe_id = Some(id);
        self.engine = Some(DebugEngine::new(device));
        self.state = State::HasProbe;
        info!(probe = %info.path, "board selected");

        let mut fields = Map::new();
        fields.insert("selected".to_string(), json!(true));
        Ok(fields)
    }

    fn board_info(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        let id = field_u16(params, "id")?;
        let selection = self.selection.as_ref().ok_or(CommandError::NoProbeSelected)?;
        let listing = selection.enumerate().map_err(|e| BrokerError::Other(e.to_string()))?;
        let probe = listing
            .into_iter()
            .find(|p| p.id == id)
            .ok_or(CommandError::UnknownProbeId(id))?;

        let mut fields = Map::new();
        fields.insert("vendor".to_string(), json!(probe.info.manufacturer));
        fields.insert("product".to_string(), json!(probe.info.product));
        fields.insert("serial".to_string(), json!(probe.info.serial));
        Ok(fields)
    }

    fn dap_init(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        if self.state != State::HasProbe {
            return Err(CommandError::EngineNotInitialized.into());
        }
        let frequency = params
            .get("frequency")
            .and_then(Value::as_u64)
            .unwrap_or(1_000_000) as u32;
        let engine = self.engine.as_mut().ok_or(CommandError::EngineNotInitialized)?;
        engine.init(frequency)?;
        self.state = State::HasEngine;
        Ok(Map::new())
    }

    fn dap_uninit(&mut self) -> Result<Map<String, Value>, BrokerError> {
        let engine = self.engine.as_mut().ok_or(CommandError::EngineNotInitialized)?;
        engine.uninit()?;
        self.state = State::HasProbe;
        Ok(Map::new())
    }

    fn dap_clock(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        let frequency = field_u32(params, "frequency")?;
        self.with_engine(|e| e.set_clock(frequency))?;
        Ok(Map::new())
    }

    fn dap_info(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        let name = params
            .get("request")
            .and_then(Value::as_str)
            .ok_or(CommandError::MissingField("request"))?;
        let id = DapInfoId::from_name(name).ok_or_else(|| CommandError::UnknownInfoId(name.to_string()))?;
        let value = self.with_engine(|e| e.info(id))?;

        let mut fields = Map::new();
        fields.insert(
            "result".to_string(),
            match value {
                DapInfoValue::Str(s) => json!(s),
                DapInfoValue::Int(i) => json!(i),
                DapInfoValue::None => Value::Null,
            },
        );
        Ok(fields)
    }

    fn write_reg(
        &mut self,
        params: &Map<String, Value>,
        f: fn(&mut DebugEngine<D>, u32, u32) -> Result<(), EngineError>,
    ) -> Result<Map<String, Value>, BrokerError> {
        let addr = field_u32(params, "addr")?;
        let data = field_u32(params, "data")?;
        self.with_engine(|e| f(e, addr, data))?;
        Ok(Map::new())
    }

    fn read_reg(
        &mut self,
        params: &Map<String, Value>,
        f: fn(&mut DebugEngine<D>, u32) -> Result<(), EngineError>,
    ) -> Result<Map<String, Value>, BrokerError> {
        let addr = field_u32(params, "addr")?;
        self.with_engine(|e| f(e, addr))?;
        Ok(Map::new())
    }

    fn write_mem(&mut self, params: &Map<String, Value>, size: MemSize) -> Result<Map<String, Value>, BrokerError> {
        let addr = field_u32(params, "addr")?;
        let data = field_u32(params, "data")?;
        self.with_engine(|e| e.write_mem(addr, data, size))?;
        Ok(Map::new())
    }

    fn read_mem(&mut self, params: &Map<String, Value>, size: MemSize) -> Result<Map<String, Value>, BrokerError> {
        let addr = field_u32(params, "addr")?;
        self.with_engine(|e| e.read_mem(addr, size))?;
        Ok(Map::new())
    }

    fn write_block(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        let addr = field_u32(params, "addr")?;
        let words = params
            .get("data")
            .and_then(Value::as_array)
            .ok_or(CommandError::MissingField("data"))?
            .iter()
            .map(|v| v.as_u64().map(|n| n as u32).ok_or(CommandError::BadFieldType { field: "data" }))
            .collect::<Result<Vec<u32>, _>>()?;
        self.with_engine(|e| e.write_block_32(addr, &words))?;
        Ok(Map::new())
    }

    fn read_block(&mut self, params: &Map<String, Value>) -> Result<Map<String, Value>, BrokerError> {
        let addr = field_u32(params, "addr")?;
        let count = field_u32(params, "count")? as usize;
        self.with_engine(|e| e.read_block_32(addr, count))?;
        Ok(Map::new())
    }

    /// `flush` omits the `reads` field entirely when nothing was pending,
    /// matching §6.1.
    fn flush(&mut self) -> Result<Map<String, Value>, BrokerError> {
        let results = self.with_engine(|e| e.flush())?;
        let mut fields = Map::new();
        if !results.is_empty() {
            let values: Vec<Value> = results
                .into_iter()
                .map(|r| match r {
                    ReadValue::Word(w) => json!(w),
                    ReadValue::Block(words) => json!(words),
                })
                .collect();
            fields.insert("reads".to_string(), Value::Array(values));
        }
        Ok(fields)
    }

    fn with_engine<R>(&mut self, f: impl FnOnce(&mut DebugEngine<D>) -> Result<R, EngineError>) -> Result<R, BrokerError> {
        let engine = self.engine.as_mut().ok_or(CommandError::EngineNotInitialized)?;
        Ok(f(engine)?)
    }
}

fn field_u16(params: &Map<String, Value>, name: &'static str) -> Result<u16, CommandError> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or(CommandError::MissingField(name))
}

fn field_u32(params: &Map<String, Value>, name: &'static str) -> Result<u32, CommandError> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(CommandError::MissingField(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::mock::MockHidDevice;

    fn test_opener() -> Opener<MockHidDevice> {
        Arc::new(|_sel, _info| Ok(MockHidDevice::default()))
    }

    fn unselected_session() -> Session<MockHidDevice> {
        Session::new(1, Arc::new(RegistryTable::new()), test_opener())
    }

    #[test]
    fn dap_init_before_board_select_is_a_command_error() {
        let mut session = unselected_session();
        let err = session.dap_init(&Map::new()).unwrap_err();
        assert!(matches!(err, BrokerError::Command(CommandError::EngineNotInitialized)));
    }

    #[test]
    fn register_access_before_dap_init_is_a_command_error() {
        let mut session = unselected_session();
        let mut params = Map::new();
        params.insert("addr".to_string(), json!(0x04));
        let err = session.read_reg(&params, DebugEngine::read_dp).unwrap_err();
        assert!(matches!(err, BrokerError::Command(CommandError::EngineNotInitialized)));
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let mut session = unselected_session();
        let err = session.write_mem(&Map::new(), MemSize::U32).unwrap_err();
        assert!(matches!(err, BrokerError::Command(CommandError::MissingField("addr"))));
    }

    #[test]
    fn unknown_dap_info_name_is_rejected_before_touching_the_engine() {
        let mut session = unselected_session();
        let mut params = Map::new();
        params.insert("request".to_string(), json!("NOT_A_REAL_ATTRIBUTE"));
        let err = session.dap_info(&params).unwrap_err();
        assert!(matches!(err, BrokerError::Command(CommandError::UnknownInfoId(_))));
    }

    #[test]
    fn flush_with_no_pending_reads_omits_the_reads_field() {
        let mut session = unselected_session();
        session.engine = Some(DebugEngine::new(MockHidDevice::default()));
        session.state = State::HasEngine;

        let fields = session.flush().unwrap();
        assert!(!fields.contains_key("reads"));
    }

    #[test]
    fn board_select_before_board_enumerate_is_rejected() {
        let mut session = unselected_session();
        let mut params = Map::new();
        params.insert("id".to_string(), json!(0));
        let err = session.board_select(&params).unwrap_err();
        assert!(matches!(err, BrokerError::Command(CommandError::NoProbeSelected)));
    }

    #[test]
    fn board_select_contended_by_another_connection_reports_selected_false_not_an_error() {
        let mut session = unselected_session();
        let registry = RegistryTable::new();
        let selection = registry.get_or_create(0x0d28, 0x0204);
        selection.seed_for_test(
            1,
            ProbeInfo {
                vendor_id: 0x0d28,
                product_id: 0x0204,
                path: "/dev/hidraw0".into(),
                manufacturer: "ARM".into(),
                product: "DAPLink".into(),
                serial: "SN1".into(),
            },
        );
        selection.select(1, 99).unwrap();

        session.selection = Some(selection);
        session.state = State::HasSelection;

        let mut params = Map::new();
        params.insert("id".to_string(), json!(1));
        let fields = session.board_select(&params).unwrap();
        assert_eq!(fields.get("selected"), Some(&json!(false)));
    }

    #[test]
    fn unknown_command_is_reported_by_name() {
        let mut session = unselected_session();
        let err = session.handle("not_a_real_command", &Map::new()).unwrap_err();
        assert!(matches!(err, BrokerError::Command(CommandError::UnknownCommand(ref c)) if c == "not_a_real_command"));
    }
}
