//! Process-wide registry of enumerated probes and which session, if any,
//! currently holds each one selected.
//!
//! Grounded on pyDAPLink's `IfSelection` (`server/selection.py`): probes are
//! given small stable integer ids on first enumeration, and a probe can be
//! selected by at most one connection at a time. Unlike the Python original
//! this is an explicit handle a session is constructed with, not module-level
//! global state, so tests can run more than one registry in a process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::hid::{HidBackend, ProbeInfo};

/// A stable handle sessions use to reference "the same probe" across
/// `board_enumerate` calls even as probes are replugged.
pub type ProbeId = u16;

struct Entry {
    info: ProbeInfo,
    /// Set while some connection holds this probe selected.
    owner: Option<u64>,
}

/// Enumerates probes for one `(vendor_id, product_id)` and arbitrates
/// exclusive selection between connections.
///
/// The hidapi backend is opened lazily on first use rather than in the
/// constructor, so a registry can be created (and its selection logic
/// exercised) without a working HID backend present.
pub struct InterfaceSelection {
    vendor_id: u16,
    product_id: u16,
    backend: Mutex<Option<HidBackend>>,
    entries: Mutex<HashMap<ProbeId, Entry>>,
}

/// Returned by `InterfaceSelection::enumerate`: a probe's id, identity, and
/// whether some other connection currently has it selected.
#[derive(Debug, Clone)]
pub struct ProbeListing {
    pub id: ProbeId,
    pub info: ProbeInfo,
    pub selected: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("probe id {0} is not known")]
    UnknownId(ProbeId),
    #[error("probe id {0} is already selected by another connection")]
    AlreadySelected(ProbeId),
    #[error("probe enumeration failed: {0}")]
    Hid(#[from] crate::error::HidError),
}

impl InterfaceSelection {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            backend: Mutex::new(None),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn with_backend<R>(
        &self,
        f: impl FnOnce(&mut HidBackend) -> Result<R, crate::error::HidError>,
    ) -> Result<R, SelectionError> {
        let mut slot = self.backend.lock().unwrap();
        if slot.is_none() {
            *slot = Some(HidBackend::new()?);
        }
        Ok(f(slot.as_mut().expect("just initialized"))?)
    }

    /// Refresh against the live USB-HID device list, assigning a fresh id to
    /// any probe not seen before. Ids are never reused for a different
    /// physical path within the process lifetime, so a client's cached id
    /// stays valid across `board_enumerate` calls.
    pub fn enumerate(&self) -> Result<Vec<ProbeListing>, SelectionError> {
        let (vid, pid) = (self.vendor_id, self.product_id);
        let live = self.with_backend(|b| b.enumerate(vid, pid))?;
        let mut entries = self.entries.lock().unwrap();

        // drop entries for probes that disappeared and are not selected;
        // a selected probe that unplugs stays listed until deselected so
        // its owner's handle does not silently dangle.
        entries.retain(|_, e| e.owner.is_some() || live.iter().any(|p| *p == e.info));

        for probe in &live {
            if entries.values().any(|e| e.info == *probe) {
                continue;
            }
            let id = smallest_unused_id(&entries);
            entries.insert(
                id,
                Entry {
                    info: probe.clone(),
                    owner: None,
                },
            );
        }

        let mut listing: Vec<ProbeListing> = entries
            .iter()
            .map(|(id, e)| ProbeListing {
                id: *id,
                info: e.info.clone(),
                selected: e.owner.is_some(),
            })
            .collect();
        listing.sort_by_key(|p| p.id);
        Ok(listing)
    }

    /// Exclusively select `id` for `connection`. Idempotent if `connection`
    /// already holds it.
    pub fn select(&self, id: ProbeId, connection: u64) -> Result<ProbeInfo, SelectionError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(SelectionError::UnknownId(id))?;
        match entry.owner {
            Some(owner) if owner == connection => {}
            Some(_) => return Err(SelectionError::AlreadySelected(id)),
            None => entry.owner = Some(connection),
        }
        Ok(entry.info.clone())
    }

    /// Release `id` if `connection` holds it. A no-op otherwise, mirroring
    /// the Python original's tolerant deselect.
    pub fn deselect(&self, id: ProbeId, connection: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            if entry.owner == Some(connection) {
                entry.owner = None;
            }
        }
    }

    /// Release every selection held by `connection`, called when its
    /// session closes.
    pub fn release_all(&self, connection: u64) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.owner == Some(connection) {
                entry.owner = None;
            }
        }
    }

    pub fn open(&self, info: &ProbeInfo) -> Result<crate::hid::RealHidDevice, SelectionError> {
        let info = info.clone();
        self.with_backend(|b| b.open(&info))
    }

    /// Insert an entry directly, bypassing `enumerate()`'s HID dependency.
    /// Used by session/server tests that need a selectable probe id without
    /// a real HID backend.
    #[cfg(test)]
    pub(crate) fn seed_for_test(&self, id: ProbeId, info: ProbeInfo) {
        self.entries.lock().unwrap().insert(id, Entry { info, owner: None });
    }
}

/// The smallest id in `1..=0xFFFF` not already present in `entries`. Ids are
/// never reissued while still allocated, but a released id becomes
/// available again the next time a probe is discovered.
fn smallest_unused_id(entries: &HashMap<ProbeId, Entry>) -> ProbeId {
    (1..=ProbeId::MAX).find(|id| !entries.contains_key(id)).expect("probe id space exhausted")
}

/// A process-wide set of registries, one per distinct `(vendor_id,
/// product_id)` a session has asked about. Shared between sessions via
/// `Arc` so one registry instance arbitrates all connections for a given
/// probe family.
#[derive(Clone, Default)]
pub struct RegistryTable {
    inner: Arc<Mutex<HashMap<(u16, u16), Arc<InterfaceSelection>>>>,
}

impl RegistryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, vendor_id: u16, product_id: u16) -> Arc<InterfaceSelection> {
        let mut table = self.inner.lock().unwrap();
        table
            .entry((vendor_id, product_id))
            .or_insert_with(|| Arc::new(InterfaceSelection::new(vendor_id, product_id)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection() -> InterfaceSelection {
        InterfaceSelection::new(0x1234, 0x5678)
    }

    fn probe(path: &str) -> ProbeInfo {
        ProbeInfo {
            vendor_id: 0x1234,
            product_id: 0x5678,
            path: path.to_string(),
            manufacturer: "ACME".into(),
            product: "Probe".into(),
            serial: "SN1".into(),
        }
    }

    fn seed(sel: &InterfaceSelection, id: ProbeId, info: ProbeInfo) {
        sel.seed_for_test(id, info);
    }

    #[test]
    fn select_then_select_again_by_same_connection_is_idempotent() {
        let sel = selection();
        seed(&sel, 0, probe("/dev/hidraw0"));
        sel.select(0, 7).unwrap();
        assert!(sel.select(0, 7).is_ok());
    }

    #[test]
    fn select_by_another_connection_is_rejected() {
        let sel = selection();
        seed(&sel, 0, probe("/dev/hidraw0"));
        sel.select(0, 7).unwrap();
        let err = sel.select(0, 9).unwrap_err();
        assert!(matches!(err, SelectionError::AlreadySelected(0)));
    }

    #[test]
    fn deselect_then_select_by_a_different_connection_succeeds() {
        let sel = selection();
        seed(&sel, 0, probe("/dev/hidraw0"));
        sel.select(0, 7).unwrap();
        sel.deselect(0, 7);
        assert!(sel.select(0, 9).is_ok());
    }

    #[test]
    fn release_all_frees_every_selection_held_by_a_connection() {
        let sel = selection();
        seed(&sel, 0, probe("/dev/hidraw0"));
        seed(&sel, 1, probe("/dev/hidraw1"));
        sel.select(0, 7).unwrap();
        sel.select(1, 7).unwrap();
        sel.release_all(7);
        assert!(sel.select(0, 9).is_ok());
        assert!(sel.select(1, 9).is_ok());
    }

    #[test]
    fn unknown_id_is_an_error() {
        let sel = selection();
        let err = sel.select(42, 1).unwrap_err();
        assert!(matches!(err, SelectionError::UnknownId(42)));
    }

    #[test]
    fn smallest_unused_id_starts_at_one() {
        assert_eq!(smallest_unused_id(&HashMap::new()), 1);
    }

    #[test]
    fn smallest_unused_id_fills_a_gap_left_by_a_released_id() {
        let mut entries = HashMap::new();
        entries.insert(1, Entry { info: probe("/dev/hidraw0"), owner: None });
        entries.insert(3, Entry { info: probe("/dev/hidraw1"), owner: None });
        assert_eq!(smallest_unused_id(&entries), 2);
    }
}
