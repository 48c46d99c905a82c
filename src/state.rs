//! Plugin state snapshot and restore.
//!
//! The snapshot file carries the control-scalar vector plus whatever the
//! plugin's own `state:interface` stores, with property keys and types
//! written as URIs so the file survives across URID tables. Restore while
//! running is refused unless the plugin advertises thread-safe restore.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::host::{HostState, Lv2Instance};
use crate::urid::uris;

// ── C ABI of lv2/state/state.h (not wrapped by the lilv crate) ──

type Lv2StateHandle = *mut c_void;
type Lv2StateStatus = u32;

const LV2_STATE_SUCCESS: Lv2StateStatus = 0;
const LV2_STATE_ERR_NO_PROPERTY: Lv2StateStatus = 5;

type Lv2StateStoreFn = Option<
    unsafe extern "C" fn(
        handle: Lv2StateHandle,
        key: u32,
        value: *const c_void,
        size: usize,
        type_: u32,
        flags: u32,
    ) -> Lv2StateStatus,
>;

type Lv2StateRetrieveFn = Option<
    unsafe extern "C" fn(
        handle: Lv2StateHandle,
        key: u32,
        size: *mut usize,
        type_: *mut u32,
        flags: *mut u32,
    ) -> *const c_void,
>;

#[repr(C)]
pub(crate) struct Lv2StateInterface {
    save: Option<
        unsafe extern "C" fn(
            instance: *mut c_void,
            store: Lv2StateStoreFn,
            handle: Lv2StateHandle,
            flags: u32,
            features: *const *const lv2_raw::LV2Feature,
        ) -> Lv2StateStatus,
    >,
    restore: Option<
        unsafe extern "C" fn(
            instance: *mut c_void,
            retrieve: Lv2StateRetrieveFn,
            handle: Lv2StateHandle,
            flags: u32,
            features: *const *const lv2_raw::LV2Feature,
        ) -> Lv2StateStatus,
    >,
}

// ── Snapshot document ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortValue {
    pub index: u32,
    pub symbol: String,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateProperty {
    pub key_uri: String,
    pub type_uri: String,
    pub flags: u32,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub plugin_uri: String,
    pub port_values: Vec<PortValue>,
    pub properties: Vec<StateProperty>,
}

// ── Callback contexts ──

struct RawProperty {
    key: u32,
    type_: u32,
    flags: u32,
    value: Vec<u8>,
}

struct SaveContext {
    properties: Vec<RawProperty>,
}

struct RestoreContext {
    properties: Vec<RawProperty>,
    by_key: HashMap<u32, usize>,
}

unsafe extern "C" fn store_callback(
    handle: Lv2StateHandle,
    key: u32,
    value: *const c_void,
    size: usize,
    type_: u32,
    flags: u32,
) -> Lv2StateStatus {
    if handle.is_null() || value.is_null() || size == 0 {
        return LV2_STATE_ERR_NO_PROPERTY;
    }
    let ctx = unsafe { &mut *(handle as *mut SaveContext) };
    let bytes = unsafe { std::slice::from_raw_parts(value as *const u8, size) };
    ctx.properties.push(RawProperty {
        key,
        type_,
        flags,
        value: bytes.to_vec(),
    });
    LV2_STATE_SUCCESS
}

unsafe extern "C" fn retrieve_callback(
    handle: Lv2StateHandle,
    key: u32,
    size: *mut usize,
    type_: *mut u32,
    flags: *mut u32,
) -> *const c_void {
    if handle.is_null() {
        return std::ptr::null();
    }
    let ctx = unsafe { &*(handle as *const RestoreContext) };
    let Some(&idx) = ctx.by_key.get(&key) else {
        return std::ptr::null();
    };
    let prop = &ctx.properties[idx];
    unsafe {
        if !size.is_null() {
            *size = prop.value.len();
        }
        if !type_.is_null() {
            *type_ = prop.type_;
        }
        if !flags.is_null() {
            *flags = prop.flags;
        }
    }
    prop.value.as_ptr() as *const c_void
}

impl Lv2Instance {
    fn state_interface(&self) -> Option<&Lv2StateInterface> {
        let active = self.active_instance()?;
        let ptr = unsafe {
            active
                .instance()
                .extension_data::<Lv2StateInterface>(uris::STATE_INTERFACE)?
        };
        Some(unsafe { ptr.as_ref() })
    }

    fn instance_handle(&self) -> *mut c_void {
        self.active_instance()
            .map(|a| a.instance().handle() as *mut c_void)
            .unwrap_or(std::ptr::null_mut())
    }

    /// Capture the current state into a snapshot document.
    pub fn snapshot_state(&self) -> Result<StateSnapshot> {
        if self.state() == HostState::Disposed {
            return Err(HostError::NotReady(self.state()));
        }
        let mut snapshot = StateSnapshot {
            plugin_uri: self.plugin_uri.clone(),
            port_values: self.snapshot_controls(),
            properties: Vec::new(),
        };

        let Some(interface) = self.state_interface() else {
            return Ok(snapshot);
        };
        let Some(save_fn) = interface.save else {
            return Ok(snapshot);
        };

        let mut ctx = SaveContext {
            properties: Vec::new(),
        };
        let feature_ptrs = self.features.raw_features();
        let status = unsafe {
            save_fn(
                self.instance_handle(),
                Some(store_callback),
                &mut ctx as *mut SaveContext as Lv2StateHandle,
                0,
                feature_ptrs.as_ptr(),
            )
        };
        if status != LV2_STATE_SUCCESS {
            return Err(HostError::State(format!(
                "plugin save returned status {status}"
            )));
        }

        snapshot.properties = ctx
            .properties
            .into_iter()
            .filter_map(|p| {
                Some(StateProperty {
                    key_uri: self.mapper.unmap(p.key)?,
                    type_uri: self.mapper.unmap(p.type_)?,
                    flags: p.flags,
                    value: p.value,
                })
            })
            .collect();
        Ok(snapshot)
    }

    /// Apply a snapshot: control values first, then the plugin's own
    /// properties through its restore entry point. A failed restore leaves
    /// the plugin's opaque state untouched.
    pub fn apply_snapshot(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        if self.state() == HostState::Disposed {
            return Err(HostError::NotReady(self.state()));
        }
        if self.state() == HostState::Running && !self.safe_restore {
            return Err(HostError::NotReady(HostState::Running));
        }
        if snapshot.plugin_uri != self.plugin_uri {
            return Err(HostError::State(format!(
                "snapshot is for {}, this instance hosts {}",
                snapshot.plugin_uri, self.plugin_uri
            )));
        }

        for pv in &snapshot.port_values {
            self.set_control_direct(pv.index, pv.value);
        }

        if snapshot.properties.is_empty() {
            return Ok(());
        }
        let Some(interface) = self.state_interface() else {
            return Ok(());
        };
        let Some(restore_fn) = interface.restore else {
            return Ok(());
        };

        let mut properties = Vec::with_capacity(snapshot.properties.len());
        let mut by_key = HashMap::new();
        for prop in &snapshot.properties {
            let key = self.mapper.map(&prop.key_uri);
            let type_ = self.mapper.map(&prop.type_uri);
            if key == 0 || type_ == 0 {
                continue;
            }
            by_key.insert(key, properties.len());
            properties.push(RawProperty {
                key,
                type_,
                flags: prop.flags,
                value: prop.value.clone(),
            });
        }
        let ctx = RestoreContext { properties, by_key };
        let feature_ptrs = self.features.raw_features();
        let status = unsafe {
            restore_fn(
                self.instance_handle(),
                Some(retrieve_callback),
                &ctx as *const RestoreContext as Lv2StateHandle,
                0,
                feature_ptrs.as_ptr(),
            )
        };
        if status == LV2_STATE_SUCCESS {
            Ok(())
        } else {
            Err(HostError::State(format!(
                "plugin restore returned status {status}"
            )))
        }
    }

    /// Snapshot to a JSON file.
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.snapshot_state()?;
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| HostError::State(e.to_string()))?;
        std::fs::write(path.as_ref(), json)?;
        log::info!(
            "Saved state of {} to {}",
            self.plugin_uri,
            path.as_ref().display()
        );
        Ok(())
    }

    /// Restore from a JSON file written by [`Self::save_state`].
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let snapshot: StateSnapshot =
            serde_json::from_str(&json).map_err(|e| HostError::State(e.to_string()))?;
        self.apply_snapshot(&snapshot)?;
        log::info!(
            "Loaded state of {} from {}",
            self.plugin_uri,
            path.as_ref().display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_document_roundtrips() {
        let snapshot = StateSnapshot {
            plugin_uri: "urn:example:plugin".into(),
            port_values: vec![PortValue {
                index: 4,
                symbol: "gain".into(),
                value: 0.4,
            }],
            properties: vec![StateProperty {
                key_uri: "urn:example:blob".into(),
                type_uri: uris::ATOM_CHUNK.into(),
                flags: 0,
                value: vec![1, 2, 3],
            }],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn store_callback_collects_properties() {
        let mut ctx = SaveContext {
            properties: Vec::new(),
        };
        let payload = [7u8, 8, 9];
        let status = unsafe {
            store_callback(
                &mut ctx as *mut SaveContext as Lv2StateHandle,
                3,
                payload.as_ptr() as *const c_void,
                payload.len(),
                5,
                0,
            )
        };
        assert_eq!(status, LV2_STATE_SUCCESS);
        assert_eq!(ctx.properties.len(), 1);
        assert_eq!(ctx.properties[0].key, 3);
        assert_eq!(ctx.properties[0].type_, 5);
        assert_eq!(ctx.properties[0].value, vec![7, 8, 9]);

        // empty values are refused
        let status = unsafe {
            store_callback(
                &mut ctx as *mut SaveContext as Lv2StateHandle,
                3,
                payload.as_ptr() as *const c_void,
                0,
                5,
                0,
            )
        };
        assert_eq!(status, LV2_STATE_ERR_NO_PROPERTY);
    }

    #[test]
    fn retrieve_callback_finds_by_key() {
        let properties = vec![RawProperty {
            key: 3,
            type_: 5,
            flags: 2,
            value: vec![4, 5, 6],
        }];
        let mut by_key = HashMap::new();
        by_key.insert(3, 0);
        let ctx = RestoreContext { properties, by_key };

        let mut size = 0usize;
        let mut type_ = 0u32;
        let mut flags = 0u32;
        let ptr = unsafe {
            retrieve_callback(
                &ctx as *const RestoreContext as Lv2StateHandle,
                3,
                &mut size,
                &mut type_,
                &mut flags,
            )
        };
        assert!(!ptr.is_null());
        assert_eq!(size, 3);
        assert_eq!(type_, 5);
        assert_eq!(flags, 2);
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, size) };
        assert_eq!(bytes, &[4, 5, 6]);

        let missing = unsafe {
            retrieve_callback(
                &ctx as *const RestoreContext as Lv2StateHandle,
                99,
                &mut size,
                &mut type_,
                &mut flags,
            )
        };
        assert!(missing.is_null());
    }
}
