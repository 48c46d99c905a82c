//! URI ↔ URID mapping and the well-known URI set.
//!
//! The table is append-only: IDs start at 1, never change, and never remap
//! to a different URI. The mutex is only contended while a plugin is being
//! instantiated; on the audio path every URI the host touches is pre-seeded
//! through [`KnownUrids`], so `map` is never called there in practice.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};

use lv2_raw::urid::{LV2Urid, LV2UridMap, LV2UridMapHandle};
use parking_lot::Mutex;

/// URIs the host emits, recognizes, or negotiates.
pub mod uris {
    pub const ATOM_SEQUENCE: &str = "http://lv2plug.in/ns/ext/atom#Sequence";
    pub const ATOM_CHUNK: &str = "http://lv2plug.in/ns/ext/atom#Chunk";
    pub const ATOM_OBJECT: &str = "http://lv2plug.in/ns/ext/atom#Object";
    pub const ATOM_FLOAT: &str = "http://lv2plug.in/ns/ext/atom#Float";
    pub const ATOM_INT: &str = "http://lv2plug.in/ns/ext/atom#Int";
    pub const ATOM_DOUBLE: &str = "http://lv2plug.in/ns/ext/atom#Double";
    pub const ATOM_PATH: &str = "http://lv2plug.in/ns/ext/atom#Path";
    pub const ATOM_EVENT_TRANSFER: &str = "http://lv2plug.in/ns/ext/atom#eventTransfer";
    pub const ATOM_PORT: &str = "http://lv2plug.in/ns/ext/atom#AtomPort";
    pub const MIDI_EVENT: &str = "http://lv2plug.in/ns/ext/midi#MidiEvent";
    pub const PATCH_GET: &str = "http://lv2plug.in/ns/ext/patch#Get";
    pub const PATCH_SET: &str = "http://lv2plug.in/ns/ext/patch#Set";
    pub const PATCH_PROPERTY: &str = "http://lv2plug.in/ns/ext/patch#property";
    pub const PATCH_VALUE: &str = "http://lv2plug.in/ns/ext/patch#value";
    pub const PARAM_SAMPLE_RATE: &str = "http://lv2plug.in/ns/ext/parameters#sampleRate";
    pub const BUF_MAX_BLOCK_LENGTH: &str = "http://lv2plug.in/ns/ext/buf-size#maxBlockLength";
    pub const BUF_BOUNDED_BLOCK_LENGTH: &str =
        "http://lv2plug.in/ns/ext/buf-size#boundedBlockLength";
    pub const URID_MAP: &str = "http://lv2plug.in/ns/ext/urid#map";
    pub const URID_UNMAP: &str = "http://lv2plug.in/ns/ext/urid#unmap";
    pub const OPTIONS_OPTIONS: &str = "http://lv2plug.in/ns/ext/options#options";
    pub const WORKER_SCHEDULE: &str = "http://lv2plug.in/ns/ext/worker#schedule";
    pub const WORKER_INTERFACE: &str = "http://lv2plug.in/ns/ext/worker#interface";
    pub const STATE_INTERFACE: &str = "http://lv2plug.in/ns/ext/state#interface";
    pub const STATE_MAKE_PATH: &str = "http://lv2plug.in/ns/ext/state#makePath";
    pub const STATE_MAP_PATH: &str = "http://lv2plug.in/ns/ext/state#mapPath";
    pub const STATE_FREE_PATH: &str = "http://lv2plug.in/ns/ext/state#freePath";
    pub const STATE_THREAD_SAFE_RESTORE: &str =
        "http://lv2plug.in/ns/ext/state#threadSafeRestore";
    pub const RESIZE_PORT_MINIMUM_SIZE: &str =
        "http://lv2plug.in/ns/ext/resize-port#minimumSize";
    pub const CORE_AUDIO_PORT: &str = "http://lv2plug.in/ns/lv2core#AudioPort";
    pub const CORE_CONTROL_PORT: &str = "http://lv2plug.in/ns/lv2core#ControlPort";
    pub const CORE_INPUT_PORT: &str = "http://lv2plug.in/ns/lv2core#InputPort";
    pub const CORE_OUTPUT_PORT: &str = "http://lv2plug.in/ns/lv2core#OutputPort";
}

/// `urid:unmap` C struct; lv2-raw only ships the map side.
#[repr(C)]
pub struct LV2UridUnmap {
    pub handle: LV2UridMapHandle,
    pub unmap: extern "C" fn(handle: LV2UridMapHandle, urid: LV2Urid) -> *const c_char,
}

struct MapperInner {
    by_uri: HashMap<String, LV2Urid>,
    /// Index == URID. Slot 0 is a reserved dummy so real IDs start at 1.
    /// CStrings give unmap a heap pointer that stays put when this Vec
    /// reallocates.
    by_id: Vec<CString>,
}

/// Thread-safe URI-to-URID mapper, shared with the plugin through the
/// `urid:map` / `urid:unmap` features.
pub struct UridMapper {
    inner: Mutex<MapperInner>,
}

impl Default for UridMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl UridMapper {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MapperInner {
                by_uri: HashMap::new(),
                by_id: vec![CString::default()],
            }),
        }
    }

    /// Map a URI to its URID, assigning the next ID on first sight.
    /// IDs are always ≥ 1; 0 is the error value of the C callback.
    pub fn map(&self, uri: &str) -> LV2Urid {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_uri.get(uri) {
            return id;
        }
        let Ok(c_uri) = CString::new(uri) else {
            return 0;
        };
        let id = inner.by_id.len() as LV2Urid;
        inner.by_uri.insert(uri.to_string(), id);
        inner.by_id.push(c_uri);
        id
    }

    /// Reverse-map a URID. Returns None for 0 and for IDs never issued.
    pub fn unmap(&self, urid: LV2Urid) -> Option<String> {
        if urid == 0 {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .by_id
            .get(urid as usize)
            .map(|uri| uri.to_string_lossy().into_owned())
    }

    /// Build the `LV2_URID_Map` struct pointing at this mapper.
    ///
    /// The struct holds a raw pointer to `self`; the mapper must outlive
    /// every plugin instance the struct is handed to.
    pub fn as_lv2_urid_map(&self) -> LV2UridMap {
        LV2UridMap {
            handle: self as *const UridMapper as LV2UridMapHandle,
            map: urid_map_callback,
        }
    }

    /// Build the `LV2_URID_Unmap` struct pointing at this mapper, under the
    /// same lifetime rule as [`Self::as_lv2_urid_map`].
    pub fn as_lv2_urid_unmap(&self) -> LV2UridUnmap {
        LV2UridUnmap {
            handle: self as *const UridMapper as *mut c_void,
            unmap: urid_unmap_callback,
        }
    }
}

extern "C" fn urid_map_callback(handle: LV2UridMapHandle, uri: *const c_char) -> LV2Urid {
    if handle.is_null() || uri.is_null() {
        return 0;
    }
    let mapper = unsafe { &*(handle as *const UridMapper) };
    let c_str = unsafe { CStr::from_ptr(uri) };
    match c_str.to_str() {
        Ok(s) => mapper.map(s),
        Err(_) => 0,
    }
}

extern "C" fn urid_unmap_callback(handle: LV2UridMapHandle, urid: LV2Urid) -> *const c_char {
    if handle.is_null() || urid == 0 {
        return std::ptr::null();
    }
    let mapper = unsafe { &*(handle as *const UridMapper) };
    let inner = mapper.inner.lock();
    inner
        .by_id
        .get(urid as usize)
        .map(|uri| uri.as_ptr())
        .unwrap_or(std::ptr::null())
}

/// URIDs the host needs on the hot path, resolved once at open.
#[derive(Debug, Clone, Copy)]
pub struct KnownUrids {
    pub atom_sequence: LV2Urid,
    pub atom_chunk: LV2Urid,
    pub atom_object: LV2Urid,
    pub atom_float: LV2Urid,
    pub atom_int: LV2Urid,
    pub atom_double: LV2Urid,
    pub atom_path: LV2Urid,
    pub atom_event_transfer: LV2Urid,
    pub midi_event: LV2Urid,
    pub patch_get: LV2Urid,
    pub patch_set: LV2Urid,
    pub patch_property: LV2Urid,
    pub patch_value: LV2Urid,
    pub param_sample_rate: LV2Urid,
    pub buf_max_block_length: LV2Urid,
}

impl KnownUrids {
    pub fn new(mapper: &UridMapper) -> Self {
        Self {
            atom_sequence: mapper.map(uris::ATOM_SEQUENCE),
            atom_chunk: mapper.map(uris::ATOM_CHUNK),
            atom_object: mapper.map(uris::ATOM_OBJECT),
            atom_float: mapper.map(uris::ATOM_FLOAT),
            atom_int: mapper.map(uris::ATOM_INT),
            atom_double: mapper.map(uris::ATOM_DOUBLE),
            atom_path: mapper.map(uris::ATOM_PATH),
            atom_event_transfer: mapper.map(uris::ATOM_EVENT_TRANSFER),
            midi_event: mapper.map(uris::MIDI_EVENT),
            patch_get: mapper.map(uris::PATCH_GET),
            patch_set: mapper.map(uris::PATCH_SET),
            patch_property: mapper.map(uris::PATCH_PROPERTY),
            patch_value: mapper.map(uris::PATCH_VALUE),
            param_sample_rate: mapper.map(uris::PARAM_SAMPLE_RATE),
            buf_max_block_length: mapper.map(uris::BUF_MAX_BLOCK_LENGTH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_unmap_roundtrip() {
        let mapper = UridMapper::new();
        let id1 = mapper.map(uris::MIDI_EVENT);
        let id2 = mapper.map(uris::ATOM_SEQUENCE);

        assert!(id1 >= 1);
        assert!(id2 >= 1);
        assert_ne!(id1, id2);
        assert_eq!(mapper.unmap(id1).as_deref(), Some(uris::MIDI_EVENT));
        assert_eq!(mapper.unmap(id2).as_deref(), Some(uris::ATOM_SEQUENCE));
    }

    #[test]
    fn ids_are_stable() {
        let mapper = UridMapper::new();
        let first = mapper.map("urn:example:a");
        for i in 0..100 {
            mapper.map(&format!("urn:example:{i}"));
        }
        assert_eq!(mapper.map("urn:example:a"), first);
        assert_eq!(mapper.unmap(first).as_deref(), Some("urn:example:a"));
    }

    #[test]
    fn unmap_unknown_is_none() {
        let mapper = UridMapper::new();
        assert_eq!(mapper.unmap(0), None);
        assert_eq!(mapper.unmap(999), None);
    }

    #[test]
    fn c_callbacks_roundtrip() {
        let mapper = UridMapper::new();
        let map_struct = mapper.as_lv2_urid_map();
        let unmap_struct = mapper.as_lv2_urid_unmap();

        let uri = std::ffi::CString::new(uris::ATOM_FLOAT).unwrap();
        let id = (map_struct.map)(map_struct.handle, uri.as_ptr());
        assert!(id >= 1);

        let back = (unmap_struct.unmap)(unmap_struct.handle, id);
        assert!(!back.is_null());
        let back = unsafe { CStr::from_ptr(back) };
        assert_eq!(back.to_str().unwrap(), uris::ATOM_FLOAT);
    }
}
