//! Host feature set: everything the plugin is offered at instantiation.
//!
//! Owns the boxed C structs and the URI strings the `LV2_Feature` entries
//! point into, so the whole set has one lifetime the host can tie to the
//! plugin instance. Always offered: urid map/unmap, options (carrying
//! `maxBlockLength`), boundedBlockLength, the three state path helpers,
//! and the worker schedule.

use std::ffi::{c_char, c_void, CStr, CString};

use lv2_raw::core::LV2Feature;
use lv2_raw::urid::LV2UridMap;

use crate::error::{HostError, Result};
use crate::urid::{uris, KnownUrids, LV2UridUnmap, UridMapper};

#[repr(C)]
#[derive(Clone, Copy)]
struct LV2OptionsOption {
    context: u32,
    subject: u32,
    key: u32,
    size: u32,
    type_: u32,
    value: *const c_void,
}

#[repr(C)]
struct LV2StateMakePath {
    handle: *mut c_void,
    path: extern "C" fn(handle: *mut c_void, path: *const c_char) -> *mut c_char,
}

#[repr(C)]
struct LV2StateMapPath {
    handle: *mut c_void,
    abstract_path: extern "C" fn(handle: *mut c_void, path: *const c_char) -> *mut c_char,
    absolute_path: extern "C" fn(handle: *mut c_void, path: *const c_char) -> *mut c_char,
}

#[repr(C)]
struct LV2StateFreePath {
    handle: *mut c_void,
    free_path: extern "C" fn(handle: *mut c_void, path: *mut c_char),
}

/// All paths pass through unchanged; the copy is owned by the plugin until
/// it hands it back to `free_path`.
extern "C" fn passthrough_path(_handle: *mut c_void, path: *const c_char) -> *mut c_char {
    if path.is_null() {
        return std::ptr::null_mut();
    }
    let owned = unsafe { CStr::from_ptr(path) }.to_owned();
    owned.into_raw()
}

extern "C" fn free_path(_handle: *mut c_void, path: *mut c_char) {
    if path.is_null() {
        return;
    }
    // Reclaims exactly the allocation passthrough_path produced.
    unsafe { drop(CString::from_raw(path)) };
}

/// Every feature URI this host offers, in advertisement order. Scanning
/// uses this to judge compatibility before any instance exists.
pub const HOST_FEATURE_URIS: &[&str] = &[
    uris::URID_MAP,
    uris::URID_UNMAP,
    uris::OPTIONS_OPTIONS,
    uris::BUF_BOUNDED_BLOCK_LENGTH,
    uris::STATE_MAKE_PATH,
    uris::STATE_MAP_PATH,
    uris::STATE_FREE_PATH,
    uris::WORKER_SCHEDULE,
];

/// The assembled feature list for one plugin instance.
pub struct FeatureSet {
    _uris: Vec<CString>,
    features: Vec<LV2Feature>,
    _urid_map: Box<LV2UridMap>,
    _urid_unmap: Box<LV2UridUnmap>,
    _max_block_length: Box<i32>,
    _options: Box<[LV2OptionsOption; 2]>,
    _make_path: Box<LV2StateMakePath>,
    _map_path: Box<LV2StateMapPath>,
    _free_path: Box<LV2StateFreePath>,
}

// SAFETY: the raw pointers all target heap allocations owned by this struct
// (or the mapper/worker the caller guarantees to outlive it).
unsafe impl Send for FeatureSet {}

impl FeatureSet {
    /// Assemble the feature set.
    ///
    /// `worker_schedule` is the data pointer of the worker's schedule
    /// feature; the schedule is always advertised, whether or not the
    /// plugin ends up using it.
    ///
    /// The mapper (and the worker setup behind `worker_schedule`) must
    /// outlive the plugin instance this set is passed to.
    pub fn new(
        mapper: &UridMapper,
        urids: &KnownUrids,
        max_block_length: i32,
        worker_schedule: *mut c_void,
    ) -> Self {
        let urid_map = Box::new(mapper.as_lv2_urid_map());
        let urid_unmap = Box::new(mapper.as_lv2_urid_unmap());

        let max_block_length = Box::new(max_block_length);
        let options = Box::new([
            LV2OptionsOption {
                context: 0, // LV2_OPTIONS_INSTANCE
                subject: 0,
                key: urids.buf_max_block_length,
                size: std::mem::size_of::<i32>() as u32,
                type_: urids.atom_int,
                value: &*max_block_length as *const i32 as *const c_void,
            },
            // zero-key terminator
            LV2OptionsOption {
                context: 0,
                subject: 0,
                key: 0,
                size: 0,
                type_: 0,
                value: std::ptr::null(),
            },
        ]);

        let make_path = Box::new(LV2StateMakePath {
            handle: std::ptr::null_mut(),
            path: passthrough_path,
        });
        let map_path = Box::new(LV2StateMapPath {
            handle: std::ptr::null_mut(),
            abstract_path: passthrough_path,
            absolute_path: passthrough_path,
        });
        let free_path_s = Box::new(LV2StateFreePath {
            handle: std::ptr::null_mut(),
            free_path,
        });

        // Data pointers in HOST_FEATURE_URIS order.
        let data: [*mut c_void; 8] = [
            &*urid_map as *const LV2UridMap as *mut c_void,
            &*urid_unmap as *const LV2UridUnmap as *mut c_void,
            options.as_ptr() as *mut c_void,
            std::ptr::null_mut(),
            &*make_path as *const LV2StateMakePath as *mut c_void,
            &*map_path as *const LV2StateMapPath as *mut c_void,
            &*free_path_s as *const LV2StateFreePath as *mut c_void,
            worker_schedule,
        ];

        let mut uri_storage = Vec::with_capacity(data.len());
        let mut features = Vec::with_capacity(data.len());
        for (uri, data) in HOST_FEATURE_URIS.iter().zip(data) {
            let c_uri = CString::new(*uri).expect("feature URIs contain no NUL");
            features.push(LV2Feature {
                uri: c_uri.as_ptr(),
                data,
            });
            uri_storage.push(c_uri);
        }

        Self {
            _uris: uri_storage,
            features,
            _urid_map: urid_map,
            _urid_unmap: urid_unmap,
            _max_block_length: max_block_length,
            _options: options,
            _make_path: make_path,
            _map_path: map_path,
            _free_path: free_path_s,
        }
    }

    /// Feature references in the shape `plugin.instantiate` takes.
    pub fn features(&self) -> Vec<&LV2Feature> {
        self.features.iter().collect()
    }

    /// NULL-terminated pointer array for C entry points that take
    /// `const LV2_Feature* const*` directly (the state interface).
    pub(crate) fn raw_features(&self) -> Vec<*const LV2Feature> {
        let mut ptrs: Vec<*const LV2Feature> =
            self.features.iter().map(|f| f as *const LV2Feature).collect();
        ptrs.push(std::ptr::null());
        ptrs
    }

    pub fn supports(&self, uri: &str) -> bool {
        HOST_FEATURE_URIS.contains(&uri)
    }

    /// Reject the plugin if any of its required features is not offered.
    pub fn check_required(&self, plugin: &lilv::plugin::Plugin) -> Result<()> {
        for feature in plugin.required_features().iter() {
            if let Some(uri) = feature.as_uri() {
                if !self.supports(uri) {
                    return Err(HostError::UnsupportedFeature(uri.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertises_the_negotiated_set() {
        let mapper = UridMapper::new();
        let urids = KnownUrids::new(&mapper);
        let set = FeatureSet::new(&mapper, &urids, 4096, std::ptr::null_mut());

        for uri in [
            uris::URID_MAP,
            uris::URID_UNMAP,
            uris::OPTIONS_OPTIONS,
            uris::BUF_BOUNDED_BLOCK_LENGTH,
            uris::STATE_MAKE_PATH,
            uris::STATE_MAP_PATH,
            uris::STATE_FREE_PATH,
            uris::WORKER_SCHEDULE,
        ] {
            assert!(set.supports(uri), "missing {uri}");
        }
        assert!(!set.supports("http://example.org/not-a-feature"));
        assert_eq!(set.features().len(), 8);
    }

    #[test]
    fn options_carry_max_block_length() {
        let mapper = UridMapper::new();
        let urids = KnownUrids::new(&mapper);
        let set = FeatureSet::new(&mapper, &urids, 4096, std::ptr::null_mut());

        let opts = &set._options;
        assert_eq!(opts[0].key, urids.buf_max_block_length);
        assert_eq!(opts[0].type_, urids.atom_int);
        let value = unsafe { *(opts[0].value as *const i32) };
        assert_eq!(value, 4096);
        // terminator
        assert_eq!(opts[1].key, 0);
        assert!(opts[1].value.is_null());
    }

    #[test]
    fn path_helpers_pass_through_owned_copies() {
        let input = CString::new("/tmp/plugin-state/sample.wav").unwrap();
        let out = passthrough_path(std::ptr::null_mut(), input.as_ptr());
        assert!(!out.is_null());
        let copy = unsafe { CStr::from_ptr(out) };
        assert_eq!(copy.to_str().unwrap(), "/tmp/plugin-state/sample.wav");
        // distinct allocation, reclaimed by the free helper
        assert_ne!(out as *const c_char, input.as_ptr());
        free_path(std::ptr::null_mut(), out);
    }
}
