//! The plugin host orchestrator.
//!
//! [`Lv2Host`] wraps a lilv world for discovery. [`Lv2Instance`] is the
//! real-time side of one hosted plugin: it owns the instantiated plugin,
//! its ports and worker, and provides the audio-callback body. The
//! [`InstanceController`] is the UI-thread surface, split off exactly once;
//! the two halves only meet through atomics and ringbuffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lilv::instance::ActiveInstance;
use lilv::World;

use crate::atom::EventBuffer;
use crate::channel::{AtomChannel, AtomUi, InboundMode, OutboundAtom};
use crate::driver::{deinterleave_stereo, interleave_stereo, CallbackResult, CHANNELS};
use crate::error::{HostError, Result};
use crate::features::FeatureSet;
use crate::port::{safe_clamp, AtomicF32, ControlRange, EventPortState, Port, PortClass, PortSlot};
use crate::scanner::{self, ClassNodes, PluginInfo};
use crate::urid::{uris, KnownUrids, UridMapper};
use crate::worker::{LV2_Worker_Interface, WorkerPump, WorkerSetup};

/// Default event-buffer size; raised per plugin by resize-port minimums.
pub const DEFAULT_ATOM_SIZE: usize = 8192;

/// DSP→UI (and queued UI→DSP) ring size per event port.
const PORT_RING_SIZE: usize = 16384;

/// Host lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Disposed,
}

impl HostState {
    /// `start` is legal from Initialized and Stopped.
    pub fn can_start(self) -> bool {
        matches!(self, HostState::Initialized | HostState::Stopped)
    }

    /// `stop` is legal only while Running.
    pub fn can_stop(self) -> bool {
        self == HostState::Running
    }
}

/// Parameters for opening one plugin.
#[derive(Debug, Clone)]
pub struct OpenConfig {
    pub plugin_uri: String,
    pub sample_rate: f64,
    /// Largest frame count the driver will deliver per callback; published
    /// to the plugin as `maxBlockLength`.
    pub frames_per_burst: usize,
}

// ── Discovery ──

/// Metadata world wrapper: enumeration and opening.
pub struct Lv2Host {
    world: World,
}

impl Default for Lv2Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Lv2Host {
    pub fn new() -> Self {
        Self {
            world: World::with_load_all(),
        }
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        scanner::scan_plugins(&self.world)
    }

    pub fn find_plugin(&self, uri: &str) -> Result<PluginInfo> {
        self.plugins()
            .into_iter()
            .find(|p| p.uri == uri)
            .ok_or_else(|| HostError::PluginNotFound(uri.to_string()))
    }

    /// Run the full open sequence for `config.plugin_uri`.
    pub fn open(&self, config: &OpenConfig) -> Result<Lv2Instance> {
        // Fail fast against our own world before paying for the
        // instance's private one.
        scanner::resolve_plugin(&self.world, &config.plugin_uri)?;
        Lv2Instance::open(config)
    }
}

// ── Shared UI/RT state ──

struct ControlInputSlot {
    port_index: u32,
    range: ControlRange,
    value: AtomicF32,
}

pub(crate) struct ControlShared {
    shutdown: AtomicBool,
    bypassed: AtomicBool,
    inputs: Vec<ControlInputSlot>,
    outputs: Vec<PortSlot>,
}

struct AtomUiEntry {
    port_index: u32,
    is_input: bool,
    ui: AtomUi,
}

/// UI-thread surface of a running instance.
pub struct InstanceController {
    shared: Arc<ControlShared>,
    atoms: Vec<AtomUiEntry>,
    mapper: Arc<UridMapper>,
    urids: KnownUrids,
}

impl InstanceController {
    /// Store a control-input value, clamped into the port range.
    pub fn try_set_control(&self, port_index: u32, value: f32) -> Result<()> {
        let slot = self
            .shared
            .inputs
            .iter()
            .find(|s| s.port_index == port_index)
            .ok_or(HostError::WrongPortKind {
                index: port_index,
                expected: "control input",
            })?;
        slot.value
            .store(safe_clamp(value, slot.range.min, slot.range.max));
        Ok(())
    }

    /// Boolean form of [`Self::try_set_control`]: the wrong-kind case is
    /// deliberately a no-op.
    pub fn set_control(&self, port_index: u32, value: f32) -> bool {
        match self.try_set_control(port_index, value) {
            Ok(()) => true,
            Err(err) => {
                log::debug!("set_control: {err}");
                false
            }
        }
    }

    /// Current value of a control port's scalar slot, input or output.
    pub fn control_value(&self, port_index: u32) -> Option<f32> {
        self.shared
            .inputs
            .iter()
            .find(|s| s.port_index == port_index)
            .map(|s| s.value.load())
            .or_else(|| {
                self.shared
                    .outputs
                    .iter()
                    .find(|s| s.port_index == port_index)
                    .map(|s| s.value.load())
            })
    }

    /// Post a typed message to an event-input port.
    pub fn try_post_atom(&mut self, port_index: u32, type_urid: u32, data: &[u8]) -> Result<()> {
        let entry = self
            .atoms
            .iter_mut()
            .find(|e| e.port_index == port_index && e.is_input)
            .ok_or(HostError::WrongPortKind {
                index: port_index,
                expected: "event input",
            })?;
        entry.ui.post(type_urid, data)
    }

    /// Boolean form of [`Self::try_post_atom`].
    pub fn post_atom(&mut self, port_index: u32, type_urid: u32, data: &[u8]) -> bool {
        match self.try_post_atom(port_index, type_urid, data) {
            Ok(()) => true,
            Err(err) => {
                log::debug!("post_atom: {err}");
                false
            }
        }
    }

    /// Read one complete event from an event-output port.
    pub fn read_atom(&mut self, port_index: u32) -> Option<OutboundAtom> {
        self.atoms
            .iter_mut()
            .find(|e| e.port_index == port_index && !e.is_input)
            .and_then(|e| e.ui.read_atom())
    }

    /// Outbound events dropped on an event-output port's ring so far.
    pub fn dropped_outbound(&self, port_index: u32) -> u64 {
        self.atoms
            .iter()
            .find(|e| e.port_index == port_index)
            .map(|e| e.ui.dropped_outbound())
            .unwrap_or(0)
    }

    pub fn set_bypassed(&self, bypassed: bool) {
        self.shared.bypassed.store(bypassed, Ordering::Release);
    }

    /// Ask the audio side to stop at the next callback.
    pub fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    pub fn map_uri(&self, uri: &str) -> u32 {
        self.mapper.map(uri)
    }

    pub fn unmap_urid(&self, urid: u32) -> Option<String> {
        self.mapper.unmap(urid)
    }

    pub fn known_urids(&self) -> KnownUrids {
        self.urids
    }
}

// ── The instance ──

/// One hosted plugin, audio-thread side.
///
/// `Send` so the embedder can move it into the driver's data callback;
/// every UI interaction goes through the [`InstanceController`].
pub struct Lv2Instance {
    state: HostState,
    instance: Option<ActiveInstance>,
    ports: Vec<Port>,
    /// Port-vector indices of audio inputs/outputs, in declaration order.
    audio_inputs: Vec<usize>,
    audio_outputs: Vec<usize>,
    control_inputs: Vec<usize>,
    control_outputs: Vec<usize>,
    event_inputs: Vec<usize>,
    event_outputs: Vec<usize>,
    worker: Option<WorkerPump>,
    /// Keeps the schedule feature alive when the plugin ignores the worker.
    _idle_worker: Option<WorkerSetup>,
    shared: Arc<ControlShared>,
    controller: Option<InstanceController>,
    left: Vec<f32>,
    right: Vec<f32>,
    pub(crate) urids: KnownUrids,
    pub(crate) mapper: Arc<UridMapper>,
    pub(crate) features: FeatureSet,
    pub(crate) plugin_uri: String,
    pub(crate) safe_restore: bool,
    sample_rate: f64,
    frames_per_burst: usize,
    // Dropped last: lilv plugin descriptors reference world-owned memory.
    _world: World,
}

impl Lv2Instance {
    /// Open sequence: load the world, resolve the plugin, negotiate
    /// features, build ports, instantiate, wire the worker, connect
    /// non-audio ports, activate.
    pub fn open(config: &OpenConfig) -> Result<Self> {
        let world = World::with_load_all();
        let plugin = scanner::resolve_plugin(&world, &config.plugin_uri)?;
        let nodes = ClassNodes::new(&world);

        let mapper = Arc::new(UridMapper::new());
        let urids = KnownUrids::new(&mapper);

        // Largest event buffer any atom port asks for, floor DEFAULT.
        let mut required_atom_size = DEFAULT_ATOM_SIZE;
        for port in plugin.iter_ports() {
            if !port.is_a(&nodes.atom) {
                continue;
            }
            if let Some(min) = port.get(&nodes.minimum_size).and_then(|n| n.as_int()) {
                required_atom_size = required_atom_size.max(min as usize);
            }
        }

        let mut ports = Vec::with_capacity(plugin.ports_count());
        let mut audio_inputs = Vec::new();
        let mut audio_outputs = Vec::new();
        let mut control_inputs = Vec::new();
        let mut control_outputs = Vec::new();
        let mut event_inputs = Vec::new();
        let mut event_outputs = Vec::new();
        let mut atoms = Vec::new();

        for lp in plugin.iter_ports() {
            let index = lp.index();
            let class = PortClass::from_flags(
                lp.is_a(&nodes.audio),
                lp.is_a(&nodes.control),
                lp.is_a(&nodes.atom),
                lp.is_a(&nodes.input),
                lp.supports_event(&nodes.midi_event),
            );
            let symbol = lp
                .symbol()
                .and_then(|n| n.as_str().map(String::from))
                .unwrap_or_else(|| format!("port_{index}"));

            let mut range = ControlRange::default();
            if class.is_control() {
                let port_range = lp.range();
                range.default = port_range.default.and_then(|n| n.as_float()).unwrap_or(0.0);
                range.min = port_range
                    .minimum
                    .and_then(|n| n.as_float())
                    .unwrap_or(f32::NAN);
                range.max = port_range
                    .maximum
                    .and_then(|n| n.as_float())
                    .unwrap_or(f32::NAN);
            }

            let event = if class.is_event() {
                // MIDI must not coalesce; parameter-style traffic should.
                let mode = if class.is_input() && class.supports_midi() {
                    InboundMode::Queued
                } else {
                    InboundMode::Coalesce
                };
                let (ui, dsp) = AtomChannel::new(required_atom_size, PORT_RING_SIZE, mode)?;
                atoms.push(AtomUiEntry {
                    port_index: index as u32,
                    is_input: class.is_input(),
                    ui,
                });
                let mut buffer = EventBuffer::new(required_atom_size);
                if class.is_input() {
                    buffer.prepare_input(urids.atom_sequence);
                } else {
                    buffer.prepare_output(urids.atom_sequence);
                }
                Some(EventPortState {
                    buffer,
                    channel: dsp,
                })
            } else {
                None
            };

            let slot = ports.len();
            if class.is_audio() {
                if class.is_input() {
                    audio_inputs.push(slot);
                } else {
                    audio_outputs.push(slot);
                }
            } else if class.is_control() {
                if class.is_input() {
                    control_inputs.push(slot);
                } else {
                    control_outputs.push(slot);
                }
            } else if class.is_event() {
                if class.is_input() {
                    event_inputs.push(slot);
                } else {
                    event_outputs.push(slot);
                }
            }

            ports.push(Port {
                index: index as u32,
                class,
                symbol,
                control: range.default,
                range,
                event,
            });
        }

        // Schedule is always advertised; the plugin may ignore it.
        let worker_setup = WorkerSetup::new()?;
        let features = FeatureSet::new(
            &mapper,
            &urids,
            config.frames_per_burst as i32,
            worker_setup.schedule_feature_data(),
        );
        features.check_required(&plugin)?;

        let safe_restore =
            plugin.has_feature(&world.new_uri(uris::STATE_THREAD_SAFE_RESTORE));

        let mut instance = unsafe { plugin.instantiate(config.sample_rate, features.features()) }
            .ok_or_else(|| HostError::InstantiationFailed(config.plugin_uri.clone()))?;

        // Worker: attach only if the plugin exposes the interface; the
        // setup must survive either way because the plugin may have kept
        // the schedule pointer.
        let worker_iface = unsafe {
            instance.extension_data::<LV2_Worker_Interface>(uris::WORKER_INTERFACE)
        };
        let lv2_handle = instance.handle();
        let (worker, idle_worker) = match worker_iface {
            Some(iface) => {
                let pump = unsafe {
                    worker_setup.activate(lv2_handle as *mut std::ffi::c_void, iface.as_ptr())
                };
                (Some(pump), None)
            }
            None => (None, Some(worker_setup)),
        };

        // Connect non-audio ports once. The pointers stay valid because
        // the port vector's heap storage never resizes after this point;
        // audio ports are wired per-callback to the driver scratch.
        for port in ports.iter_mut() {
            if port.class.is_control() {
                unsafe {
                    instance.connect_port_mut(port.index as usize, &mut port.control as *mut f32)
                };
            } else if let Some(event) = port.event.as_mut() {
                unsafe { instance.connect_port_mut(port.index as usize, event.buffer.as_mut_ptr()) };
            } else if !port.class.is_audio() {
                // Unknown kinds are optional by negotiation; NULL is legal.
                unsafe {
                    instance.connect_port_mut(port.index as usize, std::ptr::null_mut::<u8>())
                };
            }
        }

        let shared = Arc::new(ControlShared {
            shutdown: AtomicBool::new(false),
            bypassed: AtomicBool::new(false),
            inputs: control_inputs
                .iter()
                .map(|&slot| ControlInputSlot {
                    port_index: ports[slot].index,
                    range: ports[slot].range,
                    value: AtomicF32::new(ports[slot].control),
                })
                .collect(),
            outputs: control_outputs
                .iter()
                .map(|&slot| PortSlot {
                    port_index: ports[slot].index,
                    value: AtomicF32::new(0.0),
                })
                .collect(),
        });

        let controller = InstanceController {
            shared: Arc::clone(&shared),
            atoms,
            mapper: Arc::clone(&mapper),
            urids,
        };

        let active = unsafe { instance.activate() };

        log::info!(
            "Opened {} at {} Hz, burst {} frames, atom buffers {} bytes, worker: {}",
            config.plugin_uri,
            config.sample_rate,
            config.frames_per_burst,
            required_atom_size,
            worker.is_some(),
        );

        Ok(Self {
            state: HostState::Initialized,
            instance: Some(active),
            ports,
            audio_inputs,
            audio_outputs,
            control_inputs,
            control_outputs,
            event_inputs,
            event_outputs,
            worker,
            _idle_worker: idle_worker,
            shared,
            controller: Some(controller),
            left: vec![0.0; config.frames_per_burst],
            right: vec![0.0; config.frames_per_burst],
            urids,
            mapper,
            features,
            plugin_uri: config.plugin_uri.clone(),
            safe_restore,
            sample_rate: config.sample_rate,
            frames_per_burst: config.frames_per_burst,
            _world: world,
        })
    }

    /// Take the UI surface. Yields `Some` exactly once.
    pub fn take_controller(&mut self) -> Option<InstanceController> {
        self.controller.take()
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn plugin_uri(&self) -> &str {
        &self.plugin_uri
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn known_urids(&self) -> KnownUrids {
        self.urids
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Begin serving callbacks. The embedder starts the driver around this.
    pub fn start(&mut self) -> Result<()> {
        if !self.state.can_start() {
            return Err(HostError::NotReady(self.state));
        }
        self.shared.shutdown.store(false, Ordering::Release);
        self.state = HostState::Running;
        Ok(())
    }

    /// Stop serving callbacks; in-flight worker responses are drained
    /// before anything is torn down.
    pub fn stop(&mut self) -> Result<()> {
        if !self.state.can_stop() {
            return Err(HostError::NotReady(self.state));
        }
        if let Some(worker) = self.worker.as_mut() {
            unsafe { worker.drain_responses() };
        }
        self.state = HostState::Stopped;
        Ok(())
    }

    /// Release everything. Idempotent; joins the worker before the plugin
    /// instance is freed.
    pub fn close(&mut self) {
        if self.state == HostState::Disposed {
            return;
        }
        self.state = HostState::Disposed;

        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self._idle_worker = None;

        if let Some(active) = self.instance.take() {
            let _ = unsafe { active.deactivate() };
        }
        log::info!("Closed {}", self.plugin_uri);
    }

    /// The audio-callback body: `frames` interleaved stereo float frames.
    ///
    /// The only path that calls the plugin's `run`. Real-time safe: no
    /// allocation, no locks, no logging.
    pub fn process_interleaved(&mut self, buffer: &mut [f32], frames: usize) -> CallbackResult {
        if self.state != HostState::Running || self.shared.shutdown.load(Ordering::Acquire) {
            return CallbackResult::Stop;
        }
        // A frame count outside the negotiated bounds is a driver bug; the
        // host declines to under- or over-run.
        if frames == 0 || frames > self.frames_per_burst || buffer.len() < frames * CHANNELS {
            return CallbackResult::Stop;
        }
        if self.shared.bypassed.load(Ordering::Acquire) {
            // Passthrough: the interleaved buffer already carries the input.
            return CallbackResult::Continue;
        }

        deinterleave_stereo(buffer, &mut self.left, &mut self.right, frames);

        let Some(instance) = self.instance.as_mut() else {
            return CallbackResult::Stop;
        };

        // Audio ports in declaration order: first input is left, second is
        // right; same for outputs.
        for (ord, &slot) in self.audio_inputs.iter().enumerate() {
            let target = if ord == 0 {
                self.left.as_mut_ptr()
            } else {
                self.right.as_mut_ptr()
            };
            unsafe {
                instance
                    .instance_mut()
                    .connect_port_mut(self.ports[slot].index as usize, target)
            };
        }
        for (ord, &slot) in self.audio_outputs.iter().enumerate() {
            let target = if ord == 0 {
                self.left.as_mut_ptr()
            } else {
                self.right.as_mut_ptr()
            };
            unsafe {
                instance
                    .instance_mut()
                    .connect_port_mut(self.ports[slot].index as usize, target)
            };
        }

        // UI-published control values into the connected scalars.
        for (pos, &slot) in self.control_inputs.iter().enumerate() {
            self.ports[slot].control = self.shared.inputs[pos].value.load();
        }

        // Input sequences: reset, then splice in whatever the UI posted.
        for &slot in &self.event_inputs {
            if let Some(event) = self.ports[slot].event.as_mut() {
                event.buffer.prepare_input(self.urids.atom_sequence);
                let EventPortState { buffer, channel } = event;
                channel.drain_inbound(|type_urid, data| {
                    buffer.append_event(0, type_urid, data);
                });
            }
        }

        // Output sequences advertise their free body capacity before run.
        for &slot in &self.event_outputs {
            if let Some(event) = self.ports[slot].event.as_mut() {
                event.buffer.prepare_output(self.urids.atom_sequence);
            }
        }

        unsafe { instance.run(frames) };

        if let Some(worker) = self.worker.as_mut() {
            unsafe { worker.drain_responses() };
        }

        // Control outputs back to the UI slots.
        for (pos, &slot) in self.control_outputs.iter().enumerate() {
            self.shared.outputs[pos].value.store(self.ports[slot].control);
        }

        // Ship produced events to the UI, then reset the header.
        for &slot in &self.event_outputs {
            if let Some(event) = self.ports[slot].event.as_mut() {
                let EventPortState { buffer, channel } = event;
                for ev in buffer.events() {
                    channel.push_event(ev.type_urid, ev.body);
                }
                buffer.prepare_output(self.urids.atom_sequence);
            }
        }

        interleave_stereo(&self.left, &self.right, buffer, frames);
        CallbackResult::Continue
    }

    pub(crate) fn active_instance(&self) -> Option<&ActiveInstance> {
        self.instance.as_ref()
    }

    /// The UI-visible control-input vector, for state snapshots.
    pub(crate) fn snapshot_controls(&self) -> Vec<crate::state::PortValue> {
        self.control_inputs
            .iter()
            .enumerate()
            .map(|(pos, &slot)| crate::state::PortValue {
                index: self.ports[slot].index,
                symbol: self.ports[slot].symbol.clone(),
                value: self.shared.inputs[pos].value.load(),
            })
            .collect()
    }

    pub(crate) fn set_control_direct(&mut self, port_index: u32, value: f32) {
        if let Some(pos) = self
            .control_inputs
            .iter()
            .position(|&slot| self.ports[slot].index == port_index)
        {
            let slot = self.control_inputs[pos];
            let clamped = safe_clamp(value, self.ports[slot].range.min, self.ports[slot].range.max);
            self.ports[slot].control = clamped;
            self.shared.inputs[pos].value.store(clamped);
        }
    }
}

impl Drop for Lv2Instance {
    fn drop(&mut self) {
        self.close();
    }
}

// SAFETY: the instance is a single-owner object; the raw plugin handle and
// port buffers it points at move with it. Cross-thread traffic runs through
// the Arc'd shared state, which is Sync.
unsafe impl Send for Lv2Instance {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_legality() {
        assert!(HostState::Initialized.can_start());
        assert!(HostState::Stopped.can_start());
        assert!(!HostState::Running.can_start());
        assert!(!HostState::Disposed.can_start());
        assert!(!HostState::Uninitialized.can_start());

        assert!(HostState::Running.can_stop());
        assert!(!HostState::Initialized.can_stop());
        assert!(!HostState::Stopped.can_stop());
        assert!(!HostState::Disposed.can_stop());
    }
}
