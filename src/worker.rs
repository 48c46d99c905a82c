//! LV2 Worker extension implementation.
//!
//! Provides the `LV2_Worker_Schedule` feature so plugins can hand
//! non-realtime work to the host. The audio thread enqueues framed
//! requests on a ringbuffer; a dedicated worker thread picks them up,
//! calls the plugin's `work()`, and responses travel back on a second
//! ringbuffer to be delivered through `work_response()` after the next
//! `run()` cycle.
//!
//! Two-phase construction:
//!   1. `WorkerSetup::new()` — rings + schedule feature (pre-instantiation)
//!   2. `WorkerSetup::activate(handle, iface)` → `WorkerPump` (post-instantiation)

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::ringbuffer::{Consumer, Producer, Ringbuffer};

// ── C-compatible struct definitions matching lv2/worker/worker.h ──

#[allow(non_camel_case_types)]
pub type LV2_Worker_Status = u32;
pub const LV2_WORKER_SUCCESS: LV2_Worker_Status = 0;
pub const LV2_WORKER_ERR_UNKNOWN: LV2_Worker_Status = 1;
pub const LV2_WORKER_ERR_NO_SPACE: LV2_Worker_Status = 2;

#[allow(non_camel_case_types)]
pub type LV2_Worker_Respond_Handle = *mut c_void;
#[allow(non_camel_case_types)]
pub type LV2_Worker_Respond_Function = unsafe extern "C" fn(
    handle: LV2_Worker_Respond_Handle,
    size: u32,
    data: *const c_void,
) -> LV2_Worker_Status;

#[allow(non_camel_case_types)]
pub type LV2_Worker_Schedule_Handle = *mut c_void;

/// The host-provided feature struct passed to the plugin.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Worker_Schedule {
    pub handle: LV2_Worker_Schedule_Handle,
    pub schedule_work: unsafe extern "C" fn(
        handle: LV2_Worker_Schedule_Handle,
        size: u32,
        data: *const c_void,
    ) -> LV2_Worker_Status,
}

/// Plugin-provided interface retrieved via extension_data.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct LV2_Worker_Interface {
    pub work: unsafe extern "C" fn(
        instance: *mut c_void, // LV2_Handle
        respond: LV2_Worker_Respond_Function,
        handle: LV2_Worker_Respond_Handle,
        size: u32,
        data: *const c_void,
    ) -> LV2_Worker_Status,
    pub work_response: unsafe extern "C" fn(
        instance: *mut c_void, // LV2_Handle
        size: u32,
        body: *const c_void,
    ) -> LV2_Worker_Status,
    pub end_run: Option<unsafe extern "C" fn(instance: *mut c_void) -> LV2_Worker_Status>,
}

/// `[size: u32][payload]` framing on both rings.
const FRAME_HEADER: usize = 4;

pub const DEFAULT_RING_SIZE: usize = 8192;
pub const DEFAULT_SCRATCH_SIZE: usize = 8192;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

// ── Contexts behind the C handles ──

/// Handle target of the `LV2_Worker_Schedule` struct. Heap-allocated so the
/// pointer stays stable for the plugin's lifetime.
struct ScheduleCtx {
    /// Written only by the audio thread (the sole caller of `schedule`).
    request_tx: UnsafeCell<Producer>,
    work_pending: Arc<AtomicBool>,
}

/// Handle target passed to the plugin's `work()` as the respond handle.
/// Owned by the worker thread.
struct RespondCtx {
    response_tx: UnsafeCell<Producer>,
}

// ── Phase 1: Pre-instantiation setup ──

/// Holds the rings and the schedule feature needed before the plugin is
/// instantiated. Hand `schedule_feature_data()` to the feature list, then
/// call `activate()` once the worker interface is known.
pub struct WorkerSetup {
    schedule: Option<Box<LV2_Worker_Schedule>>,
    sched_ctx: *mut ScheduleCtx,
    request_rx: Option<Consumer>,
    response_tx: Option<Producer>,
    response_rx: Option<Consumer>,
    work_pending: Arc<AtomicBool>,
    scratch_size: usize,
}

// SAFETY: the raw context pointer is only dereferenced through the schedule
// callback; ownership stays with this struct until `activate` transfers it.
unsafe impl Send for WorkerSetup {}

impl WorkerSetup {
    pub fn new() -> Result<Self> {
        Self::with_sizes(DEFAULT_RING_SIZE, DEFAULT_RING_SIZE, DEFAULT_SCRATCH_SIZE)
    }

    /// Ring and scratch sizes are tunable for hosts embedding plugins with
    /// known larger state blobs.
    pub fn with_sizes(
        request_ring: usize,
        response_ring: usize,
        scratch_size: usize,
    ) -> Result<Self> {
        let (request_tx, request_rx) = Ringbuffer::with_capacity(request_ring)?;
        let (response_tx, response_rx) = Ringbuffer::with_capacity(response_ring)?;
        let work_pending = Arc::new(AtomicBool::new(false));

        let sched_ctx = Box::into_raw(Box::new(ScheduleCtx {
            request_tx: UnsafeCell::new(request_tx),
            work_pending: Arc::clone(&work_pending),
        }));
        let schedule = Box::new(LV2_Worker_Schedule {
            handle: sched_ctx as LV2_Worker_Schedule_Handle,
            schedule_work: schedule_work_callback,
        });

        Ok(Self {
            schedule: Some(schedule),
            sched_ctx,
            request_rx: Some(request_rx),
            response_tx: Some(response_tx),
            response_rx: Some(response_rx),
            work_pending,
            scratch_size,
        })
    }

    /// Data pointer for the `worker:schedule` feature entry.
    pub fn schedule_feature_data(&self) -> *mut c_void {
        self.schedule
            .as_deref()
            .map(|s| s as *const LV2_Worker_Schedule as *mut c_void)
            .unwrap_or(std::ptr::null_mut())
    }

    /// Spawn the worker thread and return the active pump.
    ///
    /// `lv2_handle` — the raw instance handle; `worker_iface` — the
    /// plugin's `LV2_Worker_Interface` from extension data.
    ///
    /// # Safety
    /// Both pointers must stay valid for the lifetime of the returned
    /// `WorkerPump`, and the pump must be stopped before the plugin
    /// instance is freed.
    pub unsafe fn activate(
        mut self,
        lv2_handle: *mut c_void,
        worker_iface: *const LV2_Worker_Interface,
    ) -> WorkerPump {
        let request_rx = self.request_rx.take().expect("activate called twice");
        let response_tx = self.response_tx.take().expect("activate called twice");
        let response_rx = self.response_rx.take().expect("activate called twice");

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread_pending = Arc::clone(&self.work_pending);

        // Smuggle the raw pointers across the thread boundary as integers;
        // the worker only uses them while `running` is true.
        let thread_handle = lv2_handle as usize;
        let thread_iface = worker_iface as usize;

        let thread = std::thread::Builder::new()
            .name("lv2-worker".to_string())
            .spawn(move || {
                worker_thread_main(
                    thread_handle as *mut c_void,
                    thread_iface as *const LV2_Worker_Interface,
                    request_rx,
                    RespondCtx {
                        response_tx: UnsafeCell::new(response_tx),
                    },
                    thread_running,
                    thread_pending,
                );
            })
            .expect("failed to spawn LV2 worker thread");

        let sched_ctx = self.sched_ctx;
        self.sched_ctx = std::ptr::null_mut();

        WorkerPump {
            _schedule: self.schedule.take(),
            sched_ctx,
            response_rx: Some(response_rx),
            scratch: vec![0u8; self.scratch_size],
            worker_iface,
            lv2_handle,
            running,
            thread: Some(thread),
            discarded_responses: AtomicU64::new(0),
        }
    }
}

impl Drop for WorkerSetup {
    fn drop(&mut self) {
        // Reclaim the ScheduleCtx if activate was never called.
        if !self.sched_ctx.is_null() {
            unsafe { drop(Box::from_raw(self.sched_ctx)) };
            self.sched_ctx = std::ptr::null_mut();
        }
    }
}

// ── Phase 2: Active worker ──

/// Per-instance worker pump. The audio thread calls
/// [`WorkerPump::drain_responses`] after each `run`; everything else runs
/// on the worker thread it owns.
pub struct WorkerPump {
    /// Keeps the schedule struct (and its heap address) alive for the plugin.
    _schedule: Option<Box<LV2_Worker_Schedule>>,
    sched_ctx: *mut ScheduleCtx,
    response_rx: Option<Consumer>,
    scratch: Vec<u8>,
    worker_iface: *const LV2_Worker_Interface,
    lv2_handle: *mut c_void,
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    discarded_responses: AtomicU64,
}

// SAFETY: the raw pointers are only dereferenced from the thread that calls
// `drain_responses` (the audio thread) while the plugin instance is alive.
unsafe impl Send for WorkerPump {}

impl WorkerPump {
    /// Deliver queued worker responses to the plugin, one framed record at
    /// a time. A response larger than the scratch buffer is read out and
    /// discarded rather than delivered.
    ///
    /// # Safety
    /// Must be called from the same thread that calls the plugin's `run`,
    /// after `run` returns.
    pub unsafe fn drain_responses(&mut self) {
        if self.worker_iface.is_null() {
            return;
        }
        let iface = unsafe { &*self.worker_iface };
        let Some(rx) = self.response_rx.as_mut() else {
            return;
        };

        let mut header = [0u8; FRAME_HEADER];
        loop {
            if rx.peek(&mut header) < FRAME_HEADER {
                break;
            }
            let size = u32::from_ne_bytes(header) as usize;
            if rx.read_space() < FRAME_HEADER + size {
                break;
            }
            rx.skip(FRAME_HEADER);

            if size <= self.scratch.len() {
                rx.read(&mut self.scratch[..size]);
                unsafe {
                    (iface.work_response)(
                        self.lv2_handle,
                        size as u32,
                        self.scratch.as_ptr() as *const c_void,
                    );
                }
            } else {
                rx.skip(size);
                self.discarded_responses.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(end_run) = iface.end_run {
            unsafe { end_run(self.lv2_handle) };
        }
    }

    /// Responses dropped because they exceeded the scratch buffer.
    pub fn discarded_responses(&self) -> u64 {
        self.discarded_responses.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the worker: clear the running flag, join the thread, then
    /// release the rings and interface pointers. Idempotent. Must complete
    /// before the plugin instance is freed.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.response_rx = None;
        self.worker_iface = std::ptr::null();
        self.lv2_handle = std::ptr::null_mut();
    }
}

impl Drop for WorkerPump {
    fn drop(&mut self) {
        self.stop();
        if !self.sched_ctx.is_null() {
            unsafe { drop(Box::from_raw(self.sched_ctx)) };
            self.sched_ctx = std::ptr::null_mut();
        }
    }
}

// ── Callbacks ──

/// Called by the plugin from `run()` (audio thread) to schedule work.
/// Writes `[size][payload]` atomically with respect to the worker: the
/// space check covers the whole record before any byte is written.
unsafe extern "C" fn schedule_work_callback(
    handle: LV2_Worker_Schedule_Handle,
    size: u32,
    data: *const c_void,
) -> LV2_Worker_Status {
    if handle.is_null() || (size > 0 && data.is_null()) {
        return LV2_WORKER_ERR_UNKNOWN;
    }
    let ctx = unsafe { &*(handle as *const ScheduleCtx) };
    // SAFETY: only the audio thread invokes schedule, so the producer is
    // effectively exclusively owned here.
    let tx = unsafe { &mut *ctx.request_tx.get() };

    let total = FRAME_HEADER + size as usize;
    if tx.write_space() < total {
        return LV2_WORKER_ERR_NO_SPACE;
    }
    tx.write(&size.to_ne_bytes());
    if size > 0 {
        let payload = unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) };
        tx.write(payload);
    }
    ctx.work_pending.store(true, Ordering::Release);
    LV2_WORKER_SUCCESS
}

/// Called by the plugin's `work()` on the worker thread to send a response.
unsafe extern "C" fn respond_callback(
    handle: LV2_Worker_Respond_Handle,
    size: u32,
    data: *const c_void,
) -> LV2_Worker_Status {
    if handle.is_null() || (size > 0 && data.is_null()) {
        return LV2_WORKER_ERR_UNKNOWN;
    }
    let ctx = unsafe { &*(handle as *const RespondCtx) };
    // SAFETY: the worker thread is the only caller.
    let tx = unsafe { &mut *ctx.response_tx.get() };

    let total = FRAME_HEADER + size as usize;
    if tx.write_space() < total {
        return LV2_WORKER_ERR_NO_SPACE;
    }
    tx.write(&size.to_ne_bytes());
    if size > 0 {
        let payload = unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) };
        tx.write(payload);
    }
    LV2_WORKER_SUCCESS
}

// ── Worker thread ──

fn worker_thread_main(
    lv2_handle: *mut c_void,
    worker_iface: *const LV2_Worker_Interface,
    mut request_rx: Consumer,
    mut respond_ctx: RespondCtx,
    running: Arc<AtomicBool>,
    work_pending: Arc<AtomicBool>,
) {
    let mut request_buf = vec![0u8; request_rx.capacity()];
    let mut header = [0u8; FRAME_HEADER];

    while running.load(Ordering::Acquire) {
        if request_rx.read_space() < FRAME_HEADER {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        request_rx.peek(&mut header);
        let size = u32::from_ne_bytes(header) as usize;
        if request_rx.read_space() < FRAME_HEADER + size {
            // The audio thread is mid-frame; never advance past a partial
            // record.
            continue;
        }

        request_rx.skip(FRAME_HEADER);
        request_rx.read(&mut request_buf[..size]);
        work_pending.store(false, Ordering::Release);

        unsafe {
            let iface = &*worker_iface;
            (iface.work)(
                lv2_handle,
                respond_callback,
                &mut respond_ctx as *mut RespondCtx as LV2_Worker_Respond_Handle,
                size as u32,
                if size == 0 {
                    std::ptr::null()
                } else {
                    request_buf.as_ptr() as *const c_void
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    /// Fixture plugin: `work` responds with the bit-reversed request.
    struct FixtureState {
        responses: Mutex<Vec<Vec<u8>>>,
    }

    unsafe extern "C" fn fixture_work(
        _instance: *mut c_void,
        respond: LV2_Worker_Respond_Function,
        handle: LV2_Worker_Respond_Handle,
        size: u32,
        data: *const c_void,
    ) -> LV2_Worker_Status {
        let request = unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) };
        let reversed: Vec<u8> = request.iter().map(|b| b.reverse_bits()).collect();
        unsafe { respond(handle, reversed.len() as u32, reversed.as_ptr() as *const c_void) }
    }

    /// Fixture that responds with `size` zero bytes where the requested
    /// length is read from the first request byte times 100.
    unsafe extern "C" fn fixture_work_sized(
        _instance: *mut c_void,
        respond: LV2_Worker_Respond_Function,
        handle: LV2_Worker_Respond_Handle,
        size: u32,
        data: *const c_void,
    ) -> LV2_Worker_Status {
        let request = unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) };
        let response = vec![0xabu8; request[0] as usize * 100];
        unsafe { respond(handle, response.len() as u32, response.as_ptr() as *const c_void) }
    }

    unsafe extern "C" fn fixture_work_response(
        instance: *mut c_void,
        size: u32,
        body: *const c_void,
    ) -> LV2_Worker_Status {
        let state = unsafe { &*(instance as *const FixtureState) };
        let bytes = unsafe { std::slice::from_raw_parts(body as *const u8, size as usize) };
        state.responses.lock().push(bytes.to_vec());
        LV2_WORKER_SUCCESS
    }

    static REVERSE_IFACE: LV2_Worker_Interface = LV2_Worker_Interface {
        work: fixture_work,
        work_response: fixture_work_response,
        end_run: None,
    };

    static SIZED_IFACE: LV2_Worker_Interface = LV2_Worker_Interface {
        work: fixture_work_sized,
        work_response: fixture_work_response,
        end_run: None,
    };

    fn schedule(setup: &WorkerSetup, payload: &[u8]) -> LV2_Worker_Status {
        let sched = setup.schedule_feature_data() as *const LV2_Worker_Schedule;
        unsafe {
            ((*sched).schedule_work)(
                (*sched).handle,
                payload.len() as u32,
                payload.as_ptr() as *const c_void,
            )
        }
    }

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(
                start.elapsed().as_millis() < deadline_ms as u128,
                "worker did not make progress in time"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn response_is_delivered_exactly_once() {
        let state = Box::new(FixtureState {
            responses: Mutex::new(Vec::new()),
        });
        let setup = WorkerSetup::new().unwrap();
        let sched = setup.schedule_feature_data() as *const LV2_Worker_Schedule;

        let mut pump = unsafe {
            setup.activate(&*state as *const FixtureState as *mut c_void, &REVERSE_IFACE)
        };

        let request: Vec<u8> = (0u8..16).collect();
        let status = unsafe {
            ((*sched).schedule_work)(
                (*sched).handle,
                request.len() as u32,
                request.as_ptr() as *const c_void,
            )
        };
        assert_eq!(status, LV2_WORKER_SUCCESS);

        wait_until(2000, || {
            unsafe { pump.drain_responses() };
            !state.responses.lock().is_empty()
        });

        let responses = state.responses.lock();
        assert_eq!(responses.len(), 1);
        let expected: Vec<u8> = request.iter().map(|b| b.reverse_bits()).collect();
        assert_eq!(responses[0], expected);
        drop(responses);

        pump.stop();
    }

    #[test]
    fn oversize_response_is_discarded_next_one_delivered() {
        let state = Box::new(FixtureState {
            responses: Mutex::new(Vec::new()),
        });
        let setup = WorkerSetup::with_sizes(512, 512, 256).unwrap();
        // The schedule struct is heap-allocated; its address survives the
        // move into the pump.
        let sched = setup.schedule_feature_data() as *const LV2_Worker_Schedule;

        // 4 * 100 = 400 bytes: fits the 512-byte ring, exceeds the scratch
        assert_eq!(schedule(&setup, &[4]), LV2_WORKER_SUCCESS);

        let mut pump =
            unsafe { setup.activate(&*state as *const FixtureState as *mut c_void, &SIZED_IFACE) };

        wait_until(2000, || {
            unsafe { pump.drain_responses() };
            pump.discarded_responses() == 1
        });
        assert!(state.responses.lock().is_empty());

        // a well-sized response afterwards arrives intact
        let status = unsafe {
            ((*sched).schedule_work)((*sched).handle, 1, [1u8].as_ptr() as *const c_void)
        };
        assert_eq!(status, LV2_WORKER_SUCCESS);

        wait_until(2000, || {
            unsafe { pump.drain_responses() };
            !state.responses.lock().is_empty()
        });
        assert_eq!(state.responses.lock()[0], vec![0xab; 100]);

        pump.stop();
    }

    #[test]
    fn schedule_reports_no_space_when_full() {
        let setup = WorkerSetup::with_sizes(64, 64, 64).unwrap();
        assert_eq!(schedule(&setup, &[0u8; 40]), LV2_WORKER_SUCCESS);
        // 4 + 40 more bytes do not fit into the remaining 20
        assert_eq!(schedule(&setup, &[0u8; 40]), LV2_WORKER_ERR_NO_SPACE);
    }

    #[test]
    fn stop_joins_and_is_idempotent() {
        let state = Box::new(FixtureState {
            responses: Mutex::new(Vec::new()),
        });
        let setup = WorkerSetup::new().unwrap();
        let mut pump = unsafe {
            setup.activate(&*state as *const FixtureState as *mut c_void, &REVERSE_IFACE)
        };
        assert!(pump.is_running());
        pump.stop();
        assert!(!pump.is_running());
        pump.stop();
        // after stop, no further work or work_response happens
        unsafe { pump.drain_responses() };
        assert!(state.responses.lock().is_empty());
    }
}
