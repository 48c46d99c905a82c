//! Atom sequence event buffers.
//!
//! Every event port owns one of these: a 64-byte-aligned allocation the
//! plugin sees through `connect_port`, with the header conventions the atom
//! API expects around each `run` call. Input sequences start empty; output
//! sequences advertise their free body capacity in the header so the plugin
//! knows how much it may append.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem;

use lv2_raw::{
    lv2_atom_sequence_append_event, lv2_atom_sequence_begin, lv2_atom_sequence_is_end,
    lv2_atom_sequence_next, LV2Atom, LV2AtomEvent, LV2AtomSequence, LV2AtomSequenceBody,
};

pub const ATOM_HEADER_SIZE: usize = mem::size_of::<LV2Atom>();
pub const EVENT_HEADER_SIZE: usize = mem::size_of::<LV2AtomEvent>();

const BUFFER_ALIGN: usize = 64;
const MIN_CAPACITY: usize = 64;

/// One event decoded out of a sequence.
#[derive(Debug, Clone, Copy)]
pub struct SequenceEvent<'a> {
    pub frame: i64,
    pub type_urid: u32,
    pub body: &'a [u8],
}

/// Heap buffer backing one event port, laid out as an `LV2_Atom_Sequence`.
pub struct EventBuffer {
    ptr: *mut u8,
    capacity: usize,
    /// Staging area for `append_event`; sized once so appends never touch
    /// the audio-thread stack with a payload-sized array.
    scratch: Vec<u8>,
}

// SAFETY: the buffer is exclusively owned; the raw pointer only exists
// because the plugin ABI needs a stable address.
unsafe impl Send for EventBuffer {}

impl EventBuffer {
    /// Allocate a zeroed, 64-byte-aligned sequence buffer of `capacity`
    /// bytes (clamped up to a usable minimum).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        let layout = Layout::from_size_align(capacity, BUFFER_ALIGN)
            .expect("event buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "event buffer allocation failed");
        Self {
            ptr,
            capacity,
            scratch: vec![0u8; EVENT_HEADER_SIZE + capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Body capacity as the atom API counts it: everything after the outer
    /// atom header.
    pub fn body_capacity(&self) -> usize {
        self.capacity - ATOM_HEADER_SIZE
    }

    /// Stable pointer handed to `connect_port`.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    fn seq(&self) -> *mut LV2AtomSequence {
        self.ptr as *mut LV2AtomSequence
    }

    /// Reset the header for an input port before `run`: an empty sequence
    /// whose size covers only the sequence body header.
    pub fn prepare_input(&mut self, sequence_urid: u32) {
        unsafe {
            let seq = self.seq();
            (*seq).atom.mytype = sequence_urid;
            (*seq).atom.size = mem::size_of::<LV2AtomSequenceBody>() as u32;
            (*seq).body.unit = 0;
            (*seq).body.pad = 0;
        }
    }

    /// Reset the header for an output port before `run`: the atom API
    /// expects `type = Sequence` and `size` = available body capacity.
    pub fn prepare_output(&mut self, sequence_urid: u32) {
        unsafe {
            let seq = self.seq();
            (*seq).atom.mytype = sequence_urid;
            (*seq).atom.size = self.body_capacity() as u32;
            (*seq).body.unit = 0;
            (*seq).body.pad = 0;
        }
    }

    /// Append one timestamped event to the sequence. Returns false when the
    /// event does not fit.
    pub fn append_event(&mut self, frame: i64, type_urid: u32, data: &[u8]) -> bool {
        let needed = EVENT_HEADER_SIZE + data.len();
        if needed > self.scratch.len() {
            return false;
        }
        let event = self.scratch.as_mut_ptr() as *mut LV2AtomEvent;
        unsafe {
            (*event).time_in_frames = frame;
            (*event).body.mytype = type_urid;
            (*event).body.size = data.len() as u32;
            let payload = (event as *mut u8).add(EVENT_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
            !lv2_atom_sequence_append_event(self.seq(), self.body_capacity() as u32, event)
                .is_null()
        }
    }

    /// Iterate the events the sequence currently holds. Walks the full
    /// declared sequence size; zero-sized or zero-typed events are yielded
    /// like any other and do not end the walk.
    pub fn events(&self) -> SequenceIter<'_> {
        let seq = self.ptr as *const LV2AtomSequence;
        unsafe {
            let body = &(*seq).body as *const LV2AtomSequenceBody;
            SequenceIter {
                body,
                size: (*seq).atom.size,
                it: lv2_atom_sequence_begin(body),
                _buffer: std::marker::PhantomData,
            }
        }
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, BUFFER_ALIGN)
            .expect("event buffer layout");
        unsafe { dealloc(self.ptr, layout) };
    }
}

pub struct SequenceIter<'a> {
    body: *const LV2AtomSequenceBody,
    size: u32,
    it: *const LV2AtomEvent,
    _buffer: std::marker::PhantomData<&'a EventBuffer>,
}

impl<'a> Iterator for SequenceIter<'a> {
    type Item = SequenceEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            if lv2_atom_sequence_is_end(self.body, self.size, self.it) {
                return None;
            }
            let event = &*self.it;
            let payload = (self.it as *const u8).add(EVENT_HEADER_SIZE);
            let body = std::slice::from_raw_parts(payload, event.body.size as usize);
            let out = SequenceEvent {
                frame: event.time_in_frames,
                type_urid: event.body.mytype,
                body,
            };
            self.it = lv2_atom_sequence_next(self.it);
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEQ: u32 = 7;
    const FLOAT: u32 = 11;

    #[test]
    fn input_header_convention() {
        let mut buf = EventBuffer::new(256);
        buf.prepare_input(SEQ);
        unsafe {
            let seq = &*(buf.ptr as *const LV2AtomSequence);
            assert_eq!(seq.atom.mytype, SEQ);
            assert_eq!(
                seq.atom.size,
                mem::size_of::<LV2AtomSequenceBody>() as u32
            );
        }
        assert_eq!(buf.events().count(), 0);
    }

    #[test]
    fn output_header_advertises_body_capacity() {
        let mut buf = EventBuffer::new(256);
        buf.prepare_output(SEQ);
        unsafe {
            let seq = &*(buf.ptr as *const LV2AtomSequence);
            assert_eq!(seq.atom.mytype, SEQ);
            assert_eq!(seq.atom.size, (256 - ATOM_HEADER_SIZE) as u32);
        }
    }

    #[test]
    fn append_then_iterate() {
        let mut buf = EventBuffer::new(256);
        buf.prepare_input(SEQ);
        assert!(buf.append_event(0, FLOAT, &0.4f32.to_ne_bytes()));
        assert!(buf.append_event(16, FLOAT, &[1, 2, 3, 4, 5]));

        let events: Vec<_> = buf.events().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].frame, 0);
        assert_eq!(events[0].type_urid, FLOAT);
        assert_eq!(events[0].body, 0.4f32.to_ne_bytes());
        assert_eq!(events[1].frame, 16);
        assert_eq!(events[1].body, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn zero_sized_event_does_not_end_iteration() {
        let mut buf = EventBuffer::new(256);
        buf.prepare_input(SEQ);
        assert!(buf.append_event(0, FLOAT, &[9]));
        assert!(buf.append_event(1, 0, &[]));
        assert!(buf.append_event(2, FLOAT, &[8, 7]));

        let events: Vec<_> = buf.events().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].body.len(), 0);
        assert_eq!(events[2].body, &[8, 7]);
    }

    #[test]
    fn oversize_append_is_refused() {
        let mut buf = EventBuffer::new(64);
        buf.prepare_input(SEQ);
        assert!(!buf.append_event(0, FLOAT, &[0u8; 256]));
    }
}
