//! The universal payload type moving through the graph.
//!
//! A [`Message`] is a cheaply-cloneable handle (`Arc<Mutex<..>>`) around a
//! byte buffer laid out `[reserved header room | payload]`, plus the
//! metadata every node along the path needs: type, signal, id/seq, the
//! destination to write to, and the coding decision the collector made.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Coarse message kind, mirrored from the source's `MsgType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Data,
    Ipv4Data,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Stop,
}

struct Inner {
    buf: Vec<u8>,
    capacity: usize,
    head: usize,
    curr: usize,
    tail: usize,
    msg_type: MsgType,
    signal: Signal,
    id: u32,
    seq: u32,
    needs_coded: bool,
    dst: Option<SocketAddr>,
}

/// A heap-allocated buffer with header room, shared by `Arc` so the same
/// handle can be threaded from a tunnel read through the collector and out
/// to an encoder without copying.
#[derive(Clone)]
pub struct Message(Arc<Mutex<Inner>>);

impl Message {
    pub fn new(capacity: usize) -> Self {
        Self::with_type(capacity, MsgType::Data)
    }

    pub fn ipv4(capacity: usize) -> Self {
        Self::with_type(capacity, MsgType::Ipv4Data)
    }

    fn with_type(capacity: usize, msg_type: MsgType) -> Self {
        Message(Arc::new(Mutex::new(Inner {
            buf: vec![0u8; capacity],
            capacity,
            head: 0,
            curr: 0,
            tail: 0,
            msg_type,
            signal: Signal::None,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            seq: 0,
            needs_coded: false,
            dst: None,
        })))
    }

    /// Builds the Stop signal message that propagates through every relay
    /// and tells each worker thread to stop its own loop after forwarding it.
    pub fn stop() -> Self {
        let mut m = Self::with_type(0, MsgType::Signal);
        {
            let mut inner = m.0.lock().expect("message mutex poisoned");
            inner.signal = Signal::Stop;
        }
        m
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().expect("message mutex poisoned")
    }

    pub fn is_stop(&self) -> bool {
        let inner = self.lock();
        inner.msg_type == MsgType::Signal && inner.signal == Signal::Stop
    }

    pub fn msg_type(&self) -> MsgType {
        self.lock().msg_type
    }

    pub fn id(&self) -> u32 {
        self.lock().id
    }

    pub fn set_id(&self, id: u32) {
        self.lock().id = id;
    }

    pub fn seq(&self) -> u32 {
        self.lock().seq
    }

    pub fn set_seq(&self, seq: u32) {
        self.lock().seq = seq;
    }

    pub fn needs_coded(&self) -> bool {
        self.lock().needs_coded
    }

    pub fn set_needs_coded(&self, v: bool) {
        self.lock().needs_coded = v;
    }

    pub fn dst_addr(&self) -> Option<SocketAddr> {
        self.lock().dst
    }

    pub fn set_dst_addr(&self, addr: SocketAddr) {
        self.lock().dst = Some(addr);
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Bytes that would be written to the wire: `buf[head..tail]`.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.tail - inner.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload-only length, i.e. bytes filled past the reserved header room.
    pub fn payload_len(&self) -> usize {
        let inner = self.lock();
        inner.tail - inner.curr
    }

    /// Sets `curr = tail = n`, reserving `[0, n)` as header room. Fails (and
    /// leaves state untouched) when `n` exceeds capacity.
    pub fn reserve_header(&self, n: usize) -> bool {
        let mut inner = self.lock();
        if n > inner.capacity {
            return false;
        }
        inner.curr = n;
        inner.tail = n;
        true
    }

    /// Appends `bytes` to the payload, advancing `tail`. Fails (and leaves
    /// state untouched) if it would exceed capacity.
    pub fn fill(&self, bytes: &[u8]) -> bool {
        let mut inner = self.lock();
        let new_tail = inner.tail + bytes.len();
        if new_tail > inner.capacity {
            return false;
        }
        let tail = inner.tail;
        inner.buf[tail..new_tail].copy_from_slice(bytes);
        inner.tail = new_tail;
        true
    }

    /// Claims a writable window of `n` bytes inside the reserved header room
    /// starting at `head`, and advances `head` by `n`. Fails if `n` exceeds
    /// the unused header room (`curr - head`).
    pub fn push_header(&self, n: usize) -> Option<HeaderWindow<'_>> {
        let mut inner = self.lock();
        if n > inner.curr - inner.head {
            return None;
        }
        let start = inner.head;
        inner.head += n;
        Some(HeaderWindow {
            inner,
            start,
            len: n,
        })
    }

    /// A snapshot copy of the payload bytes (`[curr, tail)`), for handing to
    /// an fd write or a wire codec that needs a plain slice.
    pub fn payload_snapshot(&self) -> Vec<u8> {
        let inner = self.lock();
        inner.buf[inner.curr..inner.tail].to_vec()
    }

    /// A snapshot copy of the full wire representation (`[head, tail)`).
    pub fn wire_snapshot(&self) -> Vec<u8> {
        let inner = self.lock();
        inner.buf[inner.head..inner.tail].to_vec()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Message")
            .field("id", &inner.id)
            .field("seq", &inner.seq)
            .field("type", &inner.msg_type)
            .field("head", &inner.head)
            .field("curr", &inner.curr)
            .field("tail", &inner.tail)
            .field("needs_coded", &inner.needs_coded)
            .finish()
    }
}

/// A writable view into a message's reserved header room, returned by
/// [`Message::push_header`]. Holds the message's lock for its lifetime.
pub struct HeaderWindow<'a> {
    inner: MutexGuard<'a, Inner>,
    start: usize,
    len: usize,
}

impl std::ops::Deref for HeaderWindow<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner.buf[self.start..self.start + self.len]
    }
}

impl std::ops::DerefMut for HeaderWindow<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.inner.buf[self.start..self.start + self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// §8 testable property 12, generalized: `reserve_header` either sets
    /// `curr == tail == n` and leaves `head` untouched, or (when oversized)
    /// leaves every cursor exactly as it was.
    #[test_strategy::proptest]
    fn reserve_header_either_applies_cleanly_or_leaves_state_untouched(
        #[strategy(0..256usize)] capacity: usize,
        #[strategy(0..512usize)] n: usize,
    ) {
        let m = Message::new(capacity);
        let ok = m.reserve_header(n);
        if n > capacity {
            prop_assert!(!ok);
            prop_assert_eq!(m.len(), 0);
        } else {
            prop_assert!(ok);
            prop_assert_eq!(m.payload_len(), 0);
            prop_assert_eq!(m.len(), n);
        }
    }

    #[test]
    fn header_room_discipline() {
        let m = Message::new(128);
        assert!(m.reserve_header(20));
        assert!(m.fill(&[1, 2, 3]));

        // head = 0, curr = 20, tail = 23
        assert_eq!(m.payload_len(), 3);
        assert_eq!(m.len(), 23);

        {
            let mut window = m.push_header(20).expect("room for header");
            window.copy_from_slice(&[0xAA; 20]);
        }

        // head now 20, so len() (tail-head) reflects header+payload dropped
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn reserve_header_rejects_oversized_request() {
        let m = Message::new(16);
        assert!(!m.reserve_header(17));
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn push_header_rejects_when_no_room_left() {
        let m = Message::new(16);
        assert!(m.reserve_header(4));
        assert!(m.push_header(4).is_some());
        assert!(m.push_header(1).is_none());
    }

    #[test]
    fn fill_rejects_past_capacity() {
        let m = Message::new(4);
        assert!(m.reserve_header(0));
        assert!(!m.fill(&[0u8; 5]));
        assert_eq!(m.payload_len(), 0);
    }

    #[test]
    fn stop_signal_is_recognised() {
        let m = Message::stop();
        assert!(m.is_stop());
        assert_eq!(m.msg_type(), MsgType::Signal);
    }
}
