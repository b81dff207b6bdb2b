//! Byte-stream transports and the multiplexer that unifies them.
//!
//! The bootloader does not care whether bytes arrive over USB or a UART; it
//! polls a [`Multiplexer`] which tries every registered transport in order.
//! Which transport carried the first accepted command decides where replies
//! go for the rest of the session.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Capacity of the receive ring. One slot is sacrificed to distinguish full
/// from empty, so 255 bytes can be queued.
pub const RING_SIZE: usize = 256;

/// Identifies a transport to the session lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportKind {
    Usb,
    Uart,
}

/// A character-stream transport.
///
/// `poll_byte` must never block; the interpreter owns all waiting.
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Returns the next received byte, if any.
    fn poll_byte(&mut self) -> Option<u8>;

    /// Queues `buf` for transmission.
    fn write(&mut self, buf: &[u8]);

    /// Deinitialises the transport ahead of the boot hand-off.
    fn shutdown(&mut self) {}
}

/// Single-producer single-consumer byte queue between a receive interrupt
/// (or reader thread) and the interpreter.
///
/// When the queue is full the newest byte is dropped; the producer never
/// waits. Index stores pair with loads of the opposite index via
/// release/acquire so the consumer always observes the byte before the
/// published head.
pub struct RingBuffer {
    buf: [AtomicU8; RING_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl RingBuffer {
    pub fn new() -> RingBuffer {
        RingBuffer {
            buf: std::array::from_fn(|_| AtomicU8::new(0)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Queues one byte; returns false if the ring was full and the byte was
    /// dropped.
    pub fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % RING_SIZE;

        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }

        self.buf[head].store(byte, Ordering::Relaxed);
        self.head.store(next, Ordering::Release);

        true
    }

    /// Dequeues one byte, if any.
    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);

        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }

        let byte = self.buf[tail].load(Ordering::Relaxed);
        self.tail.store((tail + 1) % RING_SIZE, Ordering::Release);

        Some(byte)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Acquire)
    }
}

impl Default for RingBuffer {
    fn default() -> RingBuffer {
        RingBuffer::new()
    }
}

/// Polls every registered transport and pins replies to the one that carried
/// the first accepted command.
///
/// Until [`Multiplexer::lock`] is called nothing is ever transmitted: a
/// device that has not yet accepted a command stays silent towards hosts
/// probing the wrong port. After locking, input from the other transport is
/// drained and discarded so its ring cannot overrun, but none of it is ever
/// interleaved into the command stream.
pub struct Multiplexer {
    ports: Vec<Box<dyn Transport>>,
    last_input: Option<TransportKind>,
    locked: Option<TransportKind>,
}

impl Multiplexer {
    pub fn new() -> Multiplexer {
        Multiplexer {
            ports: Vec::new(),
            last_input: None,
            locked: None,
        }
    }

    /// Registers a transport. Registration order is poll order; register USB
    /// ahead of the UART to match the reference poll sequence.
    pub fn add(&mut self, port: Box<dyn Transport>) {
        self.ports.push(port);
    }

    /// Returns the next session byte, remembering which transport it came
    /// from.
    pub fn poll_byte(&mut self) -> Option<u8> {
        let locked = self.locked;

        for port in &mut self.ports {
            if let Some(kind) = locked {
                if port.kind() != kind {
                    while port.poll_byte().is_some() {}
                    continue;
                }
            }

            if let Some(byte) = port.poll_byte() {
                self.last_input = Some(port.kind());
                return Some(byte);
            }
        }

        None
    }

    /// Transmits `buf` on the locked transport; suppressed while unlocked.
    pub fn write(&mut self, buf: &[u8]) {
        let locked = match self.locked {
            Some(kind) => kind,
            None => return,
        };

        for port in &mut self.ports {
            if port.kind() == locked {
                port.write(buf);
            }
        }
    }

    /// Pins the session to the transport that delivered the most recent
    /// input. A one-shot transition: later calls are no-ops.
    pub fn lock(&mut self) {
        if self.locked.is_none() {
            self.locked = self.last_input;
        }
    }

    /// The pinned transport, if the session has locked yet.
    pub fn locked(&self) -> Option<TransportKind> {
        self.locked
    }

    /// Forgets the session pinning, as a fresh session entry does; the next
    /// accepted command may lock either transport again.
    pub fn reset(&mut self) {
        self.locked = None;
        self.last_input = None;
    }

    /// Shuts every transport down ahead of the boot hand-off.
    pub fn shutdown(&mut self) {
        for port in &mut self.ports {
            port.shutdown();
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Multiplexer {
        Multiplexer::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    struct FakePort {
        kind: TransportKind,
        input: VecDeque<u8>,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    fn fake(kind: TransportKind, input: &[u8]) -> (FakePort, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let port = FakePort {
            kind,
            input: input.iter().copied().collect(),
            sent: sent.clone(),
        };

        (port, sent)
    }

    impl Transport for FakePort {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn poll_byte(&mut self) -> Option<u8> {
            self.input.pop_front()
        }

        fn write(&mut self, buf: &[u8]) {
            self.sent.lock().unwrap().extend_from_slice(buf);
        }
    }

    #[test]
    fn it_should_preserve_byte_order() {
        let ring = RingBuffer::new();

        for byte in 0..10u8 {
            assert!(ring.push(byte));
        }

        for byte in 0..10u8 {
            assert_eq!(ring.pop(), Some(byte));
        }

        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn it_should_drop_the_newest_byte_when_full() {
        let ring = RingBuffer::new();

        for byte in 0..255u8 {
            assert!(ring.push(byte));
        }

        // 255 slots are usable; the 256th byte is dropped.
        assert!(!ring.push(0xaa));

        for byte in 0..255u8 {
            assert_eq!(ring.pop(), Some(byte));
        }

        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn it_should_wrap_around() {
        let ring = RingBuffer::new();

        for lap in 0..4u32 {
            for i in 0..200u32 {
                assert!(ring.push((lap + i) as u8));
            }

            for i in 0..200u32 {
                assert_eq!(ring.pop(), Some((lap + i) as u8));
            }
        }
    }

    #[test]
    fn it_should_suppress_writes_until_locked() {
        let (usb, usb_sent) = fake(TransportKind::Usb, &[0x21]);
        let mut mux = Multiplexer::new();
        mux.add(Box::new(usb));

        mux.write(&[0x12, 0x10]);
        assert!(usb_sent.lock().unwrap().is_empty());

        assert_eq!(mux.poll_byte(), Some(0x21));
        mux.lock();

        mux.write(&[0x12, 0x10]);
        assert_eq!(*usb_sent.lock().unwrap(), vec![0x12, 0x10]);
    }

    #[test]
    fn it_should_poll_usb_ahead_of_the_uart() {
        let (usb, _) = fake(TransportKind::Usb, &[0x01]);
        let (uart, _) = fake(TransportKind::Uart, &[0x02]);

        let mut mux = Multiplexer::new();
        mux.add(Box::new(usb));
        mux.add(Box::new(uart));

        assert_eq!(mux.poll_byte(), Some(0x01));
        assert_eq!(mux.poll_byte(), Some(0x02));
    }

    #[test]
    fn it_should_only_write_to_the_locked_transport() {
        let (usb, usb_sent) = fake(TransportKind::Usb, &[]);
        let (uart, uart_sent) = fake(TransportKind::Uart, &[0x21]);

        let mut mux = Multiplexer::new();
        mux.add(Box::new(usb));
        mux.add(Box::new(uart));

        assert_eq!(mux.poll_byte(), Some(0x21));
        mux.lock();
        assert_eq!(mux.locked(), Some(TransportKind::Uart));

        mux.write(&[0x12, 0x10]);

        assert!(usb_sent.lock().unwrap().is_empty());
        assert_eq!(*uart_sent.lock().unwrap(), vec![0x12, 0x10]);
    }

    #[test]
    fn it_should_discard_input_from_the_unlocked_transport() {
        let (usb, _) = fake(TransportKind::Usb, &[0xaa, 0xbb]);
        let (uart, _) = fake(TransportKind::Uart, &[0x21, 0x20]);

        let mut mux = Multiplexer::new();
        mux.add(Box::new(usb));
        mux.add(Box::new(uart));

        // USB delivered the first byte and wins the session.
        assert_eq!(mux.poll_byte(), Some(0xaa));
        mux.lock();
        assert_eq!(mux.locked(), Some(TransportKind::Usb));

        // The UART bytes are drained, never surfaced.
        assert_eq!(mux.poll_byte(), Some(0xbb));
        assert_eq!(mux.poll_byte(), None);
    }

    #[test]
    fn it_should_keep_the_first_lock() {
        let (usb, _) = fake(TransportKind::Usb, &[0x01]);
        let (uart, _) = fake(TransportKind::Uart, &[0x02, 0x03]);

        let mut mux = Multiplexer::new();
        mux.add(Box::new(usb));
        mux.add(Box::new(uart));

        assert_eq!(mux.poll_byte(), Some(0x01));
        mux.lock();

        // Further input cannot re-pin the session.
        assert_eq!(mux.poll_byte(), None);
        mux.lock();
        assert_eq!(mux.locked(), Some(TransportKind::Usb));
    }

    #[test]
    fn it_should_forget_the_lock_on_reset() {
        let (usb, _) = fake(TransportKind::Usb, &[0x01]);
        let (uart, _) = fake(TransportKind::Uart, &[0x02]);

        let mut mux = Multiplexer::new();
        mux.add(Box::new(usb));
        mux.add(Box::new(uart));

        assert_eq!(mux.poll_byte(), Some(0x01));
        mux.lock();
        assert_eq!(mux.locked(), Some(TransportKind::Usb));

        mux.reset();
        assert_eq!(mux.locked(), None);

        // The next session may pin the other transport.
        assert_eq!(mux.poll_byte(), Some(0x02));
        mux.lock();
        assert_eq!(mux.locked(), Some(TransportKind::Uart));
    }
}
