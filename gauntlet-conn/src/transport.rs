//! Raw transport abstraction.
//!
//! The connection only ever sees [`RawTransport`]: something that can push
//! encoded frames toward the socket layer and hand back whatever arrived.
//! Probes run against [`LoopbackTransport`] (fully in-memory, records every
//! frame that reached the "socket"); live runs bridge to an I/O task via
//! [`ChannelTransport`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::mpsc;

use crate::error::{ConnError, ConnResult};

/// Socket-level send filter.
///
/// Given the encoded frame size, decide whether the send may reach the
/// wire. The packet-size probe uses this to block every send that does not
/// match the currently targeted exact size, turning a fuzzy try-and-observe
/// loop into a controlled convergence procedure.
pub type SendFilter = Box<dyn Fn(usize) -> bool>;

/// Something that moves raw frames to and from the socket layer.
pub trait RawTransport {
    /// Push one encoded frame toward the socket.
    ///
    /// Returns the bytes that actually reached the socket layer, after any
    /// transport-level transform (compression, padding). Callers use the
    /// returned length to observe what the wire really carried.
    fn send(&mut self, frame: &[u8]) -> ConnResult<Vec<u8>>;

    /// Drain frames received since the last poll.
    fn poll_received(&mut self) -> Vec<Vec<u8>>;

    /// Whether the transport can still carry data.
    fn is_open(&self) -> bool;

    /// Close the transport. Idempotent.
    fn close(&mut self);
}

impl RawTransport for Box<dyn RawTransport> {
    fn send(&mut self, frame: &[u8]) -> ConnResult<Vec<u8>> {
        (**self).send(frame)
    }

    fn poll_received(&mut self) -> Vec<Vec<u8>> {
        (**self).poll_received()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

// Shared handles let a test keep inspecting a transport it handed to the
// connection. Single-threaded harness, so Rc<RefCell> suffices.
impl<T: RawTransport> RawTransport for Rc<RefCell<T>> {
    fn send(&mut self, frame: &[u8]) -> ConnResult<Vec<u8>> {
        self.borrow_mut().send(frame)
    }

    fn poll_received(&mut self) -> Vec<Vec<u8>> {
        self.borrow_mut().poll_received()
    }

    fn is_open(&self) -> bool {
        self.borrow().is_open()
    }

    fn close(&mut self) {
        self.borrow_mut().close()
    }
}

/// Fully in-memory transport for deterministic tests.
///
/// Sent frames are recorded; inbound frames are injected by the test.
/// An optional transform models transport-level rewriting (compression,
/// padding) between the logical frame and the socket bytes.
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    closed: bool,
    transform: Option<Box<dyn Fn(&[u8]) -> Vec<u8>>>,
}

impl LoopbackTransport {
    /// Create an open loopback transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle suitable for handing to a connection while
    /// keeping inspection access.
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Install a transport-level transform applied to every send.
    pub fn with_transform(mut self, transform: impl Fn(&[u8]) -> Vec<u8> + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    /// Frames that reached the socket layer, in send order.
    pub fn sent_frames(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Size of the last frame that reached the socket layer.
    pub fn last_sent_size(&self) -> Option<usize> {
        self.sent.last().map(Vec::len)
    }

    /// Queue a frame for the next receive poll.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }
}

impl RawTransport for LoopbackTransport {
    fn send(&mut self, frame: &[u8]) -> ConnResult<Vec<u8>> {
        if self.closed {
            return Err(ConnError::TransportClosed);
        }

        let socket_bytes = match &self.transform {
            Some(transform) => transform(frame),
            None => frame.to_vec(),
        };
        self.sent.push(socket_bytes.clone());
        Ok(socket_bytes)
    }

    fn poll_received(&mut self) -> Vec<Vec<u8>> {
        self.inbound.drain(..).collect()
    }

    fn is_open(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Transport bridged to an I/O task over unbounded channels.
///
/// The harness side stays synchronous; a socket pump on the runtime owns
/// the actual stream and the far ends of both channels.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: bool,
}

impl ChannelTransport {
    /// Build a transport plus the channel ends for the socket pump.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
                closed: false,
            },
            out_rx,
            in_tx,
        )
    }
}

impl RawTransport for ChannelTransport {
    fn send(&mut self, frame: &[u8]) -> ConnResult<Vec<u8>> {
        if self.closed {
            return Err(ConnError::TransportClosed);
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| ConnError::TransportClosed)?;
        Ok(frame.to_vec())
    }

    fn poll_received(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.inbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn is_open(&self) -> bool {
        !self.closed && !self.outbound.is_closed()
    }

    fn close(&mut self) {
        self.closed = true;
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_records_sends() {
        let mut transport = LoopbackTransport::new();
        assert_eq!(transport.send(b"abc").expect("send").len(), 3);
        assert_eq!(transport.send(b"defg").expect("send").len(), 4);
        assert_eq!(transport.sent_frames().len(), 2);
        assert_eq!(transport.last_sent_size(), Some(4));
    }

    #[test]
    fn test_loopback_transform_changes_socket_bytes() {
        // Model a transport that pads every frame by four bytes
        let mut transport =
            LoopbackTransport::new().with_transform(|frame| [frame, &[0u8; 4][..]].concat());

        assert_eq!(transport.send(b"abcd").expect("send").len(), 8);
        assert_eq!(transport.last_sent_size(), Some(8));
    }

    #[test]
    fn test_loopback_close_rejects_sends() {
        let mut transport = LoopbackTransport::new();
        transport.close();
        transport.close(); // idempotent
        assert!(matches!(
            transport.send(b"x"),
            Err(ConnError::TransportClosed)
        ));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_loopback_inject_and_poll() {
        let mut transport = LoopbackTransport::new();
        transport.inject(b"one".to_vec());
        transport.inject(b"two".to_vec());

        let frames = transport.poll_received();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(transport.poll_received().is_empty());
    }

    #[test]
    fn test_shared_handle_keeps_inspection_access() {
        let shared = LoopbackTransport::shared();
        let mut handle = shared.clone();

        handle.send(b"frame").expect("send");
        assert_eq!(shared.borrow().sent_frames().len(), 1);
    }

    #[test]
    fn test_channel_transport_bridging() {
        let (mut transport, mut out_rx, in_tx) = ChannelTransport::pair();

        transport.send(b"frame").expect("send");
        assert_eq!(out_rx.try_recv().expect("frame"), b"frame".to_vec());

        in_tx.send(b"reply".to_vec()).expect("inject");
        assert_eq!(transport.poll_received(), vec![b"reply".to_vec()]);

        transport.close();
        assert!(matches!(
            transport.send(b"late"),
            Err(ConnError::TransportClosed)
        ));
    }
}
