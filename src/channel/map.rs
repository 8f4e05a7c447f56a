use super::frame::{is_valid_name, Frame, FrameKind, MAX_PAYLOAD};
use crate::{
    errors::{Error, Result},
    queue::ByteQueue,
    server::handler::Liveness,
};
use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, warn};

/// Buffered inbound bytes at which the peer is asked to pause a channel.
pub const YIELD_FACTOR: usize = 6;
/// Buffered inbound bytes at which the connection is dropped.
pub const FATAL_FACTOR: usize = 20;
/// A yielded channel drained to this level lets the peer resume.
pub const CONTINUE_FACTOR: usize = 4;
/// Outbound bytes below which a channel accepts more uploads.
pub const UPLOAD_FACTOR: usize = 2;

/// Flow-control signal waiting to be sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Yield(String),
    Continue(String),
}

impl Signal {
    pub fn into_frame(self) -> Frame {
        match self {
            Signal::Yield(name) => Frame::signal(FrameKind::Yield, name),
            Signal::Continue(name) => Frame::signal(FrameKind::Continue, name),
        }
    }
}

#[derive(Debug, Default)]
struct Channel {
    rx: ByteQueue,
    tx: ByteQueue,
    /// We asked the peer to pause.
    yielded: bool,
    /// The peer asked us to pause.
    yield_set_by_peer: bool,
}

/// Named logical channels sharing one connection.
///
/// Each channel has its own inbound and outbound queue and is flow
/// controlled on its own, in multiples of the socket buffer size:
///
/// | inbound buffered | effect                                        |
/// |------------------|-----------------------------------------------|
/// | `>= 6x`          | `Yield` queued for the peer                   |
/// | `<= 4x`          | `Continue` queued if the channel was yielded  |
/// | `>= 20x`         | fatal, the attached connection is closed      |
///
/// A channel accepts uploads while the peer has not yielded it and its
/// outbound queue holds less than `2x`.
///
/// Channels are created on first use by name and live until
/// [`clear`](Self::clear) or the map is dropped with its connection.
#[derive(Debug)]
pub struct ChannelMap {
    channels: HashMap<String, Channel>,
    order: Vec<String>,
    cursor: usize,
    signals: VecDeque<Signal>,
    unit: usize,
    liveness: Option<Arc<Liveness>>,
}

impl ChannelMap {
    /// `socket_buffer_size` is the unit for every threshold.
    pub fn new(socket_buffer_size: usize) -> Self {
        Self {
            channels: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
            signals: VecDeque::new(),
            unit: socket_buffer_size.max(1),
            liveness: None,
        }
    }

    /// Connection closed when a channel overflows.
    pub fn attach(&mut self, liveness: Arc<Liveness>) {
        self.liveness = Some(liveness);
    }

    fn channel(&mut self, name: &str) -> &mut Channel {
        if !self.channels.contains_key(name) {
            self.order.push(name.to_owned());
        }
        self.channels.entry(name.to_owned()).or_default()
    }

    /// Buffers inbound `data` for `name`.
    ///
    /// Fails with [`Error::MalformedFrame`] for names a frame cannot carry.
    pub fn deliver(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if !is_valid_name(name) {
            return Err(Error::MalformedFrame);
        }
        let unit = self.unit;
        let channel = self.channel(name);
        channel.rx.add(data);
        let buffered = channel.rx.len();

        if buffered >= FATAL_FACTOR * unit {
            warn!(channel = name, buffered, "channel overflow, dropping connection");
            if let Some(liveness) = &self.liveness {
                liveness.close();
            }
            return Err(Error::ChannelOverflow {
                name: name.to_owned(),
                buffered,
            });
        }

        if buffered >= YIELD_FACTOR * unit && !channel.yielded {
            channel.yielded = true;
            debug!(channel = name, buffered, "asking peer to yield");
            self.signals.push_back(Signal::Yield(name.to_owned()));
        }
        Ok(())
    }

    /// Consumes up to `max` inbound bytes of `name`.
    pub fn read(&mut self, name: &str, max: usize) -> Bytes {
        let unit = self.unit;
        let Some(channel) = self.channels.get_mut(name) else {
            return Bytes::new();
        };
        let count = max.min(channel.rx.len());
        let data = channel.rx.remove_exact(count).unwrap_or_default();

        if channel.yielded && channel.rx.len() <= CONTINUE_FACTOR * unit {
            channel.yielded = false;
            debug!(channel = name, buffered = channel.rx.len(), "letting peer continue");
            self.signals.push_back(Signal::Continue(name.to_owned()));
        }
        data
    }

    #[inline]
    pub fn is_ready_for_more_uploads(&self, name: &str) -> bool {
        match self.channels.get(name) {
            Some(channel) => !channel.yield_set_by_peer && channel.tx.len() < UPLOAD_FACTOR * self.unit,
            None => true,
        }
    }

    /// Queues outbound `data` on `name`.
    ///
    /// Refused with [`Error::ChannelBusy`] while the channel is not ready
    /// for more uploads, and with [`Error::MalformedFrame`] for names a
    /// frame cannot carry.
    pub fn upload(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if !is_valid_name(name) {
            return Err(Error::MalformedFrame);
        }
        if !self.is_ready_for_more_uploads(name) {
            return Err(Error::ChannelBusy(name.to_owned()));
        }
        self.channel(name).tx.add(data);
        Ok(())
    }

    pub fn peer_yield(&mut self, name: &str) {
        self.channel(name).yield_set_by_peer = true;
    }

    pub fn peer_continue(&mut self, name: &str) {
        self.channel(name).yield_set_by_peer = false;
    }

    /// Applies one frame received from the peer.
    pub fn apply(&mut self, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Data => self.deliver(&frame.name, &frame.payload),
            FrameKind::Yield => {
                self.peer_yield(&frame.name);
                Ok(())
            }
            FrameKind::Continue => {
                self.peer_continue(&frame.name);
                Ok(())
            }
        }
    }

    /// Takes the pending flow-control signals, oldest first.
    pub fn take_signals(&mut self) -> Vec<Signal> {
        self.signals.drain(..).collect()
    }

    /// Next frame to send: pending signals first, then data from channels
    /// the peer has not yielded, one channel after the other.
    pub fn next_frame(&mut self, max_payload: usize) -> Option<Frame> {
        if let Some(signal) = self.signals.pop_front() {
            return Some(signal.into_frame());
        }

        let max_payload = max_payload.clamp(1, MAX_PAYLOAD);
        let count = self.order.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let name = &self.order[index];
            let Some(channel) = self.channels.get_mut(name) else {
                continue;
            };
            if channel.yield_set_by_peer || channel.tx.is_empty() || !is_valid_name(name) {
                continue;
            }

            let take = max_payload.min(channel.tx.len());
            let payload = channel.tx.remove_exact(take).unwrap_or_default();
            self.cursor = (index + 1) % count;
            return Some(Frame::data(name.clone(), payload));
        }
        None
    }

    /// Decodes and applies every complete frame in `input`.
    pub fn ingest(&mut self, input: &mut ByteQueue) -> Result<usize> {
        let mut applied = 0;
        while let Some(frame) = Frame::decode(input)? {
            self.apply(frame)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Encodes pending frames into `out` until about `budget` bytes were written.
    pub fn emit(&mut self, out: &mut ByteQueue, budget: usize) -> Result<usize> {
        let mut written = 0;
        while written < budget {
            let Some(frame) = self.next_frame(budget - written) else {
                break;
            };
            frame.encode(out)?;
            written += frame.encoded_len();
        }
        Ok(written)
    }

    /// Inbound bytes waiting to be read on `name`.
    pub fn buffered(&self, name: &str) -> usize {
        self.channels.get(name).map_or(0, |channel| channel.rx.len())
    }

    /// Outbound bytes waiting to be sent on `name`.
    pub fn pending_upload(&self, name: &str) -> usize {
        self.channels.get(name).map_or(0, |channel| channel.tx.len())
    }

    /// `true` while the peer has `name` yielded.
    pub fn is_paused_by_peer(&self, name: &str) -> bool {
        self.channels
            .get(name)
            .is_some_and(|channel| channel.yield_set_by_peer)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Disposes every channel with its queues and pending signals.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.order.clear();
        self.signals.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod map_tests {
    use super::*;
    use crate::{channel::frame::MAX_NAME, server::handler::next_id};

    const UNIT: usize = 10;

    #[test]
    fn yield_continue_and_overflow() {
        let mut map = ChannelMap::new(UNIT);
        let liveness = Liveness::new(next_id());
        map.attach(liveness.clone());

        map.deliver("video", &[0; 59]).unwrap();
        assert!(map.take_signals().is_empty());

        map.deliver("video", &[0; 1]).unwrap();
        assert_eq!(map.take_signals(), [Signal::Yield("video".into())]);

        // Already yielded, no second signal.
        map.deliver("video", &[0; 100]).unwrap();
        assert!(map.take_signals().is_empty());
        assert_eq!(map.buffered("video"), 160);

        assert_eq!(map.read("video", 119).len(), 119);
        assert!(map.take_signals().is_empty());
        map.read("video", 1);
        assert_eq!(map.take_signals(), [Signal::Continue("video".into())]);
        assert_eq!(map.buffered("video"), 40);

        assert!(!liveness.is_closed());
        let err = map.deliver("video", &[0; 160]).unwrap_err();
        assert!(matches!(err, Error::ChannelOverflow { buffered: 200, .. }));
        assert!(liveness.is_closed());
    }

    #[test]
    fn channels_are_independent() {
        let mut map = ChannelMap::new(UNIT);

        map.deliver("slow", &[0; 70]).unwrap();
        map.deliver("fast", &[0; 5]).unwrap();
        assert_eq!(map.take_signals(), [Signal::Yield("slow".into())]);

        assert_eq!(map.read("fast", 100).len(), 5);
        assert!(map.take_signals().is_empty());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn upload_gate() {
        #[rustfmt::skip]
        let cases = [
            // pending, peer yielded, ready
            (0,  false, true),
            (19, false, true),
            (20, false, false),
            (0,  true,  false),
        ];

        for (pending, yielded, ready) in cases {
            let mut map = ChannelMap::new(UNIT);
            map.upload("c", &vec![0; pending]).unwrap();
            if yielded {
                map.peer_yield("c");
            }

            assert_eq!(map.is_ready_for_more_uploads("c"), ready, "{pending} {yielded}");
            assert_eq!(map.upload("c", b"x").is_ok(), ready);
        }

        let map = ChannelMap::new(UNIT);
        assert!(map.is_ready_for_more_uploads("unknown"));
    }

    #[test]
    fn frames_round_robin() {
        let mut map = ChannelMap::new(UNIT);
        map.upload("a", b"aaaa").unwrap();
        map.upload("b", b"bb").unwrap();
        map.deliver("c", &[0; 60]).unwrap();

        let names: Vec<(FrameKind, String, usize)> = std::iter::from_fn(|| map.next_frame(2))
            .map(|frame| (frame.kind, frame.name, frame.payload.len()))
            .collect();

        #[rustfmt::skip]
        assert_eq!(names, [
            (FrameKind::Yield, "c".to_owned(), 0),
            (FrameKind::Data,  "a".to_owned(), 2),
            (FrameKind::Data,  "b".to_owned(), 2),
            (FrameKind::Data,  "a".to_owned(), 2),
        ]);
    }

    #[test]
    fn peer_yield_pauses_sending() {
        let mut map = ChannelMap::new(UNIT);
        map.upload("a", b"data").unwrap();
        map.peer_yield("a");
        assert!(map.next_frame(100).is_none());
        assert!(map.is_paused_by_peer("a"));

        map.peer_continue("a");
        assert_eq!(map.next_frame(100).unwrap().payload, &b"data"[..]);
    }

    #[test]
    fn backpressure_between_peers() {
        let mut sender = ChannelMap::new(UNIT);
        let mut receiver = ChannelMap::new(UNIT);
        let mut wire = ByteQueue::new();

        // Uploads are gated at 2x, so feed the sender in steps.
        for _ in 0..4 {
            sender.upload("bulk", &[7; 15]).unwrap();
            sender.emit(&mut wire, 1024).unwrap();
        }
        receiver.ingest(&mut wire).unwrap();
        assert_eq!(receiver.buffered("bulk"), 60);

        receiver.emit(&mut wire, 1024).unwrap();
        assert_eq!(sender.ingest(&mut wire).unwrap(), 1);
        assert!(sender.is_paused_by_peer("bulk"));
        assert!(sender.upload("bulk", b"more").is_err());

        receiver.read("bulk", 30);
        receiver.emit(&mut wire, 1024).unwrap();
        sender.ingest(&mut wire).unwrap();
        assert!(sender.is_ready_for_more_uploads("bulk"));
    }

    #[test]
    fn unframeable_names_rejected() {
        let long = "n".repeat(MAX_NAME + 1);
        let mut map = ChannelMap::new(UNIT);

        for name in ["", long.as_str()] {
            assert!(matches!(map.upload(name, b"payload"), Err(Error::MalformedFrame)));
            assert!(matches!(map.deliver(name, b"payload"), Err(Error::MalformedFrame)));
            assert!(!map.contains(name));
            assert_eq!(map.pending_upload(name), 0);
        }

        let widest = "n".repeat(MAX_NAME);
        map.upload(&widest, b"payload").unwrap();

        let mut wire = ByteQueue::new();
        map.emit(&mut wire, 1024).unwrap();
        let frame = Frame::decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.name, widest);
        assert_eq!(frame.payload, &b"payload"[..]);
        assert_eq!(map.pending_upload(&widest), 0);
    }

    #[test]
    fn malformed_input_fails_ingest() {
        let mut map = ChannelMap::new(UNIT);
        let mut input = ByteQueue::from(&[7u8, 1, 0, 0, 0, 0, b'a'][..]);
        assert!(matches!(map.ingest(&mut input), Err(Error::MalformedFrame)));
    }

    #[test]
    fn clear_disposes_channels() {
        let mut map = ChannelMap::new(UNIT);
        map.deliver("a", &[0; 80]).unwrap();
        map.upload("b", b"x").unwrap();

        map.clear();
        assert!(map.is_empty());
        assert!(!map.contains("a"));
        assert!(map.take_signals().is_empty());
        assert!(map.next_frame(10).is_none());
    }
}
