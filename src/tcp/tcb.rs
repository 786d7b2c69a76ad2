//! The TCB — the per-connection state machine: the RFC 793 state set, a
//! `next_state` shadow used to defer a transition until its triggering
//! segment is emitted, `seq_nr_unack`/`seq_nr_next` bookkeeping, and
//! segment-acceptability/ACK/FIN handling, expressed as owned Rust state
//! rather than a node in a scheduler.

use rand::Rng;

use crate::addr::FourTuple;
use crate::meta::DEFAULT_MSS;
use crate::result::{Error, Result};
use crate::tcp::header::{TcpFlags, TcpHeader, TcpOption};
use crate::tcp::ring::ByteRing;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TcbState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// RFC 793 send sequence variables. `unack`/`next` are this design's
/// `seq_nr_unack`/`seq_nr_next`.
#[derive(Copy, Clone, Debug, Default)]
pub struct SendSequenceSpace {
    pub unack: u32,
    pub next: u32,
    pub window: u16,
    pub mss: u16,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ReceiveSequenceSpace {
    pub next: u32,
    pub window: u16,
    pub mss: u16,
}

/// A fully-built outbound segment, ready for the TCP-framing layer to
/// checksum and hand to IPv4.
pub struct Segment {
    pub header: TcpHeader,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

struct PendingRead {
    capacity: usize,
    callback: Box<dyn FnOnce(Result<Vec<u8>>)>,
}

/// Output of feeding one ingress segment (or one app-data write) into a TCB:
/// segments to transmit now, and whether this call flipped the TCB into
/// ESTABLISHED or retired it entirely.
#[derive(Default)]
pub struct TcbOutput {
    pub segments: Vec<Segment>,
    pub established: bool,
    pub should_remove: bool,
}

pub struct Tcb {
    pub four_tuple: FourTuple,
    pub state: TcbState,
    next_state: TcbState,
    pub send: SendSequenceSpace,
    pub recv: ReceiveSequenceSpace,
    send_ring: ByteRing,
    recv_ring: ByteRing,
    pending_reader: Option<PendingRead>,
    fin_seq: Option<u32>,
    our_mss: u16,
}

fn generate_isn() -> u32 {
    rand::thread_rng().gen()
}

impl Tcb {
    /// A TCB created in LISTEN when a segment hits a registered
    /// listener with no existing TCB.
    pub fn new_listen(four_tuple: FourTuple, our_mss: u16) -> Self {
        Self {
            four_tuple,
            state: TcbState::Listen,
            next_state: TcbState::Listen,
            send: SendSequenceSpace::default(),
            recv: ReceiveSequenceSpace::default(),
            send_ring: ByteRing::with_capacity(0),
            recv_ring: ByteRing::with_capacity(0),
            pending_reader: None,
            fin_seq: None,
            our_mss,
        }
    }

    /// Active open: builds the initial SYN and returns the TCB
    /// already in SYN_SENT alongside it.
    pub fn start_connect(four_tuple: FourTuple, our_mss: u16) -> (Self, Segment) {
        let isn = generate_isn();
        let mut tcb = Self {
            four_tuple,
            state: TcbState::SynSent,
            next_state: TcbState::SynSent,
            send: SendSequenceSpace {
                unack: isn,
                next: isn.wrapping_add(1),
                window: 0,
                mss: our_mss,
            },
            recv: ReceiveSequenceSpace::default(),
            send_ring: ByteRing::with_capacity(0),
            recv_ring: ByteRing::with_capacity(0),
            pending_reader: None,
            fin_seq: None,
            our_mss,
        };
        let options = vec![
            TcpOption::MaxSegmentSize(our_mss),
            TcpOption::Nop,
            TcpOption::Nop,
            TcpOption::SackPermitted,
        ];
        let syn = tcb.make_segment(TcpFlags { syn: true, ..Default::default() }, options, Vec::new());
        (tcb, syn)
    }

    fn our_fin_acked(&self) -> bool {
        self.fin_seq.map_or(false, |f| seq_gt_or_eq(self.send.unack, f.wrapping_add(1)))
    }

    fn make_segment(&self, mut flags: TcpFlags, options: Vec<TcpOption>, payload: Vec<u8>) -> Segment {
        flags.ack = true;
        // A segment carrying no new data is stamped with seq_nr_unack (the
        // "current" position); a data-carrying segment uses seq_nr_next and
        // the caller advances it afterward.
        let seq = if payload.is_empty() { self.send.unack } else { self.send.next };
        let header = TcpHeader {
            src_port: self.four_tuple.local.port,
            dst_port: self.four_tuple.remote.port,
            seq,
            ack: self.recv.next,
            flags,
            window: self.recv_window_capacity(),
            urgent_pointer: 0,
        };
        Segment {
            header,
            options,
            payload,
        }
    }

    fn recv_window_capacity(&self) -> u16 {
        self.recv_ring.remaining().min(u16::MAX as usize) as u16
    }

    /// Feeds one ingress segment to the TCB.
    pub fn on_segment(&mut self, header: &TcpHeader, options: &[TcpOption], payload: &[u8]) -> TcbOutput {
        match self.state {
            TcbState::Listen => self.handle_listen(header, options),
            TcbState::SynSent => self.handle_syn_sent(header, options),
            _ => self.handle_established_or_later(header, payload),
        }
    }

    fn handle_listen(&mut self, header: &TcpHeader, options: &[TcpOption]) -> TcbOutput {
        if !header.flags.syn {
            return TcbOutput::default();
        }
        let peer_mss = mss_from_options(options).unwrap_or(DEFAULT_MSS);
        self.recv.next = header.seq.wrapping_add(1);
        self.send.window = header.window;
        self.send.mss = peer_mss;
        self.send_ring = ByteRing::with_capacity(header.window.max(1) as usize);
        self.recv_ring = ByteRing::with_capacity(self.our_mss.max(1) as usize * 4);

        let isn = generate_isn();
        self.send.unack = isn;
        self.send.next = isn.wrapping_add(1);
        self.next_state = TcbState::SynReceived;

        let synack = self.make_segment(
            TcpFlags { syn: true, ..Default::default() },
            vec![TcpOption::MaxSegmentSize(self.our_mss)],
            Vec::new(),
        );
        self.state = self.next_state;
        TcbOutput {
            segments: vec![synack],
            ..Default::default()
        }
    }

    fn handle_syn_sent(&mut self, header: &TcpHeader, options: &[TcpOption]) -> TcbOutput {
        if !(header.flags.syn && header.flags.ack) {
            return TcbOutput::default();
        }
        if !in_range_inclusive(header.ack, self.send.unack, self.send.next) {
            return TcbOutput::default();
        }
        let peer_mss = mss_from_options(options).unwrap_or(DEFAULT_MSS);
        self.recv.next = header.seq.wrapping_add(1);
        self.send.window = header.window;
        self.send.mss = peer_mss;
        self.send.unack = header.ack;
        self.send_ring = ByteRing::with_capacity(header.window.max(1) as usize);
        self.recv_ring = ByteRing::with_capacity(self.our_mss.max(1) as usize * 4);
        self.next_state = TcbState::Established;
        let ack = self.make_segment(TcpFlags::default(), Vec::new(), Vec::new());
        self.state = self.next_state;
        TcbOutput {
            segments: vec![ack],
            established: true,
            ..Default::default()
        }
    }

    fn handle_established_or_later(&mut self, header: &TcpHeader, payload: &[u8]) -> TcbOutput {
        let seg_len = payload.len() as u32;
        // Use the live window (current `recv_ring` headroom), not the stored
        // `recv.window` snapshot from the handshake: that field is only ever
        // set once and would make every later data segment look unacceptable
        // once the ring has been drained or filled.
        if !segment_acceptable(header.seq, seg_len, self.recv.next, self.recv_window_capacity()) {
            if header.flags.rst {
                return TcbOutput::default();
            }
            let ack = self.make_segment(TcpFlags::default(), Vec::new(), Vec::new());
            return TcbOutput {
                segments: vec![ack],
                ..Default::default()
            };
        }

        if header.flags.rst {
            return TcbOutput {
                should_remove: true,
                ..Default::default()
            };
        }

        let mut out = TcbOutput::default();

        if header.flags.ack {
            match self.state {
                TcbState::SynReceived => {
                    if in_range_inclusive(header.ack, self.send.unack, self.send.next) {
                        self.send.unack = header.ack;
                        self.state = TcbState::Established;
                        self.next_state = TcbState::Established;
                        out.established = true;
                    } else {
                        out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
                        return out;
                    }
                }
                TcbState::Established
                | TcbState::FinWait1
                | TcbState::FinWait2
                | TcbState::CloseWait
                | TcbState::Closing => {
                    if seq_gt(header.ack, self.send.next) {
                        out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
                        return out;
                    }
                    if seq_gt(header.ack, self.send.unack) {
                        let newly_acked = header.ack.wrapping_sub(self.send.unack) as usize;
                        self.send_ring.erase_begin(newly_acked);
                        self.send.unack = header.ack;
                    }
                    match self.state {
                        TcbState::FinWait1 if self.our_fin_acked() => self.next_state = TcbState::FinWait2,
                        TcbState::Closing if self.our_fin_acked() => self.next_state = TcbState::TimeWait,
                        _ => {}
                    }
                }
                TcbState::LastAck => {
                    self.next_state = TcbState::Closed;
                    self.state = TcbState::Closed;
                    return TcbOutput {
                        should_remove: true,
                        ..Default::default()
                    };
                }
                TcbState::TimeWait => {
                    out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
                    return out;
                }
                _ => {}
            }
        }

        if !payload.is_empty()
            && matches!(
                self.state,
                TcbState::Established | TcbState::FinWait1 | TcbState::FinWait2
            )
        {
            self.deliver_data(header.seq, payload, &mut out);
        }

        if header.flags.fin {
            self.handle_fin(&mut out);
        }

        self.state = self.next_state;
        out
    }

    /// Data ingress: hands bytes to a pending reader first, spilling the
    /// remainder into the receive ring. `recv.next` advances by the full
    /// segment as soon as it is accepted here (handed off or buffered);
    /// draining the ring into a later `read` moves already-accounted bytes
    /// and must not advance it again. Every accepted segment gets an ACK,
    /// including the out-of-order case, so the peer sees our current
    /// `recv.next` rather than being left to time out.
    fn deliver_data(&mut self, seg_seq: u32, payload: &[u8], out: &mut TcbOutput) {
        if seg_seq != self.recv.next {
            // Out-of-order w.r.t. our simplified single-segment reassembly;
            // the acceptability check already bounded it within the window,
            // but only in-order bytes are delivered (no reassembly queue).
            out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
            return;
        }
        if let Some(reader) = self.pending_reader.take() {
            let take = payload.len().min(reader.capacity);
            (reader.callback)(Ok(payload[..take].to_vec()));
            if take < payload.len() {
                let _ = self.recv_ring.push_back(&payload[take..]);
            }
        } else {
            let _ = self.recv_ring.push_back(payload);
        }
        self.recv.next = self.recv.next.wrapping_add(payload.len() as u32);
        out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
    }

    fn handle_fin(&mut self, out: &mut TcbOutput) {
        match self.state {
            TcbState::SynReceived | TcbState::Established => {
                self.recv.next = self.recv.next.wrapping_add(1);
                self.next_state = TcbState::CloseWait;
                out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
            }
            TcbState::FinWait1 => {
                self.recv.next = self.recv.next.wrapping_add(1);
                self.next_state = if self.our_fin_acked() {
                    TcbState::TimeWait
                } else {
                    TcbState::Closing
                };
                out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
            }
            TcbState::FinWait2 => {
                self.recv.next = self.recv.next.wrapping_add(1);
                self.next_state = TcbState::TimeWait;
                out.segments.push(self.make_segment(TcpFlags::default(), Vec::new(), Vec::new()));
            }
            TcbState::CloseWait | TcbState::Closing | TcbState::LastAck | TcbState::TimeWait => {}
            _ => {}
        }
        if self.next_state == TcbState::TimeWait {
            out.should_remove = true;
        }
    }

    /// Data egress: appends application bytes and emits as many MSS-sized
    /// segments as the send window currently allows.
    pub fn write_app_data(&mut self, bytes: &[u8]) -> Result<Vec<Segment>> {
        if bytes.len() > self.send_ring.remaining() {
            return Err(Error::Overflow);
        }
        self.send_ring.push_back(bytes)?;
        Ok(self.drain_send_ring())
    }

    fn drain_send_ring(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();
        loop {
            let unacked = self.send.next.wrapping_sub(self.send.unack) as usize;
            let available = self.send_ring.len().saturating_sub(unacked);
            if available == 0 {
                break;
            }
            let take = available.min(self.send.mss.max(1) as usize);
            let slice = self.send_ring.slice(unacked, take);
            let mut flags = TcpFlags::default();
            flags.psh = !slice.is_empty();
            let segment = self.make_segment(flags, Vec::new(), slice);
            self.send.next = self.send.next.wrapping_add(take as u32);
            segments.push(segment);
        }
        segments
    }

    /// Parks a reader for up to `capacity` bytes; fires immediately if data
    /// is already buffered. `recv.next` was already advanced when the data
    /// was accepted into the ring, so draining it here needs no fresh ACK.
    pub fn read_some(&mut self, capacity: usize, callback: Box<dyn FnOnce(Result<Vec<u8>>)>) {
        if !self.recv_ring.is_empty() {
            let data = self.recv_ring.drain_front(capacity);
            callback(Ok(data));
        } else {
            self.pending_reader = Some(PendingRead { capacity, callback });
        }
    }

    /// Non-parking variant of `read_some`: drains whatever is already
    /// buffered, or `None` if the ring is empty (used by the embedder's
    /// synchronous `read` in preference to parking a callback it has no way
    /// to be woken by later). `recv.next` was already advanced when the data
    /// was accepted into the ring, so draining it here does not touch it and
    /// needs no fresh ACK.
    pub fn drain_ready(&mut self, max: usize) -> Option<Vec<u8>> {
        if self.recv_ring.is_empty() {
            return None;
        }
        Some(self.recv_ring.drain_front(max))
    }

    /// Fails a parked reader with `Aborted` rather than silently dropping it
    /// so a closed socket's parked reader fails rather than hanging.
    pub fn abort_pending_reader(&mut self) {
        if let Some(reader) = self.pending_reader.take() {
            (reader.callback)(Err(Error::Aborted));
        }
    }

    /// Active close: builds our FIN and transitions toward
    /// FIN_WAIT_1.
    pub fn close(&mut self) -> Segment {
        let fin_seq = self.send.next;
        self.fin_seq = Some(fin_seq);
        self.send.next = self.send.next.wrapping_add(1);
        self.next_state = TcbState::FinWait1;
        let header = TcpHeader {
            src_port: self.four_tuple.local.port,
            dst_port: self.four_tuple.remote.port,
            seq: fin_seq,
            ack: self.recv.next,
            flags: TcpFlags { fin: true, ack: true, ..Default::default() },
            window: self.recv_window_capacity(),
            urgent_pointer: 0,
        };
        self.state = self.next_state;
        Segment {
            header,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }
}

fn mss_from_options(options: &[TcpOption]) -> Option<u16> {
    options.iter().find_map(|o| match o {
        TcpOption::MaxSegmentSize(mss) => Some(*mss),
        _ => None,
    })
}

fn in_range_inclusive(x: u32, lo: u32, hi: u32) -> bool {
    // wrap-aware: true if x is reached by counting up from lo to hi
    hi.wrapping_sub(lo) >= x.wrapping_sub(lo)
}

fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn seq_gt_or_eq(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

/// The RFC 793 four-case segment acceptability test.
pub fn segment_acceptable(seg_seq: u32, seg_len: u32, rcv_next: u32, rcv_window: u16) -> bool {
    let w = rcv_window as u32;
    let in_window = |x: u32| in_range_inclusive(x, rcv_next, rcv_next.wrapping_add(w).wrapping_sub(1));
    match (seg_len, w) {
        (0, 0) => seg_seq == rcv_next,
        (0, _) => in_window(seg_seq),
        (_, 0) => false,
        (_, _) => in_window(seg_seq) || in_window(seg_seq.wrapping_add(seg_len).wrapping_sub(1)),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::addr::Endpoint;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    /// A straight-line, non-wrap-aware restatement of the RFC 793 four-case
    /// test, used to check `segment_acceptable` independently of its own
    /// wrap-aware arithmetic over a range small enough that no `u32`
    /// wraparound occurs.
    fn reference_acceptable(seg_seq: u32, seg_len: u32, rcv_next: u32, rcv_window: u32) -> bool {
        match (seg_len, rcv_window) {
            (0, 0) => seg_seq == rcv_next,
            (0, w) => seg_seq >= rcv_next && seg_seq < rcv_next + w,
            (_, 0) => false,
            (len, w) => {
                let seg_end = seg_seq + len - 1;
                let rcv_end = rcv_next + w - 1;
                (seg_seq >= rcv_next && seg_seq <= rcv_end) || (seg_end >= rcv_next && seg_end <= rcv_end)
            }
        }
    }

    proptest! {
        #[test]
        fn segment_acceptable_matches_reference_predicate(
            seg_seq in 0u32..2000,
            seg_len in 0u32..50,
            rcv_next in 0u32..2000,
            rcv_window in 0u32..200,
        ) {
            let expected = reference_acceptable(seg_seq, seg_len, rcv_next, rcv_window);
            let actual = segment_acceptable(seg_seq, seg_len, rcv_next, rcv_window as u16);
            prop_assert_eq!(actual, expected);
        }

        /// Invariant: `send.unack <= send.next <= send.unack + capacity`
        /// holds after writing any sequence of chunks that individually fit
        /// in the remaining window.
        #[test]
        fn send_sequence_invariant_holds_after_writes(
            chunk_lens in proptest::collection::vec(1usize..200, 1..10),
        ) {
            let four_tuple = FourTuple::new(
                Endpoint::new(Ipv4Addr::new(192, 168, 1, 1), 5000),
                Endpoint::new(Ipv4Addr::new(192, 168, 1, 2), 9000),
            );
            let mut tcb = Tcb::new_listen(four_tuple, 1460);
            tcb.state = TcbState::Established;
            tcb.send.mss = 500;
            tcb.send.unack = 1;
            tcb.send.next = 1;
            tcb.send_ring = ByteRing::with_capacity(4096);
            tcb.recv_ring = ByteRing::with_capacity(4096);

            for len in chunk_lens {
                if len > tcb.send_ring.remaining() {
                    continue;
                }
                let data = vec![0u8; len];
                tcb.write_app_data(&data).unwrap();
                let capacity = tcb.send_ring.capacity() as u32;
                prop_assert!(!seq_gt(tcb.send.unack, tcb.send.next));
                prop_assert!(!seq_gt(tcb.send.next, tcb.send.unack.wrapping_add(capacity)));
            }
        }
    }
}
