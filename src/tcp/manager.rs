//! TCB manager: routes ingress segments by four-tuple, owns the set of
//! listeners, creates a TCB in LISTEN the first time a segment for a
//! registered local endpoint arrives with no existing TCB.
//!
//! One namespace owns one `TcpManager` as an ordinary field rather than a
//! global singleton, so an embedder can run several independent stacks.

use std::collections::{HashMap, VecDeque};

use crate::addr::{Endpoint, FourTuple};
use crate::result::{Error, Result};
use crate::tcp::header::{TcpHeader, TcpOption};
use crate::tcp::tcb::{Segment, Tcb, TcbOutput};

type ConnectCallback = Box<dyn FnOnce(Result<()>)>;
type AcceptCallback = Box<dyn FnOnce(FourTuple)>;

/// `{local endpoint, protocol, accept-callback queue}`. This crate only
/// ever multiplexes TCP, so "protocol" is implicit in the type.
#[derive(Default)]
pub struct Listener {
    /// four-tuples whose handshake completed and are awaiting `accept`.
    ready: VecDeque<FourTuple>,
    /// parked acceptors, fired in arrival order as connections complete.
    parked: VecDeque<AcceptCallback>,
}

impl Listener {
    fn offer(&mut self, four_tuple: FourTuple) {
        if let Some(cb) = self.parked.pop_front() {
            cb(four_tuple);
        } else {
            self.ready.push_back(four_tuple);
        }
    }

    /// Returns a ready four-tuple immediately, else parks `cb`.
    fn accept(&mut self, cb: AcceptCallback) {
        if let Some(four_tuple) = self.ready.pop_front() {
            cb(four_tuple);
        } else {
            self.parked.push_back(cb);
        }
    }
}

/// A namespace-level observer consulted before normal dispatch.
pub struct InterceptRule {
    pub matches: Box<dyn Fn(&FourTuple) -> bool>,
    pub on_match: Box<dyn FnMut(&FourTuple, &[u8])>,
}

/// Segments the manager wants transmitted, tagged with the four-tuple they
/// belong to so the caller knows which IPv4 endpoints to encapsulate with.
pub struct Outgoing {
    pub four_tuple: FourTuple,
    pub segment: Segment,
}

#[derive(Default)]
pub struct TcpManager {
    tcbs: HashMap<FourTuple, Tcb>,
    listeners: HashMap<Endpoint, Listener>,
    intercepts: Vec<InterceptRule>,
    connect_callbacks: HashMap<FourTuple, ConnectCallback>,
}

impl TcpManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&mut self, local: Endpoint) {
        self.listeners.entry(local).or_default();
    }

    pub fn unlisten(&mut self, local: Endpoint) {
        self.listeners.remove(&local);
    }

    pub fn add_intercept(&mut self, rule: InterceptRule) {
        self.intercepts.push(rule);
    }

    /// Registers an acceptor for `local`; fires immediately if a completed
    /// handshake is already queued.
    pub fn accept(&mut self, local: Endpoint, cb: AcceptCallback) -> Result<()> {
        let listener = self
            .listeners
            .get_mut(&local)
            .ok_or(Error::AddrNotAvailable)?;
        listener.accept(cb);
        Ok(())
    }

    /// Non-parking accept: pops a completed handshake if one is already
    /// queued, else returns `Ok(None)`. Backs the synchronous embedder
    /// `accept(fd)`; see `accept` above for the parking variant.
    pub fn try_accept(&mut self, local: Endpoint) -> Result<Option<FourTuple>> {
        let listener = self
            .listeners
            .get_mut(&local)
            .ok_or(Error::AddrNotAvailable)?;
        Ok(listener.ready.pop_front())
    }

    /// Non-parking read: drains whatever is already buffered for
    /// `four_tuple`, else `None`. Backs the synchronous embedder
    /// `read(fd, buf)`.
    pub fn read_ready(&mut self, four_tuple: &FourTuple, max: usize) -> Option<Vec<u8>> {
        self.tcbs.get_mut(four_tuple)?.drain_ready(max)
    }

    pub fn tcb_mut(&mut self, four_tuple: &FourTuple) -> Option<&mut Tcb> {
        self.tcbs.get_mut(four_tuple)
    }

    pub fn contains(&self, four_tuple: &FourTuple) -> bool {
        self.tcbs.contains_key(four_tuple)
    }

    /// Active open: allocates a TCB in SYN_SENT and returns the initial
    /// SYN to transmit.
    pub fn connect(&mut self, four_tuple: FourTuple, our_mss: u16, cb: ConnectCallback) -> Segment {
        let (tcb, syn) = Tcb::start_connect(four_tuple, our_mss);
        self.tcbs.insert(four_tuple, tcb);
        self.connect_callbacks.insert(four_tuple, cb);
        syn
    }

    /// `None` if `four_tuple` names no live TCB; the socket façade maps that
    /// onto `Error::UnknownFd` for its fd-keyed embedder API.
    pub fn write_app_data(&mut self, four_tuple: &FourTuple, bytes: &[u8]) -> Option<Result<Vec<Segment>>> {
        Some(self.tcbs.get_mut(four_tuple)?.write_app_data(bytes))
    }

    pub fn read_some(
        &mut self,
        four_tuple: &FourTuple,
        capacity: usize,
        cb: Box<dyn FnOnce(Result<Vec<u8>>)>,
    ) -> Option<()> {
        self.tcbs.get_mut(four_tuple)?.read_some(capacity, cb);
        Some(())
    }

    /// Closes a connection: emits our FIN immediately and fails any parked
    /// reader rather than silently dropping it.
    pub fn close(&mut self, four_tuple: &FourTuple) -> Option<Segment> {
        let tcb = self.tcbs.get_mut(four_tuple)?;
        tcb.abort_pending_reader();
        Some(tcb.close())
    }

    /// Feeds one ingress segment for `four_tuple` into the manager. Creates
    /// a TCB in LISTEN on first contact with a registered listener;
    /// otherwise drops segments with no matching TCB or listener (a
    /// well-formed stack would RST; this design logs and drops).
    pub fn on_segment(
        &mut self,
        four_tuple: FourTuple,
        header: &TcpHeader,
        options: &[TcpOption],
        payload: &[u8],
        our_mss: u16,
    ) -> Vec<Outgoing> {
        for rule in &mut self.intercepts {
            if (rule.matches)(&four_tuple) {
                (rule.on_match)(&four_tuple, payload);
            }
        }

        if !self.tcbs.contains_key(&four_tuple) {
            if !self.listeners.contains_key(&four_tuple.local) {
                log::debug!("segment for unknown four-tuple {}, dropping", four_tuple);
                return Vec::new();
            }
            self.tcbs
                .insert(four_tuple, Tcb::new_listen(four_tuple, our_mss));
        }

        let tcb = self.tcbs.get_mut(&four_tuple).expect("just inserted or present");
        let was_established = tcb.state == crate::tcp::tcb::TcbState::Established;
        let out = tcb.on_segment(header, options, payload);

        self.apply_output(four_tuple, out, was_established)
    }

    fn apply_output(&mut self, four_tuple: FourTuple, out: TcbOutput, was_established: bool) -> Vec<Outgoing> {
        if out.established && !was_established {
            if let Some(cb) = self.connect_callbacks.remove(&four_tuple) {
                // active-open side: our own `connect` resolved.
                cb(Ok(()));
            } else if let Some(listener) = self.listeners.get_mut(&four_tuple.local) {
                // passive-open side: hand the completed handshake to the
                // listener's acceptor queue.
                listener.offer(four_tuple);
            }
        }

        let outgoing = out
            .segments
            .into_iter()
            .map(|segment| Outgoing { four_tuple, segment })
            .collect();

        if out.should_remove {
            self.tcbs.remove(&four_tuple);
        }

        outgoing
    }
}
