//! Negotiation state for the single exclusive chat session.
//!
//! At most one peer is ever tracked. The machine is pure: every stimulus goes
//! through [`Negotiation::apply`], which mutates status and returns the side
//! effects (frames to send, console lines, shutdown) for the event loop to
//! execute afterwards. Nothing in here performs I/O, so every transition in
//! the protocol is testable without a socket.
//!
//! Status lifecycle:
//!
//! ```text
//!          connect             connect_ack
//!  Idle ------------> Connecting -----------> Connected
//!   ^  ^                |    |                    |
//!   |  |   connect_wait |    | cancel/abort/      | abort /
//!   |  |                v    | unknown/ctrl-c     | ctrl-c
//!   |  +------------- Waiting                     |
//!   +---------------------------------------------+
//! ```
//!
//! An incoming `connect_req` while Idle does not block on the accept/decline
//! answer. The offer is parked as a pending decision and the next local input
//! line resolves it, so the loop keeps servicing the socket in between.

use crate::message::{Outbound, PeerEndpoint, Request};

/// Negotiation status with the tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No peer. Offers are accepted and a connect can be initiated.
    Idle,
    /// We sent `connect_req` and are waiting for the answer.
    Connecting,
    /// The peer we want is busy with someone else.
    Waiting,
    /// Active relay session with exactly one peer.
    Connected,
}

/// A stimulus for the state machine: either a local user action or a decoded
/// server-delivered request.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Local `connect <ip> <port>` command.
    Connect(PeerEndpoint),
    /// Local `listsocks` command.
    ListSocks,
    /// A non-empty input line while a session is up.
    Chat(String),
    /// Answer to a pending accept/decline question.
    Decision(bool),
    /// Ctrl-c.
    Interrupt,
    /// One decoded frame from the server.
    Request(Request),
}

/// An effect the event loop must carry out after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(Outbound),
    Print(String),
    Shutdown,
}

/// The one connection-negotiation instance of the process.
#[derive(Debug)]
pub struct Negotiation {
    status: Status,
    peer: Option<PeerEndpoint>,
    /// Offerer of an unanswered `connect_req`; only ever set while Idle.
    pending_offer: Option<PeerEndpoint>,
    /// Our own socket address, for marking ourselves in `listsocks` output.
    local: PeerEndpoint,
}

impl Negotiation {
    pub fn new(local: PeerEndpoint) -> Negotiation {
        Negotiation {
            status: Status::Idle,
            peer: None,
            pending_offer: None,
            local,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn peer(&self) -> Option<&PeerEndpoint> {
        self.peer.as_ref()
    }

    /// True while an accept/decline answer is owed for an incoming offer.
    pub fn decision_pending(&self) -> bool {
        self.pending_offer.is_some()
    }

    /// Whether local input belongs in the readiness set. Keystrokes are
    /// ignored while a negotiation is outstanding.
    pub fn input_open(&self) -> bool {
        matches!(self.status, Status::Idle | Status::Connected)
    }

    /// Prompt text for the current status, or None while one is suppressed
    /// (negotiation outstanding, or an offer question on screen).
    pub fn prompt(&self) -> Option<String> {
        if self.decision_pending() {
            return None;
        }
        match self.status {
            Status::Idle => Some("Server>".to_string()),
            Status::Connected => {
                // peer is always Some outside Idle
                self.peer.as_ref().map(|p| format!("{p}>"))
            }
            Status::Connecting | Status::Waiting => None,
        }
    }

    fn tracking(&self, peer: &PeerEndpoint) -> bool {
        self.status != Status::Idle && self.peer.as_ref() == Some(peer)
    }

    fn reset(&mut self) {
        self.status = Status::Idle;
        self.peer = None;
    }

    /// Apply one event and return the side effects to execute. State is
    /// mutated before any effect runs, so a failed send can never leave the
    /// machine half-transitioned.
    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Connect(dst) => self.on_connect(dst),
            Event::ListSocks => vec![Effect::Send(Outbound::ListSocks)],
            Event::Chat(text) => self.on_chat(text),
            Event::Decision(accept) => self.on_decision(accept),
            Event::Interrupt => self.on_interrupt(),
            Event::Request(req) => self.on_request(req),
        }
    }

    fn on_connect(&mut self, dst: PeerEndpoint) -> Vec<Effect> {
        if self.status != Status::Idle || self.decision_pending() {
            return vec![Effect::Print(
                "A negotiation is already in progress".to_string(),
            )];
        }
        log::debug!("connecting to {dst}");
        self.status = Status::Connecting;
        self.peer = Some(dst.clone());
        vec![
            Effect::Send(Outbound::ConnectReq { dst }),
            Effect::Print("Press ctrl+c to abort connect".to_string()),
        ]
    }

    fn on_chat(&mut self, text: String) -> Vec<Effect> {
        match (&self.status, &self.peer) {
            (Status::Connected, Some(dst)) => vec![Effect::Send(Outbound::SendMsg {
                dst: dst.clone(),
                text,
            })],
            // The loop only routes chat lines while Connected; keep a guard
            // instead of a panic.
            _ => vec![Effect::Print("Not connected to a client".to_string())],
        }
    }

    fn on_decision(&mut self, accept: bool) -> Vec<Effect> {
        let Some(offer) = self.pending_offer.take() else {
            log::debug!("decision with no pending offer, ignoring");
            return vec![];
        };
        if accept {
            log::debug!("accepting connect offer from {offer}");
            self.status = Status::Connected;
            self.peer = Some(offer.clone());
            vec![
                Effect::Send(Outbound::ConnectAck { dst: offer }),
                Effect::Print("Connect accepted!".to_string()),
            ]
        } else {
            log::debug!("declining connect offer from {offer}");
            vec![
                Effect::Send(Outbound::ConnectReqCancel { dst: offer }),
                Effect::Print("Connect declined!".to_string()),
            ]
        }
    }

    fn on_interrupt(&mut self) -> Vec<Effect> {
        if let Some(dst) = self.peer.take() {
            self.status = Status::Idle;
            return vec![
                Effect::Send(Outbound::ConnectAbort { dst }),
                Effect::Print("Connection aborted!".to_string()),
            ];
        }
        // An unanswered offer counts as mid-negotiation: decline it rather
        // than tearing the process down under the offerer.
        if let Some(offer) = self.pending_offer.take() {
            return vec![
                Effect::Send(Outbound::ConnectReqCancel { dst: offer }),
                Effect::Print("Connect declined!".to_string()),
            ];
        }
        vec![Effect::Shutdown]
    }

    fn on_request(&mut self, req: Request) -> Vec<Effect> {
        match req {
            Request::ConnectReq { peer } => self.on_connect_req(peer),
            Request::ConnectAck { peer } => self.on_connect_ack(peer),
            Request::ConnectWait { peer } => self.on_connect_wait(peer),
            Request::ConnectAbort { peer } => self.on_connect_abort(peer),
            Request::ConnectReqCancel { peer } => self.on_connect_req_cancel(peer),
            Request::ConnectUnknown { peer } => self.on_connect_unknown(peer),
            Request::SendMsg { peer, text } => {
                log::debug!("chat line from {peer}");
                vec![Effect::Print(format!("\n{text}"))]
            }
            Request::ListSocks { socks } => self.on_listsocks(socks),
        }
    }

    fn on_connect_req(&mut self, peer: PeerEndpoint) -> Vec<Effect> {
        if self.tracking(&peer) || self.pending_offer.as_ref() == Some(&peer) {
            // Duplicate of the offer or session we already track.
            log::debug!("duplicate connect_req from {peer}, ignoring");
            return vec![];
        }
        if self.status != Status::Idle || self.decision_pending() {
            log::debug!("busy, answering connect_req from {peer} with connect_wait");
            return vec![Effect::Send(Outbound::ConnectWait { dst: peer })];
        }
        self.pending_offer = Some(peer.clone());
        vec![Effect::Print(format!(
            "Do you want to accept a connect from {peer}? (y/n)"
        ))]
    }

    fn on_connect_ack(&mut self, peer: PeerEndpoint) -> Vec<Effect> {
        if self.tracking(&peer) {
            // Accepted from Connecting, and from Waiting once the peer frees
            // up without requiring a fresh request.
            self.status = Status::Connected;
            return vec![Effect::Print("Client connected!".to_string())];
        }
        if self.status != Status::Idle {
            return vec![Effect::Send(Outbound::ConnectWait { dst: peer })];
        }
        log::debug!("stray connect_ack from {peer} while idle, ignoring");
        vec![]
    }

    fn on_connect_wait(&mut self, peer: PeerEndpoint) -> Vec<Effect> {
        if self.tracking(&peer) {
            self.status = Status::Waiting;
            return vec![Effect::Print("Client Busy!".to_string())];
        }
        log::debug!("connect_wait from untracked {peer}, ignoring");
        vec![]
    }

    fn on_connect_abort(&mut self, peer: PeerEndpoint) -> Vec<Effect> {
        if self.tracking(&peer) {
            self.reset();
            return vec![Effect::Print("Connection aborted!".to_string())];
        }
        // The offerer may abort while we are still deciding.
        if self.pending_offer.as_ref() == Some(&peer) {
            self.pending_offer = None;
            return vec![Effect::Print("Connection aborted!".to_string())];
        }
        vec![]
    }

    fn on_connect_req_cancel(&mut self, peer: PeerEndpoint) -> Vec<Effect> {
        if self.tracking(&peer) {
            self.reset();
            return vec![Effect::Print("Connect declined!".to_string())];
        }
        vec![]
    }

    fn on_connect_unknown(&mut self, peer: PeerEndpoint) -> Vec<Effect> {
        log::error!("server does not know {peer}");
        if self.tracking(&peer) {
            self.reset();
            return vec![Effect::Print("Client unavailable!".to_string())];
        }
        vec![]
    }

    fn on_listsocks(&mut self, socks: Vec<(String, String)>) -> Vec<Effect> {
        socks
            .into_iter()
            .map(|(ip, port)| {
                let entry = PeerEndpoint::new(ip, port);
                if entry == self.local {
                    Effect::Print(format!("You - {entry}"))
                } else {
                    Effect::Print(format!("Client - {entry}"))
                }
            })
            .collect()
    }
}
