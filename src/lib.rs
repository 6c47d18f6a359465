//! # A relayed peer-to-peer chat client.
//!
//! Connects to a rendezvous server that relays frames between clients. At the
//! terminal prompt a user can:
//!
//! 1. List the clients currently connected to the server.
//! 2. Request an exclusive chat session with one of them.
//! 3. Accept or decline an incoming session offer.
//! 4. Exchange chat lines once a session is up.
//! 5. Abort a pending or active session with ctrl-c.
//!
//! The protocol is strictly one peer at a time: while a negotiation or
//! session is tracked, offers and acks from anyone else are answered with
//! `connect_wait` and the tracked peer is never replaced.
//!
//! Architecture:
//!
//! ```text
//!   stdin line ----+                                 +--> Outbound frame --> socket
//!                  v                                 |
//!              tokio::select! --Event--> Negotiation-+--> console text
//!                  ^                     (peer.rs)   |
//!   socket frame --+                                 +--> shutdown
//!   (message.rs)
//! ```
//!
//! One task, one owner of all protocol state: the loop in `terminal.rs`
//! converts whatever became ready into an event, the state machine in
//! `peer.rs` computes the transition and its effects, and the loop then
//! performs the I/O those effects describe.

pub mod message;
pub mod peer;
pub mod terminal;
