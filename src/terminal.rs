//! The interactive client loop: one task multiplexing local input, the
//! server socket, and ctrl-c.
//!
//! Each iteration renders the prompt (when one is due), waits for readiness,
//! turns whatever arrived into an [`Event`], runs it through the negotiation
//! machine, and executes the returned effects. Local input leaves the
//! readiness set while a negotiation is outstanding, so a keystroke can never
//! race an in-flight answer; the socket is always armed. Once a frame's
//! length prefixes have been read the remainder is read to completion outside
//! the readiness wait.

use std::io::{self, Write};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::signal;
use tokio::time;

use crate::message::{self, PeerEndpoint, ProtocolError};
use crate::peer::{Effect, Event, Negotiation, Status};

/// How long a readiness wait may sit unanswered while Connecting before we
/// log that the attempt is still pending. Purely a monitoring hook; no retry
/// is driven from it.
pub const CONNECT_POLL: Duration = Duration::from_secs(10);

/// Parse one prompt line into a local command. `connect` with a single
/// argument targets the loopback address, mirroring the server commands
/// `connect <port>`, `connect <ip> <port>`, and `listsocks`.
pub fn parse_command(line: &str) -> Result<Event, String> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("connect") => {
            let rest: Vec<&str> = words.collect();
            match rest.as_slice() {
                [port] => Ok(Event::Connect(PeerEndpoint::new("127.0.0.1", *port))),
                [ip, port] => Ok(Event::Connect(PeerEndpoint::new(*ip, *port))),
                _ => Err("usage: connect [<ip>] <port>".to_string()),
            }
        }
        Some("listsocks") => Ok(Event::ListSocks),
        Some(other) => Err(format!("Unknown command {other:?}")),
        None => Err(String::new()),
    }
}

/// Route one input line according to the current negotiation state: an
/// answer to a pending offer, a chat line while connected, or a server
/// command while idle. `Ok(None)` means the line is ignored; `Err` carries a
/// message for the user.
pub fn route_line(nego: &Negotiation, line: &str) -> Result<Option<Event>, String> {
    if line.is_empty() {
        return Ok(None);
    }
    if nego.decision_pending() {
        return Ok(Some(Event::Decision(
            line.trim().eq_ignore_ascii_case("y"),
        )));
    }
    if nego.status() == Status::Connected {
        return Ok(Some(Event::Chat(line.to_string())));
    }
    parse_command(line).map(Some)
}

/// What a readiness wait produced.
enum Ready {
    Interrupt,
    Socket,
    Line(Option<String>),
    Tick,
}

/// The client endpoint: socket halves plus the negotiation machine.
pub struct Client {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    nego: Negotiation,
}

impl Client {
    pub fn new(stream: TcpStream, local: PeerEndpoint) -> Client {
        let (reader, writer) = stream.into_split();
        Client {
            reader,
            writer,
            nego: Negotiation::new(local),
        }
    }

    /// Run until ctrl-c while idle, stdin closing, or a protocol-fatal
    /// error. Single-threaded by construction: one event is dispatched per
    /// iteration and nothing else touches the state machine.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            if let Some(prompt) = self.nego.prompt() {
                print!("{prompt} ");
                io::stdout().flush()?;
            }

            // Wait for readiness only; the actual frame read happens after
            // the select so it always runs to completion.
            let ready = tokio::select! {
                _ = signal::ctrl_c() => Ready::Interrupt,
                r = self.reader.readable() => {
                    r?;
                    Ready::Socket
                }
                line = lines.next_line(), if self.nego.input_open() => Ready::Line(line?),
                _ = time::sleep(CONNECT_POLL), if self.nego.status() == Status::Connecting => {
                    Ready::Tick
                }
            };

            let event = match ready {
                Ready::Interrupt => Some(Event::Interrupt),
                Ready::Socket => {
                    Some(Event::Request(message::read_request(&mut self.reader).await?))
                }
                Ready::Line(None) => {
                    log::info!("stdin closed, exiting");
                    return Ok(());
                }
                Ready::Line(Some(line)) => match route_line(&self.nego, &line) {
                    Ok(event) => event,
                    Err(complaint) => {
                        if !complaint.is_empty() {
                            println!("{complaint}");
                        }
                        None
                    }
                },
                Ready::Tick => {
                    if let Some(peer) = self.nego.peer() {
                        log::info!("connect attempt to {peer} still unanswered");
                    }
                    None
                }
            };

            if let Some(event) = event {
                if self.dispatch(event).await? {
                    return Ok(());
                }
            }
        }
    }

    /// Apply one event and execute its effects. Returns true on shutdown.
    async fn dispatch(&mut self, event: Event) -> Result<bool, ProtocolError> {
        for effect in self.nego.apply(event) {
            match effect {
                Effect::Send(out) => match out.to_wire() {
                    Ok(frame) => self.writer.write_all(&frame).await?,
                    Err(err @ ProtocolError::Oversize { .. }) => {
                        // An oversize encode drops only this frame; the
                        // session state already moved on and stays valid.
                        log::error!("dropping {} frame: {err}", out.command());
                        println!("Message too large to send");
                    }
                    Err(err) => return Err(err),
                },
                Effect::Print(text) => println!("{text}"),
                Effect::Shutdown => return Ok(true),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Request;

    fn nego() -> Negotiation {
        Negotiation::new(PeerEndpoint::new("127.0.0.1", "50000"))
    }

    #[test]
    fn connect_with_port_defaults_to_loopback() {
        assert_eq!(
            parse_command("connect 9000"),
            Ok(Event::Connect(PeerEndpoint::new("127.0.0.1", "9000")))
        );
    }

    #[test]
    fn connect_with_ip_and_port() {
        assert_eq!(
            parse_command("connect 10.0.0.2 9000"),
            Ok(Event::Connect(PeerEndpoint::new("10.0.0.2", "9000")))
        );
    }

    #[test]
    fn connect_without_arguments_prints_usage() {
        assert!(parse_command("connect").is_err());
        assert!(parse_command("connect a b c").is_err());
    }

    #[test]
    fn listsocks_command() {
        assert_eq!(parse_command("listsocks"), Ok(Event::ListSocks));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(parse_command("frobnicate").is_err());
    }

    #[test]
    fn empty_line_is_ignored() {
        assert_eq!(route_line(&nego(), ""), Ok(None));
    }

    #[test]
    fn line_while_connected_becomes_chat() {
        let mut nego = nego();
        nego.apply(Event::Connect(PeerEndpoint::new("10.0.0.2", "9000")));
        nego.apply(Event::Request(Request::ConnectAck {
            peer: PeerEndpoint::new("10.0.0.2", "9000"),
        }));
        assert_eq!(
            route_line(&nego, "hello there"),
            Ok(Some(Event::Chat("hello there".to_string())))
        );
    }

    #[test]
    fn line_while_deciding_is_the_answer() {
        let mut nego = nego();
        nego.apply(Event::Request(Request::ConnectReq {
            peer: PeerEndpoint::new("10.0.0.2", "9000"),
        }));
        assert_eq!(route_line(&nego, "Y"), Ok(Some(Event::Decision(true))));
        assert_eq!(route_line(&nego, "n"), Ok(Some(Event::Decision(false))));
        // anything that is not y counts as a decline
        assert_eq!(
            route_line(&nego, "maybe"),
            Ok(Some(Event::Decision(false)))
        );
    }

    #[test]
    fn line_while_idle_is_a_command() {
        assert_eq!(
            route_line(&nego(), "listsocks"),
            Ok(Some(Event::ListSocks))
        );
        assert!(route_line(&nego(), "hello").is_err());
    }
}
