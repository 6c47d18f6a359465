//! Wire protocol for the rendezvous server: framing, content types, and the
//! decoded request model.
//!
//! Every frame on the wire looks like this (all integers big-endian,
//! unsigned):
//!
//! ```text
//! [header_len u8][cmdargs_len u16][payload_len u16][header][cmdargs][payload]
//! header  = "TCPAppServerAPI/1.0,<content-type>"
//! cmdargs = "<command>-<k1>=<v1>,<k2>=<v2>,..."
//! payload = content-type-encoded bytes (may be empty)
//! ```
//!
//! A length prefix always describes exactly the bytes that follow it; running
//! out of stream before a declared count is satisfied is a closed connection,
//! never a partial success. There is no resynchronization marker, so a
//! malformed frame poisons the rest of the stream and is fatal to the read
//! side.

use std::collections::HashMap;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const PROTOCOL_NAME: &str = "TCPAppServerAPI";
pub const PROTOCOL_VERSION: &str = "1.0";

const MAX_HEADER_LEN: usize = u8::MAX as usize;
const MAX_BLOCK_LEN: usize = u16::MAX as usize;

/// Failures while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The socket yielded zero bytes while a read was outstanding.
    #[error("peer closed the connection")]
    PeerClosed,
    /// A frame that violates the format; the stream cannot be resynced.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Header declared a content type this client does not speak.
    #[error("unsupported content type {0:?}")]
    ContentType(String),
    /// An encode-side field too large for its length prefix.
    #[error("{field} is {len} bytes, limit is {max}")]
    Oversize {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// Frame payload, selected by the header's content-type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn empty() -> Payload {
        Payload::Text(String::new())
    }

    fn content_type(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Text(s) => s.clone().into_bytes(),
            Payload::Json(v) => v.to_string().into_bytes(),
        }
    }

    /// Decode a received payload per the header's content-type tag. An empty
    /// payload is always empty text; the server tags empty control payloads
    /// `json`, which would otherwise fail to parse.
    fn parse(ctype: &str, raw: &[u8]) -> Result<Payload, ProtocolError> {
        if raw.is_empty() {
            return Ok(Payload::empty());
        }
        let text = String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::Malformed("payload is not utf-8".into()))?;
        match ctype {
            "text" => Ok(Payload::Text(text)),
            "json" => serde_json::from_str(&text)
                .map(Payload::Json)
                .map_err(|e| ProtocolError::Malformed(format!("json payload: {e}"))),
            other => Err(ProtocolError::ContentType(other.to_string())),
        }
    }
}

/// Read exactly `n` bytes, looping over raw reads until the count is
/// satisfied. A zero-byte raw read mid-accumulation means the peer closed.
/// `n == 0` returns empty without touching the reader.
pub async fn read_chunk<R>(reader: &mut R, n: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let got = reader.read(&mut buf[filled..]).await?;
        if got == 0 {
            return Err(ProtocolError::PeerClosed);
        }
        filled += got;
    }
    Ok(buf)
}

/// A decoded frame before command-specific interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
    pub command: String,
    pub args: HashMap<String, String>,
    pub payload: Payload,
}

/// Encode one frame. Rejects (never truncates) fields that overflow their
/// length prefixes.
pub fn encode(
    command: &str,
    args: &[(String, String)],
    payload: &Payload,
) -> Result<Bytes, ProtocolError> {
    let header = format!(
        "{}/{},{}",
        PROTOCOL_NAME,
        PROTOCOL_VERSION,
        payload.content_type()
    );
    encode_with_header(&header, command, args, payload)
}

fn encode_with_header(
    header: &str,
    command: &str,
    args: &[(String, String)],
    payload: &Payload,
) -> Result<Bytes, ProtocolError> {
    let argstr = args
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    let cmdargs = format!("{command}-{argstr}");
    let body = payload.to_bytes();

    if header.len() > MAX_HEADER_LEN {
        return Err(ProtocolError::Oversize {
            field: "header",
            len: header.len(),
            max: MAX_HEADER_LEN,
        });
    }
    if cmdargs.len() > MAX_BLOCK_LEN {
        return Err(ProtocolError::Oversize {
            field: "command block",
            len: cmdargs.len(),
            max: MAX_BLOCK_LEN,
        });
    }
    if body.len() > MAX_BLOCK_LEN {
        return Err(ProtocolError::Oversize {
            field: "payload",
            len: body.len(),
            max: MAX_BLOCK_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(5 + header.len() + cmdargs.len() + body.len());
    buf.put_u8(header.len() as u8);
    buf.put_u16(cmdargs.len() as u16);
    buf.put_u16(body.len() as u16);
    buf.put(header.as_bytes());
    buf.put(cmdargs.as_bytes());
    buf.put(&body[..]);
    log::debug!("encoded {command} frame, {} bytes", buf.len());
    Ok(buf.freeze())
}

/// Read and decode one frame. The length prefixes are read first; the three
/// variable sections then block until their declared counts are satisfied.
pub async fn read_raw<R>(reader: &mut R) -> Result<RawRequest, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let header_len = read_chunk(reader, 1).await?[0] as usize;
    let cmdargs_len = BigEndian::read_u16(&read_chunk(reader, 2).await?) as usize;
    let payload_len = BigEndian::read_u16(&read_chunk(reader, 2).await?) as usize;
    log::debug!("frame prefixes: header {header_len}, cmdargs {cmdargs_len}, payload {payload_len}");

    let header = String::from_utf8(read_chunk(reader, header_len).await?)
        .map_err(|_| ProtocolError::Malformed("header is not utf-8".into()))?;
    let cmdargs = String::from_utf8(read_chunk(reader, cmdargs_len).await?)
        .map_err(|_| ProtocolError::Malformed("command block is not utf-8".into()))?;
    let body = read_chunk(reader, payload_len).await?;

    let (proto, ctype) = header
        .split_once(',')
        .ok_or_else(|| ProtocolError::Malformed(format!("header {header:?} has no content type")))?;
    if proto != format!("{PROTOCOL_NAME}/{PROTOCOL_VERSION}") {
        log::warn!("unexpected protocol tag {proto:?}");
    }

    let (command, argstr) = cmdargs.split_once('-').ok_or_else(|| {
        ProtocolError::Malformed(format!("command block {cmdargs:?} has no separator"))
    })?;
    let mut args = HashMap::new();
    if !argstr.is_empty() {
        for pair in argstr.split(',') {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ProtocolError::Malformed(format!("argument {pair:?} has no '='")))?;
            args.insert(k.to_string(), v.to_string());
        }
    }

    let payload = Payload::parse(ctype, &body)?;
    log::debug!("decoded {command} frame");
    Ok(RawRequest {
        command: command.to_string(),
        args,
        payload,
    })
}

/// A remote chat participant, keyed by the exact string pair the server
/// reports. No name resolution is ever applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub ip: String,
    pub port: String,
}

impl PeerEndpoint {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> PeerEndpoint {
        PeerEndpoint {
            ip: ip.into(),
            port: port.into(),
        }
    }
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// One decoded server-delivered message. One variant per protocol command,
/// each with the fixed fields that command carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ConnectReq { peer: PeerEndpoint },
    ConnectAck { peer: PeerEndpoint },
    ConnectWait { peer: PeerEndpoint },
    ConnectAbort { peer: PeerEndpoint },
    ConnectReqCancel { peer: PeerEndpoint },
    ConnectUnknown { peer: PeerEndpoint },
    SendMsg { peer: PeerEndpoint, text: String },
    ListSocks { socks: Vec<(String, String)> },
}

fn endpoint_arg(
    raw: &RawRequest,
    ip_key: &str,
    port_key: &str,
) -> Result<PeerEndpoint, ProtocolError> {
    let get = |key: &str| {
        raw.args.get(key).cloned().ok_or_else(|| {
            ProtocolError::Malformed(format!("{} is missing argument {key:?}", raw.command))
        })
    };
    Ok(PeerEndpoint {
        ip: get(ip_key)?,
        port: get(port_key)?,
    })
}

fn json_field(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Request {
    /// Interpret a decoded frame. The relay rewrites peer arguments to
    /// `src_ip`/`src_port` on delivery, except `connect_unknown`, which
    /// echoes back the `dst_ip`/`dst_port` the server could not find.
    pub fn from_raw(raw: RawRequest) -> Result<Request, ProtocolError> {
        let src = || endpoint_arg(&raw, "src_ip", "src_port");
        match raw.command.as_str() {
            "connect_req" => Ok(Request::ConnectReq { peer: src()? }),
            "connect_ack" => Ok(Request::ConnectAck { peer: src()? }),
            "connect_wait" => Ok(Request::ConnectWait { peer: src()? }),
            "connect_abort" => Ok(Request::ConnectAbort { peer: src()? }),
            "connect_req_cancel" => Ok(Request::ConnectReqCancel { peer: src()? }),
            "connect_unknown" => Ok(Request::ConnectUnknown {
                peer: endpoint_arg(&raw, "dst_ip", "dst_port")?,
            }),
            "send_msg" => {
                let peer = src()?;
                let text = match &raw.payload {
                    Payload::Text(s) => s.clone(),
                    Payload::Json(v) => json_field(v),
                };
                Ok(Request::SendMsg { peer, text })
            }
            "listsocks" => {
                let data = match &raw.payload {
                    Payload::Json(serde_json::Value::Object(map)) => map
                        .get("data")
                        .and_then(|d| d.as_array())
                        .cloned()
                        .ok_or_else(|| {
                            ProtocolError::Malformed("listsocks payload has no data list".into())
                        })?,
                    _ => {
                        return Err(ProtocolError::Malformed(
                            "listsocks payload is not a json object".into(),
                        ))
                    }
                };
                let mut socks = Vec::with_capacity(data.len());
                for entry in &data {
                    match entry.as_array() {
                        Some(pair) if pair.len() >= 2 => {
                            socks.push((json_field(&pair[0]), json_field(&pair[1])));
                        }
                        _ => {
                            return Err(ProtocolError::Malformed(format!(
                                "listsocks entry {entry} is not an [ip, port] pair"
                            )))
                        }
                    }
                }
                Ok(Request::ListSocks { socks })
            }
            other => Err(ProtocolError::Malformed(format!(
                "unknown command {other:?}"
            ))),
        }
    }
}

/// Read one frame and interpret it.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Request::from_raw(read_raw(reader).await?)
}

/// One client-originated message. Peer-bearing commands address the target
/// as `dst_ip`/`dst_port`; the relay rewrites them to source form before
/// delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ConnectReq { dst: PeerEndpoint },
    ConnectAck { dst: PeerEndpoint },
    ConnectWait { dst: PeerEndpoint },
    ConnectAbort { dst: PeerEndpoint },
    ConnectReqCancel { dst: PeerEndpoint },
    SendMsg { dst: PeerEndpoint, text: String },
    ListSocks,
}

fn dst_args(dst: &PeerEndpoint) -> Vec<(String, String)> {
    vec![
        ("dst_ip".to_string(), dst.ip.clone()),
        ("dst_port".to_string(), dst.port.clone()),
    ]
}

impl Outbound {
    pub fn command(&self) -> &'static str {
        match self {
            Outbound::ConnectReq { .. } => "connect_req",
            Outbound::ConnectAck { .. } => "connect_ack",
            Outbound::ConnectWait { .. } => "connect_wait",
            Outbound::ConnectAbort { .. } => "connect_abort",
            Outbound::ConnectReqCancel { .. } => "connect_req_cancel",
            Outbound::SendMsg { .. } => "send_msg",
            Outbound::ListSocks => "listsocks",
        }
    }

    pub fn to_wire(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Outbound::ConnectReq { dst }
            | Outbound::ConnectAck { dst }
            | Outbound::ConnectWait { dst }
            | Outbound::ConnectAbort { dst }
            | Outbound::ConnectReqCancel { dst } => {
                encode(self.command(), &dst_args(dst), &Payload::empty())
            }
            Outbound::SendMsg { dst, text } => {
                encode(self.command(), &dst_args(dst), &Payload::Text(text.clone()))
            }
            Outbound::ListSocks => encode(self.command(), &[], &Payload::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<RawRequest, ProtocolError> {
        let mut reader = bytes;
        read_raw(&mut reader).await
    }

    fn args(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn round_trip_text_payload() {
        let sent = encode(
            "send_msg",
            &args(&[("dst_ip", "10.0.0.2"), ("dst_port", "9000")]),
            &Payload::Text("hello there".into()),
        )
        .unwrap();
        let raw = decode(&sent).await.unwrap();
        assert_eq!(raw.command, "send_msg");
        assert_eq!(raw.args["dst_ip"], "10.0.0.2");
        assert_eq!(raw.args["dst_port"], "9000");
        assert_eq!(raw.payload, Payload::Text("hello there".into()));
    }

    #[tokio::test]
    async fn round_trip_json_payload() {
        let value = serde_json::json!({"data": [["127.0.0.1", "9000"]]});
        let sent = encode("listsocks", &[], &Payload::Json(value.clone())).unwrap();
        let raw = decode(&sent).await.unwrap();
        assert_eq!(raw.command, "listsocks");
        assert!(raw.args.is_empty());
        assert_eq!(raw.payload, Payload::Json(value));
    }

    #[tokio::test]
    async fn round_trip_empty_args_and_payload() {
        let sent = encode("listsocks", &[], &Payload::empty()).unwrap();
        let raw = decode(&sent).await.unwrap();
        assert_eq!(raw.command, "listsocks");
        assert!(raw.args.is_empty());
        assert_eq!(raw.payload, Payload::empty());
    }

    #[test]
    fn command_block_boundary() {
        // cmdargs = command + "-", so a 65534-char command lands exactly on
        // the u16 limit and one more overflows it.
        let cmd = "c".repeat(65534);
        assert!(encode(&cmd, &[], &Payload::empty()).is_ok());
        let cmd = "c".repeat(65535);
        assert!(matches!(
            encode(&cmd, &[], &Payload::empty()),
            Err(ProtocolError::Oversize {
                field: "command block",
                ..
            })
        ));
    }

    #[test]
    fn payload_boundary() {
        let text = "p".repeat(65535);
        assert!(encode("send_msg", &[], &Payload::Text(text)).is_ok());
        let text = "p".repeat(65536);
        assert!(matches!(
            encode("send_msg", &[], &Payload::Text(text)),
            Err(ProtocolError::Oversize {
                field: "payload",
                ..
            })
        ));
    }

    #[test]
    fn header_boundary() {
        let header = "h".repeat(256);
        assert!(matches!(
            encode_with_header(&header, "x", &[], &Payload::empty()),
            Err(ProtocolError::Oversize {
                field: "header",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_peer_closed() {
        let sent = encode(
            "connect_req",
            &args(&[("dst_ip", "1.2.3.4")]),
            &Payload::empty(),
        )
        .unwrap();
        let cut = &sent[..sent.len() - 3];
        assert!(matches!(decode(cut).await, Err(ProtocolError::PeerClosed)));
    }

    #[tokio::test]
    async fn empty_stream_is_peer_closed() {
        assert!(matches!(decode(&[]).await, Err(ProtocolError::PeerClosed)));
    }

    #[tokio::test]
    async fn zero_length_chunk_reads_nothing() {
        let mut reader: &[u8] = &[];
        assert_eq!(read_chunk(&mut reader, 0).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn command_block_without_separator_is_malformed() {
        let header = format!("{PROTOCOL_NAME}/{PROTOCOL_VERSION},text");
        let mut buf = BytesMut::new();
        buf.put_u8(header.len() as u8);
        buf.put_u16(7);
        buf.put_u16(0);
        buf.put(header.as_bytes());
        buf.put(&b"no_dash"[..]);
        assert!(matches!(
            decode(&buf).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn argument_without_equals_is_malformed() {
        let header = format!("{PROTOCOL_NAME}/{PROTOCOL_VERSION},text");
        let cmdargs = b"connect_req-dst_ip";
        let mut buf = BytesMut::new();
        buf.put_u8(header.len() as u8);
        buf.put_u16(cmdargs.len() as u16);
        buf.put_u16(0);
        buf.put(header.as_bytes());
        buf.put(&cmdargs[..]);
        assert!(matches!(
            decode(&buf).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_content_type_is_rejected() {
        let header = format!("{PROTOCOL_NAME}/{PROTOCOL_VERSION},xml");
        let mut buf = BytesMut::new();
        buf.put_u8(header.len() as u8);
        buf.put_u16(9);
        buf.put_u16(4);
        buf.put(header.as_bytes());
        buf.put(&b"send_msg-"[..]);
        buf.put(&b"<x/>"[..]);
        assert!(matches!(
            decode(&buf).await,
            Err(ProtocolError::ContentType(_))
        ));
    }

    #[tokio::test]
    async fn empty_payload_ignores_declared_content_type() {
        // Empty control payloads arrive tagged json; they must not be fed to
        // the json parser.
        let header = format!("{PROTOCOL_NAME}/{PROTOCOL_VERSION},json");
        let cmdargs = b"connect_ack-src_ip=1.2.3.4,src_port=9000";
        let mut buf = BytesMut::new();
        buf.put_u8(header.len() as u8);
        buf.put_u16(cmdargs.len() as u16);
        buf.put_u16(0);
        buf.put(header.as_bytes());
        buf.put(&cmdargs[..]);
        let raw = decode(&buf).await.unwrap();
        assert_eq!(raw.payload, Payload::empty());
    }

    #[tokio::test]
    async fn connect_unknown_reads_dst_arguments() {
        let sent = encode(
            "connect_unknown",
            &args(&[("dst_ip", "10.0.0.9"), ("dst_port", "4242")]),
            &Payload::empty(),
        )
        .unwrap();
        let mut reader = &sent[..];
        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(
            req,
            Request::ConnectUnknown {
                peer: PeerEndpoint::new("10.0.0.9", "4242")
            }
        );
    }

    #[tokio::test]
    async fn connect_ack_requires_src_arguments() {
        // dst-form arguments on an ack are a relay bug; the decode must not
        // silently fall back to them.
        let sent = encode(
            "connect_ack",
            &args(&[("dst_ip", "10.0.0.9"), ("dst_port", "4242")]),
            &Payload::empty(),
        )
        .unwrap();
        let mut reader = &sent[..];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn listsocks_reply_decodes_string_and_numeric_ports() {
        let value = serde_json::json!({"data": [["127.0.0.1", 9000], ["10.0.0.2", "9001"]]});
        let sent = encode("listsocks", &[], &Payload::Json(value)).unwrap();
        let mut reader = &sent[..];
        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(
            req,
            Request::ListSocks {
                socks: vec![
                    ("127.0.0.1".into(), "9000".into()),
                    ("10.0.0.2".into(), "9001".into()),
                ]
            }
        );
    }

    #[tokio::test]
    async fn unknown_command_is_malformed() {
        let sent = encode("teleport", &[], &Payload::empty()).unwrap();
        let mut reader = &sent[..];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn outbound_connect_req_carries_dst_arguments() {
        let wire = Outbound::ConnectReq {
            dst: PeerEndpoint::new("127.0.0.1", "9000"),
        }
        .to_wire()
        .unwrap();
        let raw = decode(&wire).await.unwrap();
        assert_eq!(raw.command, "connect_req");
        assert_eq!(raw.args["dst_ip"], "127.0.0.1");
        assert_eq!(raw.args["dst_port"], "9000");
    }

    #[tokio::test]
    async fn outbound_chat_line_round_trips() {
        let wire = Outbound::SendMsg {
            dst: PeerEndpoint::new("10.0.0.2", "9000"),
            text: "hi there".into(),
        }
        .to_wire()
        .unwrap();
        let raw = decode(&wire).await.unwrap();
        assert_eq!(raw.command, "send_msg");
        assert_eq!(raw.payload, Payload::Text("hi there".into()));
    }
}
