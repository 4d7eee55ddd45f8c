//! Datagram transport binding.
//!
//! Binds the endpoints to a CoAP/UDP request-response channel with
//! confirmable messages, retransmission, and block-wise transfer in both
//! directions. Endpoints drive the transport by calling the poll routines
//! with a bounded wait (at most [`IO_PROCESS_BOUND`]) and checking their
//! quit token between iterations; nothing else in the crate blocks.
//!
//! PSK and RPK session parameters are carried in [`SecurityMode`] and
//! validated here, but the DTLS handshake itself belongs to an external
//! secure-datagram backend; without one, a secured session request fails
//! with a transport error. Plaintext UDP is implemented in-process.

pub mod block;

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::shutdown::QuitToken;
use block::BlockValue;

/// Default CoAP port.
pub const DEFAULT_PORT: u16 = 5683;

/// Resource path the attestation exchange runs on.
pub const ATTEST_RESOURCE: &str = "attest";

/// Default block size for block-wise transfers.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Upper bound for one transport I/O wait.
pub const IO_PROCESS_BOUND: Duration = Duration::from_secs(2);

const RECV_BUFFER_LEN: usize = 65536;

/// Pre-shared-key session parameters. Key material is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PskConfig {
    pub identity: String,
    pub key: Vec<u8>,
}

impl fmt::Debug for PskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskConfig")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Raw-public-key session parameters.
#[derive(Debug, Clone)]
pub struct RpkConfig {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub peer_public_key_path: PathBuf,
    pub verify_peer: bool,
}

#[derive(Debug, Clone)]
pub enum SecurityMode {
    NoSec,
    Psk(PskConfig),
    Rpk(RpkConfig),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityMode,
    pub block_size: usize,
    /// Reassembly ceiling for one message in either direction.
    pub max_message_len: usize,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: SecurityMode::NoSec,
            block_size: DEFAULT_BLOCK_SIZE,
            max_message_len: crate::wire::DEFAULT_MESSAGE_CEILING,
        }
    }
}

fn require_backend(security: &SecurityMode, role: &str) -> Result<()> {
    match security {
        SecurityMode::NoSec => Ok(()),
        SecurityMode::Psk(psk) => {
            if psk.key.is_empty() {
                return Err(Error::Transport(format!("{role}: empty pre-shared key")));
            }
            Err(Error::Transport(format!(
                "{role}: DTLS-PSK session requested but no DTLS backend is available in this build"
            )))
        }
        SecurityMode::Rpk(_) => Err(Error::Transport(format!(
            "{role}: DTLS-RPK session requested but no DTLS backend is available in this build"
        ))),
    }
}

/// What a resource handler produced; mapped onto response codes here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOutcome {
    Content(Vec<u8>),
    BadRequest,
    ServerError,
}

type Handler = Box<dyn FnMut(&[u8]) -> ResourceOutcome + Send>;

struct PartialRequest {
    buf: Vec<u8>,
    next_num: u32,
}

/// A fully encoded response held by the transport until its final block
/// has been fetched.
struct PendingResponse {
    token: Vec<u8>,
    code: ResponseType,
    payload: Vec<u8>,
}

/// Server side of the binding: one socket, registered resources, per-peer
/// block-wise state.
pub struct CoapServer {
    socket: UdpSocket,
    resources: HashMap<String, Handler>,
    block_size: usize,
    max_message_len: usize,
    partial: HashMap<SocketAddr, PartialRequest>,
    pending: HashMap<SocketAddr, PendingResponse>,
    dedup: HashMap<SocketAddr, (u16, Vec<u8>)>,
}

impl CoapServer {
    pub fn bind(config: &TransportConfig) -> Result<Self> {
        require_backend(&config.security, "server")?;
        let socket = UdpSocket::bind((config.host.as_str(), config.port))?;
        log::info!("listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            resources: HashMap::new(),
            block_size: config.block_size,
            max_message_len: config.max_message_len,
            partial: HashMap::new(),
            pending: HashMap::new(),
            dedup: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn register(&mut self, path: &str, handler: Handler) {
        log::info!("registering resource '{path}'");
        self.resources.insert(path.to_string(), handler);
    }

    /// Process at most one datagram, waiting up to `timeout` for it.
    /// Returns whether a datagram was handled.
    pub fn poll_io(&mut self, timeout: Duration) -> Result<bool> {
        let timeout = timeout.min(IO_PROCESS_BOUND);
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(10))))?;
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let (len, peer) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    IoErrorKind::WouldBlock | IoErrorKind::TimedOut | IoErrorKind::Interrupted
                ) =>
            {
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let packet = match Packet::from_bytes(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("dropping unparsable datagram from {peer}: {e}");
                return Ok(true);
            }
        };
        if !matches!(packet.header.code, MessageClass::Request(_)) {
            return Ok(true);
        }

        // A retransmitted request gets the cached response verbatim.
        if let Some((mid, bytes)) = self.dedup.get(&peer) {
            if *mid == packet.header.message_id {
                self.socket.send_to(bytes, peer)?;
                return Ok(true);
            }
        }

        let response = self.handle_request(peer, &packet)?;
        let bytes = response
            .to_bytes()
            .map_err(|e| Error::Transport(format!("response encode: {e}")))?;
        self.dedup.insert(peer, (packet.header.message_id, bytes.clone()));
        self.socket.send_to(&bytes, peer)?;
        Ok(true)
    }

    fn handle_request(&mut self, peer: SocketAddr, packet: &Packet) -> Result<Packet> {
        // Continuation fetch for an earlier oversized response?
        if let Some(block2) = option_block(packet, CoapOption::Block2) {
            let block2 = block2?;
            if block2.num > 0 {
                return self.serve_pending_block(peer, packet, block2.num);
            }
        }

        let payload = match self.reassemble(peer, packet)? {
            Reassembly::Complete(payload) => payload,
            Reassembly::Continue(response) => return Ok(response),
        };

        let path = uri_path(packet);
        let Some(handler) = self.resources.get_mut(&path) else {
            log::warn!("request for unknown resource '{path}' from {peer}");
            return Ok(response_packet(packet, ResponseType::NotFound, Vec::new()));
        };
        log::info!("resource '{path}': received message from {peer}");

        let (code, body) = match handler(&payload) {
            ResourceOutcome::Content(body) => (ResponseType::Content, body),
            ResourceOutcome::BadRequest => (ResponseType::BadRequest, Vec::new()),
            ResourceOutcome::ServerError => (ResponseType::InternalServerError, Vec::new()),
        };

        if body.len() > self.block_size {
            // Buffer ownership moves to the transport; it is released once
            // the final block has been fetched.
            return self.first_block_response(peer, packet, code, body);
        }
        Ok(response_packet(packet, code, body))
    }

    fn first_block_response(
        &mut self,
        peer: SocketAddr,
        packet: &Packet,
        code: ResponseType,
        body: Vec<u8>,
    ) -> Result<Packet> {
        let block = BlockValue::new(0, true, self.block_size)
            .map_err(|e| Error::Transport(format!("block value: {e}")))?;
        let slice = body[..self.block_size].to_vec();
        self.pending.insert(
            peer,
            PendingResponse {
                token: packet.get_token().to_vec(),
                code,
                payload: body,
            },
        );
        let mut response = response_packet(packet, code, slice);
        response.add_option(CoapOption::Block2, block.encode());
        Ok(response)
    }

    fn serve_pending_block(
        &mut self,
        peer: SocketAddr,
        packet: &Packet,
        num: u32,
    ) -> Result<Packet> {
        let Some(pending) = self.pending.get(&peer) else {
            log::warn!("block continuation from {peer} with no pending response");
            return Ok(response_packet(
                packet,
                ResponseType::RequestEntityIncomplete,
                Vec::new(),
            ));
        };
        if pending.token != packet.get_token() {
            log::warn!("block continuation from {peer} with mismatched token");
            return Ok(response_packet(packet, ResponseType::BadRequest, Vec::new()));
        }
        let offset = num as usize * self.block_size;
        if offset >= pending.payload.len() {
            return Ok(response_packet(packet, ResponseType::BadRequest, Vec::new()));
        }
        let end = (offset + self.block_size).min(pending.payload.len());
        let more = end < pending.payload.len();
        let code = pending.code;
        let slice = pending.payload[offset..end].to_vec();
        let block = BlockValue::new(num, more, self.block_size)
            .map_err(|e| Error::Transport(format!("block value: {e}")))?;
        if !more {
            // Final block acknowledged by being fetched; release the buffer.
            self.pending.remove(&peer);
        }
        let mut response = response_packet(packet, code, slice);
        response.add_option(CoapOption::Block2, block.encode());
        Ok(response)
    }

    fn reassemble(&mut self, peer: SocketAddr, packet: &Packet) -> Result<Reassembly> {
        let Some(block1) = option_block(packet, CoapOption::Block1) else {
            self.partial.remove(&peer);
            return Ok(Reassembly::Complete(packet.payload.clone()));
        };
        let block1 = block1?;

        let mut partial = self.partial.remove(&peer).unwrap_or(PartialRequest {
            buf: Vec::new(),
            next_num: 0,
        });
        if block1.num != partial.next_num {
            log::warn!(
                "out-of-order block {} from {peer} (expected {})",
                block1.num,
                partial.next_num
            );
            return Ok(Reassembly::Continue(response_packet(
                packet,
                ResponseType::RequestEntityIncomplete,
                Vec::new(),
            )));
        }
        if partial.buf.len() + packet.payload.len() > self.max_message_len {
            return Ok(Reassembly::Continue(response_packet(
                packet,
                ResponseType::RequestEntityTooLarge,
                Vec::new(),
            )));
        }
        partial.buf.extend_from_slice(&packet.payload);
        partial.next_num += 1;

        if block1.more {
            self.partial.insert(peer, partial);
            let mut response = response_packet(packet, ResponseType::Continue, Vec::new());
            response.add_option(CoapOption::Block1, block1.encode());
            return Ok(Reassembly::Continue(response));
        }
        Ok(Reassembly::Complete(partial.buf))
    }
}

enum Reassembly {
    Complete(Vec<u8>),
    Continue(Packet),
}

fn uri_path(packet: &Packet) -> String {
    packet
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

fn option_block(packet: &Packet, option: CoapOption) -> Option<Result<BlockValue>> {
    packet
        .get_option(option)
        .and_then(|values| values.front())
        .map(|raw| BlockValue::decode(raw))
}

fn response_packet(request: &Packet, code: ResponseType, payload: Vec<u8>) -> Packet {
    let mut response = Packet::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.message_id = request.header.message_id;
    response.header.code = MessageClass::Response(code);
    response.set_token(request.get_token().to_vec());
    if code == ResponseType::Content && !payload.is_empty() {
        response.set_content_format(ContentFormat::ApplicationCBOR);
    }
    response.payload = payload;
    response
}

/// Client side of the binding: one connected socket, one exchange at a
/// time, block-wise in both directions.
pub struct CoapClient {
    socket: UdpSocket,
    block_size: usize,
    max_message_len: usize,
    next_mid: u16,
}

impl CoapClient {
    pub fn connect(config: &TransportConfig) -> Result<Self> {
        require_backend(&config.security, "client")?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((config.host.as_str(), config.port))?;
        Ok(Self {
            socket,
            block_size: config.block_size,
            max_message_len: config.max_message_len,
            next_mid: rand::thread_rng().gen(),
        })
    }

    /// One FETCH exchange against `path`: block-wise upload of the request
    /// payload, block-wise download of the response. `timeout` bounds the
    /// whole exchange, measured across every I/O wait.
    pub fn fetch(
        &mut self,
        path: &str,
        payload: &[u8],
        timeout: Duration,
        quit: &QuitToken,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let token: Vec<u8> = rand::thread_rng().gen::<[u8; 8]>().to_vec();

        let chunks: Vec<&[u8]> = if payload.len() > self.block_size {
            payload.chunks(self.block_size).collect()
        } else {
            vec![payload]
        };
        let chunked = chunks.len() > 1;

        let mut last = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let more = i + 1 < chunks.len();
            let mut packet = self.request_packet(path, &token);
            if chunked {
                let block = BlockValue::new(i as u32, more, self.block_size)?;
                packet.add_option(CoapOption::Block1, block.encode());
            }
            packet.payload = chunk.to_vec();
            let (code, response) = self.exchange(&mut packet, &token, started, timeout, quit)?;
            if more {
                if code != ResponseType::Continue {
                    return Err(error_for_code(code));
                }
            } else {
                last = Some((code, response));
            }
        }
        let (code, response) = last.expect("final exchange result");
        if code != ResponseType::Content {
            return Err(error_for_code(code));
        }

        let mut body = response.payload.clone();
        let mut block2 = match option_block(&response, CoapOption::Block2) {
            Some(block) => Some(block?),
            None => None,
        };
        loop {
            let Some(block) = block2 else { break };
            if !block.more {
                break;
            }
            if body.len() > self.max_message_len {
                return Err(Error::Transport(
                    "response exceeds reassembly ceiling".into(),
                ));
            }
            let mut packet = self.request_packet(path, &token);
            let next = BlockValue {
                num: block.num + 1,
                more: false,
                szx: block.szx,
            };
            packet.add_option(CoapOption::Block2, next.encode());
            let (code, response) = self.exchange(&mut packet, &token, started, timeout, quit)?;
            if code != ResponseType::Content {
                return Err(error_for_code(code));
            }
            body.extend_from_slice(&response.payload);
            block2 = match option_block(&response, CoapOption::Block2) {
                Some(block) => Some(block?),
                None => None,
            };
        }
        Ok(body)
    }

    fn request_packet(&self, path: &str, token: &[u8]) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(RequestType::Fetch);
        packet.set_token(token.to_vec());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        packet.set_content_format(ContentFormat::ApplicationCBOR);
        packet
    }

    /// Send one confirmable request and wait for the matching response,
    /// retransmitting on each expired I/O wait. Responses that do not
    /// correlate with this exchange's token are dropped.
    fn exchange(
        &mut self,
        packet: &mut Packet,
        token: &[u8],
        started: Instant,
        timeout: Duration,
        quit: &QuitToken,
    ) -> Result<(ResponseType, Packet)> {
        self.next_mid = self.next_mid.wrapping_add(1);
        packet.header.message_id = self.next_mid;
        let bytes = packet
            .to_bytes()
            .map_err(|e| Error::Transport(format!("request encode: {e}")))?;
        self.socket.send(&bytes)?;

        loop {
            if quit.is_triggered() {
                return Err(Error::Transport("interrupted by quit signal".into()));
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout(timeout.as_secs()));
            }
            let wait = IO_PROCESS_BOUND
                .min(timeout - elapsed)
                .max(Duration::from_millis(10));
            self.socket.set_read_timeout(Some(wait))?;

            let mut buf = [0u8; RECV_BUFFER_LEN];
            match self.socket.recv(&mut buf) {
                Ok(len) => {
                    let response = match Packet::from_bytes(&buf[..len]) {
                        Ok(response) => response,
                        Err(e) => {
                            log::debug!("dropping unparsable datagram: {e}");
                            continue;
                        }
                    };
                    if response.get_token() != token {
                        log::debug!("dropping response with unknown token");
                        continue;
                    }
                    match response.header.code {
                        MessageClass::Response(code) => return Ok((code, response)),
                        _ => continue,
                    }
                }
                Err(e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => {
                    self.socket.send(&bytes)?;
                }
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn error_for_code(code: ResponseType) -> Error {
    match code {
        ResponseType::BadRequest => {
            Error::MalformedMessage("peer rejected the request (4.00 Bad Request)".into())
        }
        other => Error::Transport(format!("unexpected response code {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_server(
        block_size: usize,
        handler: impl FnMut(&[u8]) -> ResourceOutcome + Send + 'static,
    ) -> (SocketAddr, QuitToken, thread::JoinHandle<()>) {
        let mut config = TransportConfig::new("127.0.0.1", 0);
        config.block_size = block_size;
        let mut server = CoapServer::bind(&config).expect("bind");
        let addr = server.local_addr().expect("local addr");
        server.register(ATTEST_RESOURCE, Box::new(handler));
        let quit = QuitToken::new();
        let quit_clone = quit.clone();
        let join = thread::spawn(move || {
            while !quit_clone.is_triggered() {
                server.poll_io(Duration::from_millis(20)).expect("poll");
            }
        });
        (addr, quit, join)
    }

    fn client_for(addr: SocketAddr, block_size: usize) -> CoapClient {
        let mut config = TransportConfig::new("127.0.0.1", addr.port());
        config.block_size = block_size;
        CoapClient::connect(&config).expect("connect")
    }

    #[test]
    fn test_small_exchange() {
        let (addr, quit, join) = spawn_server(DEFAULT_BLOCK_SIZE, |payload| {
            let mut body = payload.to_vec();
            body.reverse();
            ResourceOutcome::Content(body)
        });
        let mut client = client_for(addr, DEFAULT_BLOCK_SIZE);
        let body = client
            .fetch(ATTEST_RESOURCE, b"abc", Duration::from_secs(5), &QuitToken::new())
            .expect("fetch");
        assert_eq!(body, b"cba");
        quit.trigger();
        join.join().expect("server thread");
    }

    #[test]
    fn test_blockwise_exchange_both_directions() {
        let request_body: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let response_body: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        let expected_request = request_body.clone();
        let served = response_body.clone();
        let (addr, quit, join) = spawn_server(256, move |payload| {
            assert_eq!(payload, &expected_request[..]);
            ResourceOutcome::Content(served.clone())
        });
        let mut client = client_for(addr, 256);
        let body = client
            .fetch(
                ATTEST_RESOURCE,
                &request_body,
                Duration::from_secs(10),
                &QuitToken::new(),
            )
            .expect("fetch");
        assert_eq!(body, response_body);
        quit.trigger();
        join.join().expect("server thread");
    }

    #[test]
    fn test_bad_request_maps_to_malformed() {
        let (addr, quit, join) = spawn_server(DEFAULT_BLOCK_SIZE, |_| ResourceOutcome::BadRequest);
        let mut client = client_for(addr, DEFAULT_BLOCK_SIZE);
        let err = client
            .fetch(ATTEST_RESOURCE, b"x", Duration::from_secs(5), &QuitToken::new())
            .expect_err("bad request");
        assert!(matches!(err, Error::MalformedMessage(_)));
        quit.trigger();
        join.join().expect("server thread");
    }

    #[test]
    fn test_server_error_maps_to_transport() {
        let (addr, quit, join) = spawn_server(DEFAULT_BLOCK_SIZE, |_| ResourceOutcome::ServerError);
        let mut client = client_for(addr, DEFAULT_BLOCK_SIZE);
        let err = client
            .fetch(ATTEST_RESOURCE, b"x", Duration::from_secs(5), &QuitToken::new())
            .expect_err("server error");
        assert!(matches!(err, Error::Transport(_)));
        quit.trigger();
        join.join().expect("server thread");
    }

    #[test]
    fn test_unknown_resource_is_transport_error() {
        let (addr, quit, join) =
            spawn_server(DEFAULT_BLOCK_SIZE, |_| ResourceOutcome::Content(vec![]));
        let mut client = client_for(addr, DEFAULT_BLOCK_SIZE);
        let err = client
            .fetch("no-such-resource", b"x", Duration::from_secs(5), &QuitToken::new())
            .expect_err("unknown resource");
        assert!(matches!(err, Error::Transport(_)));
        quit.trigger();
        join.join().expect("server thread");
    }

    #[test]
    fn test_silent_peer_times_out() {
        // A socket nobody reads from: every request goes unanswered.
        let sink = UdpSocket::bind("127.0.0.1:0").expect("sink");
        let addr = sink.local_addr().expect("addr");
        let mut client = client_for(addr, DEFAULT_BLOCK_SIZE);
        let err = client
            .fetch(
                ATTEST_RESOURCE,
                b"x",
                Duration::from_millis(200),
                &QuitToken::new(),
            )
            .expect_err("timeout");
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_secured_session_without_backend_is_rejected() {
        let mut config = TransportConfig::new("127.0.0.1", DEFAULT_PORT);
        config.security = SecurityMode::Psk(PskConfig {
            identity: "Vouchd Verifier".into(),
            key: b"Vouchd DTLS Key".to_vec(),
        });
        assert!(matches!(
            CoapClient::connect(&config),
            Err(Error::Transport(_))
        ));
        assert!(matches!(CoapServer::bind(&config), Err(Error::Transport(_))));
    }
}
