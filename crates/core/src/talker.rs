//! Per-connection RTSP control loop.
//!
//! One talker thread per accepted TCP connection. The receive loop frames
//! either an RTSP message (terminated by `\r\n\r\n`) or an interleaved
//! RTCP message (`$`, channel, 16-bit length) out of a fixed 1024-byte
//! buffer, dispatches it, and writes a single reply.
//!
//! Protocol failures ([`Status`]) produce an error reply with the CSeq
//! echoed and the connection survives; socket failures and EOF end the
//! loop and tear the connection's client down.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Status;
use crate::media::EncoderType;
use crate::media::rtp;
use crate::protocol::sdp::{self, SdpParams};
use crate::protocol::{Method, Parser, Reply, Request, TransportSpec};
use crate::rtcp::{self, CongestionControl, RtcpListener};
use crate::server::{self, Server};
use crate::session::SessionId;
use crate::source::Source;
use crate::streamer::{Client, MediaSocket};

const BUFFER_SIZE: usize = 1024;

enum Msg {
    Rtsp(usize),
    Rtcp(usize),
    Overflow,
}

enum Action {
    None,
    Play,
    Teardown,
}

/// Thread entry point for one accepted connection.
pub(crate) fn run(stream: TcpStream, id: u32, server: Arc<Server>) {
    let mut talker = match Talker::new(stream, id, server) {
        Ok(talker) => talker,
        Err(e) => {
            tracing::warn!(talker = id, error = %e, "failed to set up connection");
            return;
        }
    };
    talker.run();
}

struct Talker {
    id: u32,
    stream: TcpStream,
    server: Arc<Server>,
    parser: Parser,
    session_id: Option<SessionId>,
    source: Option<Arc<Source>>,
    client: Option<Arc<Client>>,
    rtcp_listener: Option<RtcpListener>,
    /// Congestion control for interleaved clients, fed by channel-1
    /// messages on this connection.
    congestion: CongestionControl,
    server_ip: IpAddr,
    client_ip: IpAddr,
}

impl Talker {
    fn new(stream: TcpStream, id: u32, server: Arc<Server>) -> io::Result<Self> {
        let server_ip = stream.local_addr()?.ip();
        let client_ip = stream.peer_addr()?.ip();
        Ok(Self {
            id,
            stream,
            server,
            parser: Parser::new(),
            session_id: None,
            source: None,
            client: None,
            rtcp_listener: None,
            congestion: CongestionControl::new(),
            server_ip,
            client_ip,
        })
    }

    fn run(&mut self) {
        tracing::info!(talker = self.id, client = %self.client_ip, "talker thread listening");
        let mut rx = [0u8; BUFFER_SIZE];
        let mut rx_bytes = 0usize;

        let reason = loop {
            let msg = match self.receive_msg(&mut rx, &mut rx_bytes) {
                Ok(Some(msg)) => msg,
                Ok(None) => break "connection closed by client",
                Err(_) => break "read error",
            };
            match msg {
                Msg::Overflow => {
                    let reply = Reply::new(Status::ServerBufferOverflow, 0).serialize();
                    if self.stream.write_all(reply.as_bytes()).is_err() {
                        break "write error";
                    }
                    rx_bytes = 0;
                }
                Msg::Rtsp(len) => {
                    let teardown = match self.handle_rtsp(&rx[..len]) {
                        Ok(teardown) => teardown,
                        Err(_) => break "write error",
                    };
                    consume(&mut rx, &mut rx_bytes, len);
                    if teardown {
                        break "teardown";
                    }
                }
                Msg::Rtcp(len) => {
                    if self.handle_rtcp(&rx[..len]).is_err() {
                        break "write error";
                    }
                    consume(&mut rx, &mut rx_bytes, len);
                }
            }
        };

        self.teardown();
        tracing::info!(talker = self.id, reason, "talker terminating");
    }

    /// Accumulate bytes until one complete message is framed.
    fn receive_msg(
        &mut self,
        rx: &mut [u8; BUFFER_SIZE],
        rx_bytes: &mut usize,
    ) -> io::Result<Option<Msg>> {
        loop {
            if let Some(msg) = frame_message(&rx[..*rx_bytes]) {
                return Ok(Some(msg));
            }
            if *rx_bytes >= BUFFER_SIZE - 1 {
                return Ok(Some(Msg::Overflow));
            }
            let read = self.stream.read(&mut rx[*rx_bytes..])?;
            if read == 0 {
                return Ok(None);
            }
            *rx_bytes += read;
        }
    }

    /// Parse, dispatch and reply to one RTSP message. Returns whether
    /// the connection should tear down. The `Err` case is a failed
    /// socket write.
    fn handle_rtsp(&mut self, msg: &[u8]) -> io::Result<bool> {
        let (reply, action) = match self.parser.parse(msg) {
            Ok(req) => {
                tracing::debug!(
                    talker = self.id,
                    method = ?req.method,
                    cseq = req.cseq,
                    url = %req.url,
                    "request"
                );
                match self.process(&req) {
                    Ok(reply) => {
                        let action = match req.method {
                            Method::Play => Action::Play,
                            Method::Teardown => Action::Teardown,
                            _ => Action::None,
                        };
                        (reply, action)
                    }
                    Err(status) => {
                        tracing::warn!(talker = self.id, %status, "request failed");
                        (Reply::new(status, req.cseq), Action::None)
                    }
                }
            }
            Err(err) => {
                tracing::warn!(talker = self.id, status = %err.status, "parse error");
                (Reply::new(err.status, err.cseq), Action::None)
            }
        };

        let text = reply.serialize();
        tracing::trace!(talker = self.id, reply = %text, "reply");
        self.stream.write_all(text.as_bytes())?;

        match action {
            Action::Play => {
                // the reply went out first; actual delivery starts at
                // the next join-point frame inside the streamer
                if let (Some(client), Some(source)) = (&self.client, &self.source) {
                    client.request_play();
                    source.play();
                }
                Ok(false)
            }
            Action::Teardown => Ok(true),
            Action::None => Ok(false),
        }
    }

    /// Interleaved channel-1 payload: a receiver report from a TCP
    /// client.
    fn handle_rtcp(&mut self, msg: &[u8]) -> io::Result<()> {
        if msg[1] != rtp::CHANNEL_RTCP {
            tracing::warn!(talker = self.id, channel = msg[1], "unexpected interleaved channel");
            let reply = Reply::new(Status::BadRequest, 0).serialize();
            return self.stream.write_all(reply.as_bytes());
        }
        if let Some(report) = rtcp::parse_report(&msg[rtp::INTERLEAVED_LEN..])
            && self.server.options().temporal_levels
            && let Some(client) = &self.client
        {
            let increase_time = Duration::from_secs(self.server.options().increase_time);
            self.congestion.adjust(&report, client, increase_time);
        }
        Ok(())
    }

    fn process(&mut self, req: &Request) -> Result<Reply, Status> {
        match req.method {
            Method::Options => Ok(self.reply_options(req.cseq)),
            Method::Describe => self.reply_describe(req),
            Method::Setup => self.reply_setup(req),
            Method::Play => self.reply_play(req),
            Method::GetParameter => self.reply_get_parameter(req),
            Method::Teardown => self.reply_teardown(req),
        }
    }

    fn reply_options(&self, cseq: u32) -> Reply {
        Reply::ok(cseq).header("Public", crate::protocol::request::METHOD_NAMES.join(", "))
    }

    fn reply_describe(&mut self, req: &Request) -> Result<Reply, Status> {
        if let Some(accept) = &req.accept
            && !accept.eq_ignore_ascii_case("application/sdp")
        {
            return Err(Status::SupportOnlySdp);
        }
        let name = req.stream_name.clone().ok_or(Status::BadRequest)?;
        let source = self.get_source(&name)?;

        // first client for this stream: ask the application to produce
        if source.streamer().client_count() == 0 {
            source.request_app_play(&**self.server.hooks());
        }
        let desc = source.fill_desc(&**self.server.hooks())?;
        let params = if desc.encoder_type == EncoderType::H264 {
            Some(source.wait_param_sets()?)
        } else {
            None
        };

        let server_ip = self.server_ip.to_string();
        let sdp = sdp::generate(&SdpParams {
            server_ip: &server_ip,
            stream_name: &name,
            encoder: desc.encoder_type,
            bitrate: desc.bitrate,
            param_sets: params.as_ref().map(|(sps, pps)| (sps.as_slice(), pps.as_slice())),
        })?;

        Ok(Reply::ok(req.cseq)
            .header("Content-Base", format!("{}/", req.url))
            .header("Content-Type", "application/sdp")
            .body(sdp))
    }

    fn reply_setup(&mut self, req: &Request) -> Result<Reply, Status> {
        let raw_name = req.stream_name.as_deref().ok_or(Status::BadRequest)?;
        let name = strip_track_suffix(raw_name).to_string();
        let transport = req.transport.ok_or(Status::UnsupportedTransport)?;
        let source = self.get_source(&name)?;
        match transport {
            TransportSpec::Udp { rtp_port, rtcp_port } => {
                self.setup_udp(&source, rtp_port, rtcp_port, req.cseq)
            }
            TransportSpec::Tcp => self.setup_tcp(&source, req.cseq),
        }
    }

    fn setup_udp(
        &mut self,
        source: &Arc<Source>,
        rtp_port: u16,
        rtcp_port: u16,
        cseq: u32,
    ) -> Result<Reply, Status> {
        let rtp = UdpSocket::bind("0.0.0.0:0").map_err(|e| self.socket_error("bind rtp", e))?;
        rtp.connect((self.client_ip, rtp_port))
            .map_err(|e| self.socket_error("connect rtp", e))?;
        let server_port = rtp
            .local_addr()
            .map_err(|e| self.socket_error("local addr", e))?
            .port();

        let rtcp_out =
            UdpSocket::bind("0.0.0.0:0").map_err(|e| self.socket_error("bind rtcp", e))?;
        rtcp_out
            .connect((self.client_ip, rtcp_port))
            .map_err(|e| self.socket_error("connect rtcp", e))?;

        // inbound receiver reports arrive on the port paired with ours
        let rtcp_in_port = server_port
            .checked_add(1)
            .ok_or(Status::InternalServerError)?;
        let rtcp_in = UdpSocket::bind(("0.0.0.0", rtcp_in_port))
            .map_err(|e| self.socket_error("bind rtcp in", e))?;

        let client = source
            .streamer()
            .add_client(MediaSocket::Udp(rtp), MediaSocket::Udp(rtcp_out), self.id);
        self.client = Some(client.clone());
        let session_id = SessionId::generate();
        self.session_id = Some(session_id);

        let options = self.server.options();
        self.rtcp_listener = Some(RtcpListener::spawn(
            rtcp_in,
            client,
            options.temporal_levels,
            Duration::from_secs(options.increase_time),
            self.id,
        ));

        tracing::info!(
            talker = self.id,
            source = %source.name(),
            client = %self.client_ip,
            client_port = rtp_port,
            server_port,
            "UDP stream set up"
        );
        Ok(Reply::ok(cseq)
            .header(
                "Transport",
                format!(
                    "RTP/AVP;unicast;destination={};source={};client_port={}-{};server_port={}-{}",
                    self.client_ip, self.server_ip, rtp_port, rtcp_port, server_port, rtcp_in_port
                ),
            )
            .header("Session", session_id))
    }

    fn setup_tcp(&mut self, source: &Arc<Source>, cseq: u32) -> Result<Reply, Status> {
        let options = self.server.options();
        if options.tcp_nodelay {
            let _ = self.stream.set_nodelay(true);
        }
        if options.send_buff_size > 0 {
            server::set_send_buffer(&self.stream, options.send_buff_size);
        }
        if options.tcp_cork {
            server::set_cork(&self.stream, true);
        }

        let rtp = self
            .stream
            .try_clone()
            .map_err(|e| self.socket_error("clone control stream", e))?;
        let rtcp = self
            .stream
            .try_clone()
            .map_err(|e| self.socket_error("clone control stream", e))?;
        let client = source
            .streamer()
            .add_client(MediaSocket::Tcp(rtp), MediaSocket::Tcp(rtcp), self.id);
        self.client = Some(client);
        let session_id = SessionId::generate();
        self.session_id = Some(session_id);

        tracing::info!(
            talker = self.id,
            source = %source.name(),
            client = %self.client_ip,
            "interleaved TCP stream set up"
        );
        Ok(Reply::ok(cseq)
            .header(
                "Transport",
                format!(
                    "RTP/AVP/TCP;unicast;destination={};source={};interleaved=0-1",
                    self.client_ip, self.server_ip
                ),
            )
            .header("Session", session_id))
    }

    fn reply_play(&mut self, req: &Request) -> Result<Reply, Status> {
        self.check_session(req)?;
        let source = self.source.as_ref().ok_or(Status::InternalServerError)?;
        if self.client.is_none() {
            return Err(Status::InternalServerError);
        }
        let session_id = self.session_id.ok_or(Status::SessionNotFound)?;
        Ok(Reply::ok(req.cseq)
            .header("Range", "npt=0.000-")
            .header("Session", session_id)
            .header(
                "RTP-Info",
                format!(
                    "url={}/track1;seq={};rtptime={}",
                    req.url,
                    source.streamer().seq_number(),
                    source.timestamp()
                ),
            ))
    }

    fn reply_get_parameter(&self, req: &Request) -> Result<Reply, Status> {
        let mut reply = Reply::ok(req.cseq);
        if req.session_id.is_some() {
            self.check_session(req)?;
            if let Some(session_id) = self.session_id {
                reply = reply.header("Session", session_id);
            }
        }
        Ok(reply)
    }

    fn reply_teardown(&self, req: &Request) -> Result<Reply, Status> {
        if self.session_id.is_some() {
            self.check_session(req)?;
        }
        Ok(Reply::ok(req.cseq))
    }

    /// Validate the request's session id against the one bound to this
    /// connection.
    fn check_session(&self, req: &Request) -> Result<(), Status> {
        let bound = self.session_id.ok_or(Status::SessionNotFound)?;
        let given = req.session_id.as_deref().ok_or(Status::SessionNotFound)?;
        if SessionId::parse(given) != bound {
            return Err(Status::SessionNotFound);
        }
        Ok(())
    }

    /// Resolve and pin the source for this connection.
    fn get_source(&mut self, name: &str) -> Result<Arc<Source>, Status> {
        if let Some(source) = &self.source {
            return Ok(source.clone());
        }
        let source = self.server.resolve_source(name)?;
        self.source = Some(source.clone());
        Ok(source)
    }

    fn socket_error(&self, what: &str, e: io::Error) -> Status {
        tracing::error!(talker = self.id, what, error = %e, "socket setup failed");
        Status::InternalServerError
    }

    fn teardown(&mut self) {
        if let Some(listener) = self.rtcp_listener.take() {
            listener.stop();
        }
        if let (Some(source), Some(client)) = (self.source.take(), self.client.take()) {
            tracing::debug!(talker = self.id, source = %source.name(), "deleting client");
            self.server.teardown_client(&source, &client);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Shift residual bytes to the buffer head after a message was handled.
fn consume(rx: &mut [u8; BUFFER_SIZE], rx_bytes: &mut usize, len: usize) {
    rx.copy_within(len..*rx_bytes, 0);
    *rx_bytes -= len;
}

/// Frame one complete message out of the buffered bytes, if present.
fn frame_message(buf: &[u8]) -> Option<Msg> {
    if buf.is_empty() {
        return None;
    }
    if buf[0] == b'$' {
        if buf.len() < rtp::INTERLEAVED_LEN {
            return None;
        }
        let size = (((buf[2] as usize) << 8) | buf[3] as usize) + rtp::INTERLEAVED_LEN;
        if buf.len() < size {
            return None;
        }
        return Some(Msg::Rtcp(size));
    }
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| Msg::Rtsp(pos + 4))
}

/// Strip a `/trackN` control suffix before resolving the stream name.
fn strip_track_suffix(name: &str) -> &str {
    if let Some(pos) = name.rfind("/track") {
        let digits = &name[pos + "/track".len()..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return &name[..pos];
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_suffix_stripping() {
        assert_eq!(strip_track_suffix("0/track1"), "0");
        assert_eq!(strip_track_suffix("clips/a.264/track12"), "clips/a.264");
        assert_eq!(strip_track_suffix("0"), "0");
        assert_eq!(strip_track_suffix("a/trackless"), "a/trackless");
        assert_eq!(strip_track_suffix("a/track"), "a/track");
    }

    #[test]
    fn frames_rtsp_message() {
        let buf = b"OPTIONS rtsp://h/ RTSP/1.0\r\nCSeq: 1\r\n\r\nrest";
        match frame_message(buf) {
            Some(Msg::Rtsp(len)) => assert_eq!(len, buf.len() - 4),
            _ => panic!("expected framed RTSP message"),
        }
    }

    #[test]
    fn partial_rtsp_message_waits() {
        assert!(frame_message(b"OPTIONS rtsp://h/ RTSP/1.0\r\nCSeq: 1\r\n").is_none());
    }

    #[test]
    fn frames_interleaved_rtcp() {
        let mut buf = vec![b'$', 1, 0, 3];
        buf.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        match frame_message(&buf) {
            Some(Msg::Rtcp(len)) => assert_eq!(len, 7),
            _ => panic!("expected framed RTCP message"),
        }
    }

    #[test]
    fn partial_interleaved_waits() {
        assert!(frame_message(&[b'$', 1, 0]).is_none());
        assert!(frame_message(&[b'$', 1, 0, 10, 1, 2]).is_none());
    }
}
