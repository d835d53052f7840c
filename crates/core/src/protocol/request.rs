//! RTSP request parsing and the per-connection state machine (RFC 2326 §6).
//!
//! One message is tokenized in a single pass: any run of `' '`, `';'`,
//! `'\r'`, `'\n'` separates words, `'\n'` additionally starts a new line.
//! Splitting on `';'` at this level means `Transport` parameters arrive
//! pre-separated, the same way header words do.
//!
//! All failures are reported as [`Status`] codes which the talker renders
//! into a single error reply; the connection survives.

use crate::error::Status;

/// Longest accepted request URI; longer ones fail with 414.
const MAX_URL_LEN: usize = 512;
/// Longest accepted `Session` header value; longer ones fail with 578.
const MAX_SESSION_LEN: usize = 16;

/// RTSP methods this server implements.
///
/// PAUSE is aliased to TEARDOWN at lookup: some clients (ffmpeg's RTSP
/// layer among them) send PAUSE where they mean to stop, and this server
/// does not rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Options,
    Describe,
    Setup,
    Play,
    GetParameter,
    Teardown,
}

/// Methods advertised in the OPTIONS `Public:` header.
pub const METHOD_NAMES: [&str; 7] = [
    "OPTIONS",
    "DESCRIBE",
    "SETUP",
    "PLAY",
    "GET_PARAMETER",
    "TEARDOWN",
    "PAUSE",
];

fn lookup_method(word: &str) -> Option<Method> {
    match word {
        "OPTIONS" => Some(Method::Options),
        "DESCRIBE" => Some(Method::Describe),
        "SETUP" => Some(Method::Setup),
        "PLAY" => Some(Method::Play),
        "GET_PARAMETER" => Some(Method::GetParameter),
        "TEARDOWN" | "PAUSE" => Some(Method::Teardown),
        _ => None,
    }
}

/// Negotiated transport from the SETUP `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    /// `RTP/AVP;unicast;client_port=N-M`
    Udp { rtp_port: u16, rtcp_port: u16 },
    /// `RTP/AVP/TCP;unicast;interleaved=0-1`
    Tcp,
}

/// A parsed RTSP request.
#[derive(Debug, Default)]
pub struct Request {
    pub method: Method,
    pub cseq: u32,
    /// Request URI with any trailing `/` removed.
    pub url: String,
    /// Path after `rtsp://host[:port]/`, still carrying any `/trackN`
    /// suffix; may itself contain slashes for file-backed streams.
    pub stream_name: Option<String>,
    pub accept: Option<String>,
    pub session_id: Option<String>,
    pub transport: Option<TransportSpec>,
}

/// Parse failure carrying the CSeq so the error reply can echo it.
#[derive(Debug)]
pub struct ParseError {
    pub status: Status,
    pub cseq: u32,
}

/// RTSP session state machine (RFC 2326 §A.1, server side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Ready,
    Playing,
}

/// Request parser holding the per-connection state.
///
/// SETUP moves INIT → READY, PLAY moves READY → PLAYING, TEARDOWN moves
/// any state back to INIT. PLAY before SETUP fails with 455.
pub struct Parser {
    state: ConnState,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: ConnState::Init,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Parse one complete request.
    ///
    /// Like the wire protocol itself, field errors are collected and the
    /// first one wins — but only after the request line was understood
    /// and the state machine consulted, so an out-of-state PLAY reports
    /// 455 even if a later header is also malformed.
    pub fn parse(&mut self, buf: &[u8]) -> Result<Request, ParseError> {
        let mut req = Request::default();
        let mut first_err: Option<Status> = None;
        fn record(e: Status, slot: &mut Option<Status>) {
            if slot.is_none() {
                *slot = Some(e);
            }
        }

        let text = match std::str::from_utf8(buf) {
            Ok(t) => t,
            Err(_) => {
                return Err(ParseError {
                    status: Status::BadRequest,
                    cseq: 0,
                });
            }
        };

        let lines = tokenize(text);
        if lines.is_empty() {
            return Err(ParseError {
                status: Status::BadRequest,
                cseq: 0,
            });
        }

        if let Err(e) = parse_request_line(&mut req, &lines[0]) {
            record(e, &mut first_err);
        }

        for words in &lines[1..] {
            if let Err(e) = parse_field(&mut req, words) {
                record(e, &mut first_err);
            }
        }

        match self.state {
            ConnState::Init => {
                if req.method == Method::Setup {
                    self.state = ConnState::Ready;
                } else if req.method == Method::Play {
                    return Err(ParseError {
                        status: Status::MethodNotValidInThisState,
                        cseq: req.cseq,
                    });
                }
            }
            ConnState::Ready => {
                if req.method == Method::Play {
                    self.state = ConnState::Playing;
                } else if req.method == Method::Teardown {
                    self.state = ConnState::Init;
                }
            }
            ConnState::Playing => {
                if req.method == Method::Teardown {
                    self.state = ConnState::Init;
                }
            }
        }

        match first_err {
            Some(status) => Err(ParseError {
                status,
                cseq: req.cseq,
            }),
            None => Ok(req),
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Split the message into lines of words. Separators are space, `;`,
/// CR and LF; LF terminates a line. Lines without words are dropped.
fn tokenize(text: &str) -> Vec<Vec<&str>> {
    text.split('\n')
        .map(|line| {
            line.split([' ', ';', '\r'])
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|words| !words.is_empty())
        .collect()
}

/// `Method SP Request-URI SP RTSP-Version`
fn parse_request_line(req: &mut Request, words: &[&str]) -> Result<(), Status> {
    let method = lookup_method(words[0]).ok_or(Status::MethodNotAllowed)?;
    req.method = method;
    if words.len() != 3 {
        return Err(Status::BadRequest);
    }
    if words[2] != "RTSP/1.0" {
        return Err(Status::RtspVersionNotSupported);
    }
    let mut url = words[1];
    if url.len() > MAX_URL_LEN {
        return Err(Status::RequestUriTooLarge);
    }
    url = url.strip_suffix('/').unwrap_or(url);
    req.url = url.to_string();
    req.stream_name = stream_name_of(url).map(str::to_string);
    Ok(())
}

/// Extract the stream name: the path after `scheme://host[:port]/`.
/// May be absent (`rtsp://host`), and may itself contain slashes.
fn stream_name_of(url: &str) -> Option<&str> {
    let first = url.find('/')?;
    if url.as_bytes().get(first + 1) != Some(&b'/') {
        return None;
    }
    let host = &url[first + 2..];
    let slash = host.find('/')?;
    let name = &host[slash + 1..];
    (!name.is_empty()).then_some(name)
}

/// One header line. Unrecognized fields are ignored.
fn parse_field(req: &mut Request, words: &[&str]) -> Result<(), Status> {
    match words[0] {
        "CSeq:" | "Accept:" | "Session:" | "Transport:" if words.len() < 2 => {
            Err(Status::MissingFieldArg)
        }
        "CSeq:" => {
            req.cseq = words[1].parse().unwrap_or(0);
            Ok(())
        }
        "Accept:" => {
            req.accept = Some(words[1].to_string());
            Ok(())
        }
        "Session:" => {
            if words[1].len() > MAX_SESSION_LEN {
                return Err(Status::SessionIdTooLong);
            }
            req.session_id = Some(words[1].to_string());
            Ok(())
        }
        "Transport:" => parse_transport(req, &words[1..]),
        _ => Ok(()),
    }
}

/// `Transport: RTP/AVP;unicast;client_port=1422-1423`
/// `Transport: RTP/AVP/TCP;unicast;interleaved=0-1`
fn parse_transport(req: &mut Request, words: &[&str]) -> Result<(), Status> {
    #[derive(PartialEq)]
    enum Proto {
        Udp,
        Tcp,
    }
    let mut proto: Option<Proto> = None;
    let mut ports: Option<(u16, u16)> = None;
    let mut unicast = false;
    let mut interleaved = false;

    for word in words {
        let (key, arg) = match word.split_once('=') {
            Some((k, a)) => (k, Some(a)),
            None => (*word, None),
        };
        match key {
            "RTP/AVP" => proto = Some(Proto::Udp),
            "RTP/AVP/TCP" => proto = Some(Proto::Tcp),
            "unicast" => unicast = true,
            "client_port" => {
                let spec = arg.ok_or(Status::BadPortSpec)?;
                let (p0, p1) = spec.split_once('-').ok_or(Status::BadPortSpec)?;
                let rtp = p0.parse::<u16>().map_err(|_| Status::BadPortSpec)?;
                let rtcp = p1.parse::<u16>().map_err(|_| Status::BadPortSpec)?;
                ports = Some((rtp, rtcp));
            }
            "interleaved" => {
                if arg != Some("0-1") || proto != Some(Proto::Tcp) {
                    return Err(Status::BadInterleavedSpec);
                }
                interleaved = true;
            }
            _ => {}
        }
    }

    let proto = proto.ok_or(Status::UnsupportedTransport)?;
    if !unicast {
        return Err(Status::SupportUnicastOnly);
    }
    match proto {
        Proto::Tcp => {
            if ports.is_some() {
                return Err(Status::TcpWithPorts);
            }
            if !interleaved {
                return Err(Status::BadInterleavedSpec);
            }
            req.transport = Some(TransportSpec::Tcp);
        }
        Proto::Udp => match ports {
            Some((rtp, rtcp)) if rtp != 0 && rtcp != 0 => {
                req.transport = Some(TransportSpec::Udp {
                    rtp_port: rtp,
                    rtcp_port: rtcp,
                });
            }
            _ => return Err(Status::UdpNoPorts),
        },
    }
    Ok(())
}
