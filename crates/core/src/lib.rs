//! # rtsp — RTSP media server for live and file-backed video streams
//!
//! A library for serving H.264, MJPEG and MPEG-4 video over the
//! Real-Time Streaming Protocol, with RTP delivery over UDP or
//! interleaved inside the RTSP TCP connection, and receiver-report
//! driven congestion control.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request parsing, session lifecycle, transport negotiation, interleaved framing |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Packet headers, SSRC generation, sender/receiver reports |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Session descriptions for DESCRIBE responses |
//! | [RFC 6184](https://tools.ietf.org/html/rfc6184) | H.264 RTP payload | Single-NAL and FU-A packetization, sprop parameter sets |
//! | [RFC 2435](https://tools.ietf.org/html/rfc2435) | JPEG RTP payload | MJPEG main header and fragmentation |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Producers (encoder callback / file reader)    │
//! ├───────────────────────────────────────────────┤
//! │  Server     — listener, options, source map    │
//! │  Talker     — per-connection control loop      │
//! ├───────────────────────────────────────────────┤
//! │  Source     — SPS/PPS cache, stream description│
//! │  Streamer   — packetization, client fan-out    │
//! ├───────────────────────────────────────────────┤
//! │  Protocol   — RTSP parsing, replies, SDP       │
//! │  RTCP       — RR parsing, SR emission, levels  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use rtsp::{EncoderType, Options, Server};
//!
//! let server = Server::start("0.0.0.0:554", Options::default()).unwrap();
//!
//! // Push compressed frames; for H.264 the slice starts at the NAL
//! // type octet. Clients reach the stream as rtsp://host/0.
//! // server.ingest_frame(0, 0, &frame, timestamp, EncoderType::H264);
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — [`Server`], [`Options`], the accept loop and frame
//!   ingest.
//! - [`source`] — live and file-backed [`Source`]s, [`StreamHooks`],
//!   backed by the H.264 elementary-stream reader thread.
//! - [`streamer`] — RTP packetization and per-client delivery.
//! - [`protocol`] — request parser, reply builder, SDP generation.
//! - [`rtcp`] — receiver reports, sender reports, congestion control.
//! - [`session`] — wire-format session identifiers.
//! - [`error`] — [`Status`] codes and the [`RtspError`] enum.

pub mod error;
pub(crate) mod file_source;
pub mod media;
pub mod protocol;
pub mod rtcp;
pub mod server;
pub mod session;
pub mod source;
pub(crate) mod source_map;
pub mod streamer;

mod talker;

pub use error::{Result, RtspError, Status};
pub use media::{EncoderType, StreamDesc};
pub use server::{Options, Server};
pub use session::SessionId;
pub use source::{DefaultHooks, Source, StreamHooks};
