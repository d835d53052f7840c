//! RTP packetization and fan-out to connected clients.
//!
//! A [`Streamer`] belongs to one [`Source`](crate::source::Source). The
//! producer thread hands it whole frames; the streamer splits them into
//! RTP packets (single NAL, FU-A, RFC 2435 JPEG, or MPEG-4 slices) and
//! delivers every packet to each attached [`Client`].
//!
//! Each packet is assembled once in a scratch buffer laid out as
//!
//! ```text
//! [ 4-byte interleaved prefix | 12-byte RTP header | codec header | payload ]
//! ```
//!
//! and then sent per client: TCP clients transmit the whole buffer, UDP
//! clients skip the prefix. Only the two sequence-number bytes differ
//! between clients, so they are patched in place just before each send.
//!
//! The streamer advances its own sequence counter once per packet, but
//! the on-wire value is always the per-client counter.

use std::io::{self, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};

use parking_lot::Mutex;
use rand::RngExt;

use crate::error::Status;
use crate::media::rtp;
use crate::media::{self, EncoderType, StreamDesc};
use crate::rtcp;
use crate::server::Pacer;

/// SR cadence in RTP timestamp ticks: 5 seconds at 90 kHz.
const RTCP_INTERVAL: u32 = 5 * 90_000;
const TEMPORAL_LEVELS: u8 = 3;

const STATE_STOP: u8 = 0;
const STATE_REQUEST: u8 = 1;
const STATE_PLAY: u8 = 2;

/// Media-plane socket: a connected UDP socket, or the shared RTSP control
/// stream for interleaved transport.
pub(crate) enum MediaSocket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl MediaSocket {
    fn send(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(socket) => socket.send(buf).map(|_| ()),
            Self::Tcp(stream) => {
                let mut writer = stream;
                writer.write_all(buf)
            }
        }
    }

    fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }
}

/// Per-packet context handed from the streamer to each client.
pub(crate) struct PacketCtx {
    /// Final packet of the access unit (drives the SR cadence check).
    last: bool,
    /// A client in REQUEST state may start playing on this frame.
    join_point: bool,
    frame_index: u32,
    timestamp: u32,
    ssrc: u32,
}

/// One remote media destination.
///
/// The producer thread is the only writer of the RTP socket; the talker
/// flips `state` on PLAY/TEARDOWN and the RTCP path adjusts
/// `temporal_level`, so those are atomics.
pub struct Client {
    rtp: MediaSocket,
    rtcp: MediaSocket,
    /// 4 for TCP (interleaved prefix included on the wire), 0 for UDP.
    offset: usize,
    state: AtomicU8,
    seq_number: AtomicU16,
    total_bytes: AtomicU32,
    total_packets: AtomicU32,
    /// RTP timestamp of the last sender report.
    last_sr: AtomicU32,
    /// 0 full rate .. 2 quarter rate.
    temporal_level: AtomicU8,
    /// Owning talker's id, for log correlation.
    id: u32,
}

impl Client {
    pub(crate) fn new(rtp: MediaSocket, rtcp: MediaSocket, id: u32) -> Self {
        let offset = if rtp.is_tcp() {
            rtp::INTERLEAVED_LEN
        } else {
            0
        };
        Self {
            rtp,
            rtcp,
            offset,
            state: AtomicU8::new(STATE_STOP),
            seq_number: AtomicU16::new(0),
            total_bytes: AtomicU32::new(0),
            total_packets: AtomicU32::new(0),
            last_sr: AtomicU32::new(0),
            temporal_level: AtomicU8::new(0),
            id,
        }
    }

    /// RTSP PLAY arrived: delivery starts at the next join point.
    pub(crate) fn request_play(&self) {
        self.state.store(STATE_REQUEST, Ordering::Relaxed);
    }

    pub(crate) fn stop(&self) {
        self.state.store(STATE_STOP, Ordering::Relaxed);
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.state.load(Ordering::Relaxed) == STATE_PLAY
    }

    pub(crate) fn set_temporal_level(&self, level: u8) {
        let level = level.min(TEMPORAL_LEVELS - 1);
        tracing::debug!(client = self.id, level, "setting temporal level");
        self.temporal_level.store(level, Ordering::Relaxed);
    }

    pub(crate) fn temporal_level(&self) -> u8 {
        self.temporal_level.load(Ordering::Relaxed)
    }

    /// Coarsen sampling by one level (congestion detected).
    pub(crate) fn increase_level(&self) {
        let level = self.temporal_level.load(Ordering::Relaxed);
        if level < TEMPORAL_LEVELS - 1 {
            self.temporal_level.store(level + 1, Ordering::Relaxed);
            tracing::info!(client = self.id, level = level + 1, "increasing temporal level");
        }
    }

    /// Move back toward full rate after a quiet period.
    pub(crate) fn reduce_level(&self) {
        let level = self.temporal_level.load(Ordering::Relaxed);
        if level > 0 {
            self.temporal_level.store(level - 1, Ordering::Relaxed);
            tracing::info!(client = self.id, level = level - 1, "decreasing temporal level");
        }
    }

    fn skip_frame(&self, frame_index: u32) -> bool {
        let level = self.temporal_level.load(Ordering::Relaxed);
        frame_index & (3 >> (2 - level as u32)) != 0
    }

    /// Deliver one packet. `scratch` starts at the interleaved prefix and
    /// holds `wire_len` RTP bytes after it.
    fn send(&self, scratch: &mut [u8], wire_len: usize, ctx: &PacketCtx, pacer: &Pacer) {
        if self.state.load(Ordering::Relaxed) == STATE_REQUEST && ctx.join_point {
            tracing::debug!(client = self.id, "starting to play");
            self.state.store(STATE_PLAY, Ordering::Relaxed);
        }
        if self.state.load(Ordering::Relaxed) != STATE_PLAY {
            return;
        }
        if self.skip_frame(ctx.frame_index) {
            tracing::trace!(
                client = self.id,
                frame_index = ctx.frame_index,
                level = self.temporal_level.load(Ordering::Relaxed),
                "filtering out frame"
            );
            return;
        }

        pacer.wait();

        let seq = self.seq_number.load(Ordering::Relaxed);
        rtp::patch_seq_number(&mut scratch[rtp::INTERLEAVED_LEN..], seq);
        let wire = &scratch[rtp::INTERLEAVED_LEN - self.offset..rtp::INTERLEAVED_LEN + wire_len];

        match self.rtp.send(wire) {
            Ok(()) => {
                self.seq_number.store(seq.wrapping_add(1), Ordering::Relaxed);
                self.total_bytes
                    .fetch_add(wire_len as u32, Ordering::Relaxed);
                self.total_packets.fetch_add(1, Ordering::Relaxed);
                let last_sr = self.last_sr.load(Ordering::Relaxed);
                if ctx.last && ctx.timestamp.wrapping_sub(last_sr) > RTCP_INTERVAL {
                    self.send_sender_report(ctx.ssrc, ctx.timestamp);
                    self.last_sr.store(ctx.timestamp, Ordering::Relaxed);
                }
            }
            Err(e) => {
                self.state.store(STATE_STOP, Ordering::Relaxed);
                tracing::warn!(client = self.id, error = %e, "switching off client after socket error");
            }
        }
    }

    fn send_sender_report(&self, ssrc: u32, timestamp: u32) {
        let packet = rtcp::sender_report(
            ssrc,
            timestamp,
            self.total_packets.load(Ordering::Relaxed),
            self.total_bytes.load(Ordering::Relaxed),
        );
        let wire = &packet[rtp::INTERLEAVED_LEN - self.offset..];
        match self.rtcp.send(wire) {
            Ok(()) => tracing::debug!(
                client = self.id,
                bytes = self.total_bytes.load(Ordering::Relaxed),
                packets = self.total_packets.load(Ordering::Relaxed),
                timestamp,
                "sent RTCP sender report"
            ),
            Err(e) => tracing::warn!(client = self.id, error = %e, "RTCP sender report send failed"),
        }
    }
}

/// Packetization state, touched only by the producer thread but wrapped
/// in a mutex so the streamer itself can be shared.
struct PacketState {
    scratch: Vec<u8>,
    seq_number: u16,
    timestamp: u32,
    /// 0 for SPS/PPS/I frames, incremented per frame; drives temporal
    /// sub-sampling.
    frame_index: u32,
}

/// Packetizes frames and fans them out to all attached clients.
pub struct Streamer {
    clients: Mutex<Vec<Arc<Client>>>,
    state: Mutex<PacketState>,
    packet_size: usize,
    ssrc: u32,
    pacer: Arc<Pacer>,
}

impl Streamer {
    pub(crate) fn new(packet_size: usize, pacer: Arc<Pacer>) -> Self {
        let mut rng = rand::rng();
        Self::with_params(packet_size, rng.random(), rng.random(), pacer)
    }

    pub(crate) fn with_params(
        packet_size: usize,
        ssrc: u32,
        seq_number: u16,
        pacer: Arc<Pacer>,
    ) -> Self {
        tracing::debug!(
            packet_size,
            ssrc = format_args!("{:#010X}", ssrc),
            seq_number,
            "streamer created"
        );
        Self {
            clients: Mutex::new(Vec::new()),
            state: Mutex::new(PacketState {
                scratch: Vec::with_capacity(
                    rtp::INTERLEAVED_LEN + rtp::RTP_HEADER_LEN + MJPEG_HEADER_LEN + packet_size,
                ),
                seq_number,
                timestamp: 0,
                frame_index: 0,
            }),
            packet_size,
            ssrc,
            pacer,
        }
    }

    /// Streamer-internal sequence counter (advertised in RTP-Info).
    pub(crate) fn seq_number(&self) -> u16 {
        self.state.lock().seq_number
    }

    pub(crate) fn add_client(
        &self,
        rtp: MediaSocket,
        rtcp: MediaSocket,
        talker_id: u32,
    ) -> Arc<Client> {
        let client = Arc::new(Client::new(rtp, rtcp, talker_id));
        self.clients.lock().push(client.clone());
        tracing::debug!(client = talker_id, "added client to streamer");
        client
    }

    pub(crate) fn delete_client(&self, client: &Arc<Client>) {
        tracing::debug!(client = client.id, "removing client from streamer");
        self.clients.lock().retain(|c| !Arc::ptr_eq(c, client));
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub(crate) fn set_temporal_level(&self, level: u8) {
        for client in self.clients.lock().iter() {
            client.set_temporal_level(level);
        }
    }

    /// Packetize and deliver one frame.
    ///
    /// For H.264 the first byte of `frame` must be the NAL unit type
    /// octet (start code already stripped). The timestamp is forwarded
    /// untouched — it is already on the RTP clock.
    pub(crate) fn send_frame(
        &self,
        frame: &[u8],
        timestamp: u32,
        desc: &StreamDesc,
    ) -> Result<(), Status> {
        if frame.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.timestamp = timestamp;
        match desc.encoder_type {
            EncoderType::H264 => self.h264_send_frame(&mut state, frame),
            EncoderType::Mjpeg => self.mjpeg_send_frame(&mut state, frame, desc),
            EncoderType::Mpeg4 => self.mpeg4_send_frame(&mut state, frame),
            EncoderType::Unknown => return Err(Status::UnsupportedEncoder),
        }
        Ok(())
    }

    fn h264_send_frame(&self, state: &mut PacketState, frame: &[u8]) {
        let frame_type = media::frame_type(frame[0]);
        tracing::trace!(
            frame_type = %frame_type,
            size = frame.len(),
            timestamp = state.timestamp,
            "H264 frame"
        );
        if matches!(frame_type, 's' | 'p' | 'I') {
            state.frame_index = 0;
        }
        // SPS/PPS never carry the marker even when they end the packet run
        let param_set = matches!(frame_type, 's' | 'p');
        let join_point = frame_type == 's';

        if frame.len() <= self.packet_size {
            self.emit(state, 96, !param_set, true, join_point, &[], frame);
        } else {
            // FU-A fragmentation (RFC 6184 §5.8). The indicator keeps the
            // original F/NRI bits; the header carries the NAL type with
            // Start on the first fragment and End on the last.
            let fu_indicator = (frame[0] & !media::NAL_TYPE_MASK) | rtp::NAL_TYPE_FU_A;
            let mut fu_header = (frame[0] & media::NAL_TYPE_MASK) | rtp::FU_START_BIT;
            let payload = &frame[1..];
            let mut remaining = frame.len() as i64;
            let mut offset = 0usize;
            let mut first = true;
            while remaining > 0 {
                let last = remaining <= self.packet_size as i64;
                if last {
                    fu_header |= rtp::FU_END_BIT;
                }
                let chunk_len = (payload.len() - offset).min(self.packet_size);
                let chunk = &payload[offset..offset + chunk_len];
                self.emit(
                    state,
                    96,
                    last && !param_set,
                    last,
                    join_point,
                    &[fu_indicator, fu_header],
                    chunk,
                );
                fu_header &= !rtp::FU_START_BIT;
                offset += chunk_len;
                remaining -= self.packet_size as i64 + i64::from(first);
                first = false;
            }
            tracing::trace!(
                nal_size = frame.len(),
                fragments = offset.div_ceil(self.packet_size),
                "FU-A fragmented NAL unit"
            );
        }
        state.frame_index += 1;
    }

    fn mjpeg_send_frame(&self, state: &mut PacketState, frame: &[u8], desc: &StreamDesc) {
        tracing::trace!(size = frame.len(), timestamp = state.timestamp, "MJPEG frame");
        let mut offset = 0usize;
        while offset < frame.len() {
            let chunk_len = (frame.len() - offset).min(self.packet_size);
            let chunk = &frame[offset..offset + chunk_len];
            let last = offset + chunk_len >= frame.len();
            let header = mjpeg_header(offset as u32, desc);
            self.emit(state, 26, last, last, true, &header, chunk);
            offset += chunk_len;
        }
    }

    fn mpeg4_send_frame(&self, state: &mut PacketState, frame: &[u8]) {
        let starter = media::is_mpeg4_starter(frame);
        tracing::trace!(
            starter,
            size = frame.len(),
            timestamp = state.timestamp,
            "MPEG4 frame"
        );
        if frame.len() <= self.packet_size {
            // marker is inverted for unfragmented starter frames
            self.emit(state, 96, !starter, !starter, starter, &[], frame);
        } else {
            let mut offset = 0usize;
            while offset < frame.len() {
                let chunk_len = (frame.len() - offset).min(self.packet_size);
                let chunk = &frame[offset..offset + chunk_len];
                let last = offset + chunk_len >= frame.len();
                self.emit(state, 96, last, last, starter, &[], chunk);
                offset += chunk_len;
            }
        }
    }

    /// Assemble one packet in the scratch buffer and deliver it to every
    /// client, then advance the streamer's own sequence counter.
    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        state: &mut PacketState,
        payload_type: u8,
        marker: bool,
        last: bool,
        join_point: bool,
        codec_header: &[u8],
        payload: &[u8],
    ) {
        let wire_len = rtp::RTP_HEADER_LEN + codec_header.len() + payload.len();
        let total = rtp::INTERLEAVED_LEN + wire_len;
        state.scratch.resize(total, 0);

        let (seq, timestamp, frame_index) = (state.seq_number, state.timestamp, state.frame_index);
        let scratch = &mut state.scratch;
        rtp::write_interleaved_prefix(&mut scratch[..rtp::INTERLEAVED_LEN], rtp::CHANNEL_RTP, wire_len);
        let body = &mut scratch[rtp::INTERLEAVED_LEN..];
        rtp::write_rtp_header(body, payload_type, marker, seq, timestamp, self.ssrc);
        let codec_end = rtp::RTP_HEADER_LEN + codec_header.len();
        body[rtp::RTP_HEADER_LEN..codec_end].copy_from_slice(codec_header);
        body[codec_end..wire_len].copy_from_slice(payload);

        let ctx = PacketCtx {
            last,
            join_point,
            frame_index,
            timestamp,
            ssrc: self.ssrc,
        };
        let clients = self.clients.lock();
        for client in clients.iter() {
            client.send(&mut state.scratch, wire_len, &ctx, &self.pacer);
        }
        drop(clients);
        state.seq_number = state.seq_number.wrapping_add(1);
    }
}

const MJPEG_HEADER_LEN: usize = 8;

/// RFC 2435 main JPEG header: type-specific, 24-bit fragment offset,
/// type 1, Q, width/8, height/8.
fn mjpeg_header(fragment_offset: u32, desc: &StreamDesc) -> [u8; MJPEG_HEADER_LEN] {
    let offset = fragment_offset & 0x00FF_FFFF;
    [
        0,
        (offset >> 16) as u8,
        (offset >> 8) as u8,
        offset as u8,
        1, // type
        desc.quality,
        (desc.width / 8) as u8,
        (desc.height / 8) as u8,
    ]
}
