//! RTCP receiver reports, sender reports and congestion control
//! (RFC 3550 §6).
//!
//! Inbound traffic is expected to be a Receiver Report immediately
//! followed by a Source Description chunk in one datagram — the shape
//! every mainstream RTSP client produces. Anything else is dropped with
//! a warning.
//!
//! ```text
//!        0                   1                   2                   3
//! header |V=2|P|    RC   |   PT=RR=201   |             length            |
//!        |                     SSRC of packet sender                     |
//! report |                 SSRC_1 (SSRC of first source)                 |
//! block  | fraction lost |       cumulative number of packets lost      |
//!        |           extended highest sequence number received          |
//!        |                      interarrival jitter                     |
//!        |                         last SR (LSR)                        |
//!        |                   delay since last SR (DLSR)                 |
//! ```
//!
//! For UDP clients a dedicated thread listens on `server_rtp_port + 1`;
//! for interleaved TCP the talker feeds channel-1 payloads straight into
//! [`parse_report`]. Either path drives the temporal-level congestion
//! control when the server option is enabled.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::media::rtp;
use crate::streamer::Client;

const SR_PACKET_TYPE: u8 = 200;
const RR_PACKET_TYPE: u8 = 201;
const SDES_PACKET_TYPE: u8 = 202;
const SDES_CNAME: u8 = 1;
/// Offset between the Unix and NTP epochs, in seconds.
const NTP_OFFSET: u32 = 2_208_988_800;

const RTP_VERSION: u16 = 2;

/// RR fixed part (8 header bytes + one report block).
const RR_LEN: usize = 32;
/// SDES fixed part before the name bytes.
const SDES_FIXED_LEN: usize = 10;
const SDES_NAME_MAX: usize = 64;

/// A decoded receiver report.
#[derive(Debug, Clone, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    /// Loss fraction since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Sign-extended 24-bit cumulative loss counter.
    pub cumulative_lost: i32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_last_sr: u32,
    /// CNAME from the trailing SDES chunk.
    pub cname: String,
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Parse one RR+SDES compound packet. Returns `None` (after logging) on
/// anything that does not match the expected layout.
pub fn parse_report(buf: &[u8]) -> Option<ReceiverReport> {
    let min = RR_LEN + SDES_FIXED_LEN;
    let max = RR_LEN + SDES_FIXED_LEN + SDES_NAME_MAX;
    if buf.len() < min || buf.len() > max {
        tracing::warn!(
            size = buf.len(),
            expected = format_args!("{min}-{max}"),
            "ignoring RTCP packet with unexpected size"
        );
        return None;
    }

    let rr_type = (be16(buf, 0) & 0x00FF) as u8;
    if rr_type != RR_PACKET_TYPE {
        tracing::warn!(
            packet_type = rr_type,
            expected = RR_PACKET_TYPE,
            "ignoring RTCP packet, not a receiver report"
        );
        return None;
    }
    let sdes_type = (be16(buf, RR_LEN) & 0x00FF) as u8;
    if sdes_type != SDES_PACKET_TYPE {
        tracing::warn!(
            packet_type = sdes_type,
            expected = SDES_PACKET_TYPE,
            "ignoring RTCP packet, RR not followed by SDES"
        );
        return None;
    }

    let loss_word = be32(buf, 12);
    let item_len = (buf[RR_LEN + 9] as usize).min(buf.len() - min);
    let report = ReceiverReport {
        ssrc: be32(buf, 4),
        fraction_lost: (loss_word >> 24) as u8,
        cumulative_lost: ((loss_word << 8) as i32) >> 8,
        highest_seq: be32(buf, 16),
        jitter: be32(buf, 20),
        last_sr: be32(buf, 24),
        delay_last_sr: be32(buf, 28),
        cname: String::from_utf8_lossy(&buf[min..min + item_len]).into_owned(),
    };
    tracing::debug!(
        fraction_lost = report.fraction_lost,
        cumulative_lost = report.cumulative_lost,
        highest_seq = report.highest_seq,
        jitter = report.jitter,
        cname = %report.cname,
        "received RTCP receiver report"
    );
    Some(report)
}

/// Build a compound SR+SDES packet, prefixed with the interleaved header
/// on channel 1. UDP senders skip the first four bytes.
pub(crate) fn sender_report(ssrc: u32, rtp_timestamp: u32, packets: u32, bytes: u32) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut out = Vec::with_capacity(rtp::INTERLEAVED_LEN + 28 + SDES_FIXED_LEN + SDES_NAME_MAX);
    out.extend_from_slice(&[0u8; rtp::INTERLEAVED_LEN]);

    // SR: header, SSRC, NTP, RTP timestamp, counters (length 6 = 28/4 - 1)
    out.extend_from_slice(&((RTP_VERSION << 14) | SR_PACKET_TYPE as u16).to_be_bytes());
    out.extend_from_slice(&6u16.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(&(now.as_secs() as u32).wrapping_add(NTP_OFFSET).to_be_bytes());
    out.extend_from_slice(&now.subsec_nanos().to_be_bytes());
    out.extend_from_slice(&rtp_timestamp.to_be_bytes());
    out.extend_from_slice(&packets.to_be_bytes());
    out.extend_from_slice(&bytes.to_be_bytes());

    // SDES with a single CNAME item carrying the hostname
    let name = hostname();
    let name = name.as_bytes();
    let sdes_len = SDES_FIXED_LEN + name.len() + 3;
    out.extend_from_slice(
        &((RTP_VERSION << 14) | ((1u16) << 8) | SDES_PACKET_TYPE as u16).to_be_bytes(),
    );
    out.extend_from_slice(&((sdes_len / 4 - 1) as u16).to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.push(SDES_CNAME);
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    out.extend_from_slice(&[0u8; 3]);

    let size = out.len() - rtp::INTERLEAVED_LEN;
    rtp::write_interleaved_prefix(&mut out[..rtp::INTERLEAVED_LEN], rtp::CHANNEL_RTCP, size);
    out
}

/// Hostname for the SDES CNAME item, truncated to the 63 bytes the
/// item-length octet and the original wire format allow.
fn hostname() -> String {
    let mut buf = [0u8; SDES_NAME_MAX];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if rc != 0 {
        return "rtsp-media-server".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len() - 1);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Temporal-level congestion control driven by receiver reports.
///
/// Coarsen when losses show up in the recent history, move back toward
/// full rate after `increase_time` without any loss. The loss history is
/// a bit register shifted on every report:
///
/// ```text
///    -2  -1   0
///    ----------
///         0   0   nothing
///         0   1   coarsen
///         1   0   nothing
///    0    1   1   nothing
///    1    1   1   coarsen
/// ```
pub(crate) struct CongestionControl {
    packet_loss: u32,
    last_loss_time: Instant,
}

impl CongestionControl {
    /// Loss fraction above this percentage counts as a lossy interval.
    const INCREASE_PERC: u32 = 2;

    pub fn new() -> Self {
        Self {
            packet_loss: 0,
            last_loss_time: Instant::now(),
        }
    }

    pub fn adjust(&mut self, report: &ReceiverReport, client: &Client, increase_time: Duration) {
        if report.fraction_lost == 0 {
            if self.last_loss_time.elapsed() > increase_time {
                client.reduce_level();
                self.last_loss_time = Instant::now();
            }
        } else {
            self.last_loss_time = Instant::now();
        }

        let lossy = u32::from(report.fraction_lost) > Self::INCREASE_PERC * 256 / 100;
        self.packet_loss = (self.packet_loss << 1) | lossy as u32;
        tracing::trace!(flags = self.packet_loss & 7, "packet loss history");
        if (self.packet_loss & 3) == 1 || (self.packet_loss & 7) == 7 {
            client.increase_level();
        }
    }
}

/// Background reader for a UDP client's inbound RTCP socket.
pub(crate) struct RtcpListener {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RtcpListener {
    /// Listen on `socket` for receiver reports from `client`'s peer.
    pub fn spawn(
        socket: UdpSocket,
        client: Arc<Client>,
        congestion_control: bool,
        increase_time: Duration,
        talker_id: u32,
    ) -> Self {
        // the read timeout bounds how long stop() can take
        if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(500))) {
            tracing::warn!(talker = talker_id, error = %e, "failed to set RTCP read timeout");
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = thread::spawn(move || {
            tracing::debug!(talker = talker_id, "RTCP listener thread started");
            let mut control = CongestionControl::new();
            let mut buf = [0u8; 200];
            while !stop_flag.load(Ordering::Relaxed) {
                match socket.recv(&mut buf) {
                    Ok(size) => {
                        if let Some(report) = parse_report(&buf[..size])
                            && congestion_control
                        {
                            control.adjust(&report, &client, increase_time);
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(talker = talker_id, error = %e, "RTCP socket error, listener exiting");
                        break;
                    }
                }
            }
            tracing::debug!(talker = talker_id, "RTCP listener thread exiting");
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamer::MediaSocket;

    /// RR+SDES blob the way live clients send it.
    fn receiver_report_bytes(fraction_lost: u8, cumulative: i32, cname: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((2u16 << 14) | (1 << 8) | RR_PACKET_TYPE as u16).to_be_bytes());
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(&0x1111_2222u32.to_be_bytes()); // sender ssrc
        buf.extend_from_slice(&0x3333_4444u32.to_be_bytes()); // SSRC_1
        let loss_word = ((fraction_lost as u32) << 24) | ((cumulative as u32) & 0x00FF_FFFF);
        buf.extend_from_slice(&loss_word.to_be_bytes());
        buf.extend_from_slice(&9876u32.to_be_bytes()); // highest seq
        buf.extend_from_slice(&55u32.to_be_bytes()); // jitter
        buf.extend_from_slice(&123u32.to_be_bytes()); // LSR
        buf.extend_from_slice(&456u32.to_be_bytes()); // DLSR

        buf.extend_from_slice(&((2u16 << 14) | (1 << 8) | SDES_PACKET_TYPE as u16).to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(&0x3333_4444u32.to_be_bytes());
        buf.push(SDES_CNAME);
        buf.push(cname.len() as u8);
        buf.extend_from_slice(cname.as_bytes());
        buf
    }

    fn test_client() -> Arc<Client> {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
        rtp.connect(peer.local_addr().unwrap()).unwrap();
        let rtcp = UdpSocket::bind("127.0.0.1:0").unwrap();
        rtcp.connect(peer.local_addr().unwrap()).unwrap();
        Arc::new(Client::new(
            MediaSocket::Udp(rtp),
            MediaSocket::Udp(rtcp),
            9,
        ))
    }

    #[test]
    fn parse_extracts_rr_fields() {
        let buf = receiver_report_bytes(13, 777, "viewer-host");
        let report = parse_report(&buf).unwrap();
        assert_eq!(report.ssrc, 0x1111_2222);
        assert_eq!(report.fraction_lost, 13);
        assert_eq!(report.cumulative_lost, 777);
        assert_eq!(report.highest_seq, 9876);
        assert_eq!(report.jitter, 55);
        assert_eq!(report.last_sr, 123);
        assert_eq!(report.delay_last_sr, 456);
        assert_eq!(report.cname, "viewer-host");
    }

    #[test]
    fn cumulative_lost_sign_extends() {
        let buf = receiver_report_bytes(0, -5, "h");
        let report = parse_report(&buf).unwrap();
        assert_eq!(report.cumulative_lost, -5);
    }

    #[test]
    fn wrong_packet_types_dropped() {
        let mut buf = receiver_report_bytes(0, 0, "h");
        buf[1] = SR_PACKET_TYPE; // not an RR
        assert!(parse_report(&buf).is_none());

        let mut buf = receiver_report_bytes(0, 0, "h");
        buf[RR_LEN + 1] = RR_PACKET_TYPE; // RR not followed by SDES
        assert!(parse_report(&buf).is_none());
    }

    #[test]
    fn truncated_packet_dropped() {
        let buf = receiver_report_bytes(0, 0, "h");
        assert!(parse_report(&buf[..20]).is_none());
        assert!(parse_report(&[0u8; 150]).is_none());
    }

    #[test]
    fn sender_report_layout() {
        let packet = sender_report(0xCAFE_BABE, 450_000, 42, 61_234);
        // interleaved prefix on the RTCP channel
        assert_eq!(packet[0], b'$');
        assert_eq!(packet[1], rtp::CHANNEL_RTCP);
        let framed = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        assert_eq!(framed, packet.len() - 4);

        let sr = &packet[4..];
        assert_eq!(sr[0] >> 6, 2);
        assert_eq!(sr[1], SR_PACKET_TYPE);
        assert_eq!(be16(sr, 2), 6);
        assert_eq!(be32(sr, 4), 0xCAFE_BABE);
        let ntp_seconds = be32(sr, 8);
        assert!(ntp_seconds > NTP_OFFSET);
        assert_eq!(be32(sr, 16), 450_000);
        assert_eq!(be32(sr, 20), 42);
        assert_eq!(be32(sr, 24), 61_234);

        let sdes = &sr[28..];
        assert_eq!(sdes[1], SDES_PACKET_TYPE);
        assert_eq!(be32(sdes, 4), 0xCAFE_BABE);
        assert_eq!(sdes[8], SDES_CNAME);
        let name_len = sdes[9] as usize;
        assert_eq!(sdes.len(), SDES_FIXED_LEN + name_len + 3);
    }

    #[test]
    fn loss_pattern_01_coarsens() {
        let client = test_client();
        let mut control = CongestionControl::new();
        let long = Duration::from_secs(3600);

        // history 01: a lossy report after a clean run coarsens at once
        control.adjust(&parse_report(&receiver_report_bytes(50, 1, "h")).unwrap(), &client, long);
        assert_eq!(client.temporal_level(), 1);
        // history 10 does nothing
        control.adjust(&parse_report(&receiver_report_bytes(0, 1, "h")).unwrap(), &client, long);
        assert_eq!(client.temporal_level(), 1);
        // history 101, low bits 01 again
        control.adjust(&parse_report(&receiver_report_bytes(50, 2, "h")).unwrap(), &client, long);
        assert_eq!(client.temporal_level(), 2);
    }

    #[test]
    fn sustained_loss_coarsens_again() {
        let client = test_client();
        let mut control = CongestionControl::new();
        let long = Duration::from_secs(3600);
        for _ in 0..3 {
            control.adjust(
                &parse_report(&receiver_report_bytes(80, 9, "h")).unwrap(),
                &client,
                long,
            );
        }
        // 001 coarsened once; 011 is quiet; 111 coarsens again
        assert_eq!(client.temporal_level(), 2);
    }

    #[test]
    fn small_loss_below_threshold_ignored() {
        let client = test_client();
        let mut control = CongestionControl::new();
        let long = Duration::from_secs(3600);
        // 5/256 ≈ 1.95% is at the threshold, not above it
        for _ in 0..4 {
            control.adjust(
                &parse_report(&receiver_report_bytes(5, 0, "h")).unwrap(),
                &client,
                long,
            );
        }
        assert_eq!(client.temporal_level(), 0);
    }

    #[test]
    fn quiet_period_reduces_level() {
        let client = test_client();
        client.set_temporal_level(2);
        let mut control = CongestionControl::new();
        let clean = parse_report(&receiver_report_bytes(0, 0, "h")).unwrap();
        control.adjust(&clean, &client, Duration::ZERO);
        assert_eq!(client.temporal_level(), 1);
        control.adjust(&clean, &client, Duration::ZERO);
        assert_eq!(client.temporal_level(), 0);
    }

    #[test]
    fn listener_drives_congestion_control() {
        let rtcp_in = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = rtcp_in.local_addr().unwrap();
        let client = test_client();
        let listener = RtcpListener::spawn(
            rtcp_in,
            client.clone(),
            true,
            Duration::from_secs(3600),
            9,
        );

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&receiver_report_bytes(80, 1, "h"), target).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while client.temporal_level() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.temporal_level(), 1);
        listener.stop();
    }
}
