//! End-to-end RTSP handshakes against a live server on loopback sockets:
//! OPTIONS → DESCRIBE → SETUP → PLAY → TEARDOWN over UDP and interleaved
//! TCP, transport rejections, and file-source streaming.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

use rtsp::{EncoderType, Options, Server};

const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB, 0x40];
const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

fn idr(size: usize) -> Vec<u8> {
    let mut frame = vec![0x65];
    frame.extend(std::iter::repeat_n(0x5A, size - 1));
    frame
}

/// Send one request and read the reply, including any SDP body.
fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte)?;
        raw.push(byte[0]);
    }
    let mut response = String::from_utf8_lossy(&raw).into_owned();

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        && len > 0
    {
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        response.push_str(&String::from_utf8_lossy(&body));
    }
    Ok(response)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn session_of(reply: &str) -> String {
    reply
        .lines()
        .find(|l| l.starts_with("Session:"))
        .and_then(|l| l.split(':').nth(1))
        .map(|v| v.trim().split(';').next().unwrap_or("").to_string())
        .expect("Session header")
}

fn recv_packets(socket: &UdpSocket, window: Duration) -> Vec<Vec<u8>> {
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let deadline = std::time::Instant::now() + window;
    let mut packets = Vec::new();
    let mut buf = [0u8; 4096];
    while std::time::Instant::now() < deadline {
        match socket.recv(&mut buf) {
            Ok(n) => packets.push(buf[..n].to_vec()),
            Err(_) => {}
        }
    }
    packets
}

#[test]
fn udp_handshake_and_streaming() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();

    // seed the parameter sets so DESCRIBE answers immediately
    server.ingest_frame(0, 0, SPS, 0, EncoderType::H264);
    server.ingest_frame(0, 0, PPS, 0, EncoderType::H264);

    let mut control = connect(addr);
    let base = format!("rtsp://127.0.0.1:{}/0", addr.port());

    // OPTIONS
    let reply = rtsp_request(
        &mut control,
        &format!("OPTIONS {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    assert!(reply.contains("CSeq: 1\r\n"));
    assert!(reply.contains(
        "Public: OPTIONS, DESCRIBE, SETUP, PLAY, GET_PARAMETER, TEARDOWN, PAUSE\r\n"
    ));

    // DESCRIBE
    let reply = rtsp_request(
        &mut control,
        &format!(
            "DESCRIBE {} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n",
            base
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    assert!(reply.contains("Content-Type: application/sdp\r\n"));
    assert!(reply.contains("v=0\r\n"));
    assert!(reply.contains("m=video 0 RTP/AVP 96\r\n"));
    assert!(reply.contains("a=rtpmap:96 H264/90000\r\n"));
    assert!(reply.contains("sprop-parameter-sets="));
    assert!(reply.contains("profile-level-id=42001e"));

    // SETUP with real client sockets
    let rtp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtp_port = rtp_socket.local_addr().unwrap().port();
    let rtcp_port = rtcp_socket.local_addr().unwrap().port();
    let reply = rtsp_request(
        &mut control,
        &format!(
            "SETUP {}/track1 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            base, rtp_port, rtcp_port
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    assert!(reply.contains(&format!(
        "Transport: RTP/AVP;unicast;destination=127.0.0.1;source=127.0.0.1;client_port={}-{};server_port=",
        rtp_port, rtcp_port
    )));
    let session = session_of(&reply);
    assert_eq!(session.len(), 8, "8-hex session id, got {session}");
    assert!(session.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(session, session.to_uppercase());

    // PLAY
    let reply = rtsp_request(
        &mut control,
        &format!(
            "PLAY {} RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n",
            base, session
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    assert!(reply.contains("Range: npt=0.000-\r\n"));
    assert!(reply.contains("RTP-Info: url="));
    assert!(reply.contains("/track1;seq="));
    assert!(reply.contains(";rtptime="));

    // the PLAY action lands after the reply; give it a moment
    thread::sleep(Duration::from_millis(200));

    // stream one access unit plus a P frame
    server.ingest_frame(0, 0, SPS, 3000, EncoderType::H264);
    server.ingest_frame(0, 0, PPS, 3000, EncoderType::H264);
    server.ingest_frame(0, 0, &idr(400), 3000, EncoderType::H264);
    server.ingest_frame(0, 0, &[0x41, 0x9A, 0x02], 6000, EncoderType::H264);

    let packets = recv_packets(&rtp_socket, Duration::from_secs(1));
    assert_eq!(packets.len(), 4, "SPS, PPS, IDR, P");

    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet[0] >> 6, 2, "RTP version");
        assert_eq!(packet[1] & 0x7F, 96, "payload type");
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(seq, i as u16, "contiguous per-client sequence numbers");
    }
    // markers: none on SPS/PPS, set on IDR and P
    assert_eq!(packets[0][1] & 0x80, 0);
    assert_eq!(packets[1][1] & 0x80, 0);
    assert_eq!(packets[2][1] & 0x80, 0x80);
    assert_eq!(packets[3][1] & 0x80, 0x80);
    // payloads survive intact
    assert_eq!(&packets[0][12..], SPS);
    assert_eq!(&packets[1][12..], PPS);
    assert_eq!(u32::from_be_bytes([packets[3][4], packets[3][5], packets[3][6], packets[3][7]]), 6000);

    // TEARDOWN
    let reply = rtsp_request(
        &mut control,
        &format!(
            "TEARDOWN {} RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n",
            base, session
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");

    server.stop();
}

#[test]
fn setup_tcp_with_ports_rejected() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();
    let mut control = connect(addr);

    let reply = rtsp_request(
        &mut control,
        &format!(
            "SETUP rtsp://127.0.0.1:{}/0/track1 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1;client_port=5000-5001\r\n\r\n",
            addr.port()
        ),
    )
    .unwrap();
    assert!(
        reply.starts_with("RTSP/1.0 574 ERROR_TCP_WITH_PORTS\r\n"),
        "{reply}"
    );
    assert!(reply.contains("CSeq: 2\r\n"));

    server.stop();
}

#[test]
fn describe_without_sps_times_out_with_581() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();

    // the stream exists and is known to be H.264, but no SPS ever shows
    server.ingest_frame(1, 0, &idr(50), 0, EncoderType::H264);

    let mut control = connect(addr);
    let reply = rtsp_request(
        &mut control,
        &format!(
            "DESCRIBE rtsp://127.0.0.1:{}/10 RTSP/1.0\r\nCSeq: 2\r\n\r\n",
            addr.port()
        ),
    )
    .unwrap();
    assert!(
        reply.starts_with("RTSP/1.0 581 ERROR_MISSING_SPS\r\n"),
        "{reply}"
    );

    server.stop();
}

#[test]
fn describe_unknown_file_is_404() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();
    let mut control = connect(addr);

    let reply = rtsp_request(
        &mut control,
        &format!(
            "DESCRIBE rtsp://127.0.0.1:{}/no-such-clip.264 RTSP/1.0\r\nCSeq: 2\r\n\r\n",
            addr.port()
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 404 NOT_FOUND\r\n"), "{reply}");

    server.stop();
}

#[test]
fn play_before_setup_is_455() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();
    let mut control = connect(addr);

    let reply = rtsp_request(
        &mut control,
        &format!(
            "PLAY rtsp://127.0.0.1:{}/0 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
            addr.port()
        ),
    )
    .unwrap();
    assert!(
        reply.starts_with("RTSP/1.0 455 METHOD_NOT_VALID_IN_THIS_STATE\r\n"),
        "{reply}"
    );

    server.stop();
}

#[test]
fn get_parameter_validates_session() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();
    server.ingest_frame(2, 0, SPS, 0, EncoderType::H264);
    server.ingest_frame(2, 0, PPS, 0, EncoderType::H264);

    let mut control = connect(addr);
    let base = format!("rtsp://127.0.0.1:{}/20", addr.port());
    let rtp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let reply = rtsp_request(
        &mut control,
        &format!(
            "SETUP {}/track1 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            base,
            rtp_socket.local_addr().unwrap().port(),
            rtcp_socket.local_addr().unwrap().port()
        ),
    )
    .unwrap();
    let session = session_of(&reply);

    let reply = rtsp_request(
        &mut control,
        &format!(
            "GET_PARAMETER {} RTSP/1.0\r\nCSeq: 2\r\nSession: 00000000\r\n\r\n",
            base
        ),
    )
    .unwrap();
    assert!(
        reply.starts_with("RTSP/1.0 454 SESSION_NOT_FOUND\r\n"),
        "{reply}"
    );

    let reply = rtsp_request(
        &mut control,
        &format!(
            "GET_PARAMETER {} RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
            base, session
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    assert!(reply.contains(&format!("Session: {}\r\n", session)));

    server.stop();
}

#[test]
fn interleaved_tcp_streaming() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();
    server.ingest_frame(3, 0, SPS, 0, EncoderType::H264);
    server.ingest_frame(3, 0, PPS, 0, EncoderType::H264);

    let mut control = connect(addr);
    let base = format!("rtsp://127.0.0.1:{}/30", addr.port());

    let reply = rtsp_request(
        &mut control,
        &format!(
            "SETUP {}/track1 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
            base
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    assert!(reply.contains("Transport: RTP/AVP/TCP;unicast;destination=127.0.0.1;source=127.0.0.1;interleaved=0-1\r\n"));
    let session = session_of(&reply);

    let reply = rtsp_request(
        &mut control,
        &format!(
            "PLAY {} RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n",
            base, session
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");

    thread::sleep(Duration::from_millis(200));
    server.ingest_frame(3, 0, SPS, 3000, EncoderType::H264);

    // interleaved frame: '$', channel 0, length, then the RTP packet
    let mut prefix = [0u8; 4];
    control.read_exact(&mut prefix).unwrap();
    assert_eq!(prefix[0], b'$');
    assert_eq!(prefix[1], 0);
    let len = u16::from_be_bytes([prefix[2], prefix[3]]) as usize;
    assert_eq!(len, 12 + SPS.len());
    let mut packet = vec![0u8; len];
    control.read_exact(&mut packet).unwrap();
    assert_eq!(packet[0] >> 6, 2);
    assert_eq!(packet[1] & 0x7F, 96);
    assert_eq!(&packet[12..], SPS);

    server.stop();
}

#[test]
fn file_source_loops_with_paced_timestamps() {
    use std::io::Write as _;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.264");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        for frame in [SPS, PPS, idr(200).as_slice()] {
            file.write_all(&[0, 0, 0, 1]).unwrap();
            file.write_all(frame).unwrap();
        }
    }

    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();
    let mut control = connect(addr);
    // URL paths carry the filesystem path without its leading slash
    let base = format!(
        "rtsp://127.0.0.1:{}{}",
        addr.port(),
        path.to_str().unwrap()
    );

    let reply = rtsp_request(
        &mut control,
        &format!("DESCRIBE {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    assert!(reply.contains("sprop-parameter-sets="));
    assert!(reply.contains("b=AS:8000\r\n"));

    let rtp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let reply = rtsp_request(
        &mut control,
        &format!(
            "SETUP {}/track1 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            base,
            rtp_socket.local_addr().unwrap().port(),
            rtcp_socket.local_addr().unwrap().port()
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");
    let session = session_of(&reply);

    let reply = rtsp_request(
        &mut control,
        &format!(
            "PLAY {} RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
            base, session
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");

    let packets = recv_packets(&rtp_socket, Duration::from_millis(1200));
    // three NALs per loop iteration at 30 fps
    assert!(
        packets.len() >= 60,
        "expected a steady stream, got {} packets",
        packets.len()
    );

    // per-client sequence numbers are contiguous
    let first_seq = u16::from_be_bytes([packets[0][2], packets[0][3]]);
    for (i, packet) in packets.iter().enumerate() {
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(seq, first_seq.wrapping_add(i as u16));
    }

    // timestamps step by ts_clock / fps = 3000 per frame
    let timestamps: Vec<u32> = packets
        .iter()
        .map(|p| u32::from_be_bytes([p[4], p[5], p[6], p[7]]))
        .collect();
    let mut distinct = vec![timestamps[0]];
    for &ts in &timestamps[1..] {
        if ts != *distinct.last().unwrap() {
            distinct.push(ts);
        }
    }
    assert!(distinct.len() >= 10);
    for pair in distinct.windows(2) {
        assert_eq!(pair[1].wrapping_sub(pair[0]), 3000);
    }

    let reply = rtsp_request(
        &mut control,
        &format!(
            "TEARDOWN {} RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n",
            base, session
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");

    server.stop();
}

#[test]
fn pause_tears_down_like_ffmpeg_expects() {
    let server = Server::start("127.0.0.1:0", Options::default()).expect("server start");
    let addr = server.local_addr();
    server.ingest_frame(4, 0, SPS, 0, EncoderType::H264);
    server.ingest_frame(4, 0, PPS, 0, EncoderType::H264);

    let mut control = connect(addr);
    let base = format!("rtsp://127.0.0.1:{}/40", addr.port());
    let rtp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let reply = rtsp_request(
        &mut control,
        &format!(
            "SETUP {}/track1 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            base,
            rtp_socket.local_addr().unwrap().port(),
            rtcp_socket.local_addr().unwrap().port()
        ),
    )
    .unwrap();
    let session = session_of(&reply);

    let reply = rtsp_request(
        &mut control,
        &format!(
            "PAUSE {} RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n",
            base, session
        ),
    )
    .unwrap();
    assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"), "{reply}");

    // the client is detached once the talker tears down
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.client_count(40), Some(0));

    server.stop();
}
