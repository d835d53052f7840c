//! SDP session descriptions for DESCRIBE replies (RFC 4566, RFC 6184 §8).

use base64::prelude::{BASE64_STANDARD, Engine as _};
use rand::RngExt;

use crate::error::Status;
use crate::media::EncoderType;

/// Everything the SDP body needs, collected by the talker before the
/// reply is built.
pub(crate) struct SdpParams<'a> {
    pub server_ip: &'a str,
    pub stream_name: &'a str,
    pub encoder: EncoderType,
    /// kbit/s for the `b=AS:` line.
    pub bitrate: u32,
    /// SPS and PPS NAL units, H.264 only.
    pub param_sets: Option<(&'a [u8], &'a [u8])>,
}

/// Build the SDP body. The returned string ends with `\r\n` and its byte
/// length is what goes into `Content-Length`.
pub(crate) fn generate(p: &SdpParams<'_>) -> Result<String, Status> {
    let encoder_name = p.encoder.name()?;
    let payload_type = p.encoder.payload_type()?;
    let session_name = format!(
        "{} Video, streamed by the Stretch Media Server",
        encoder_name
    );

    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!(
            "o=- {} 1 IN IP4 {}",
            rand::rng().random::<u32>(),
            p.server_ip
        ),
        format!("s={}", session_name),
        format!("i={}", p.stream_name),
        "t=0 0".to_string(),
        "a=tool:Stretch Media Server 1.0".to_string(),
        "a=type:broadcast".to_string(),
        "a=control:*".to_string(),
        "a=range:npt=0-".to_string(),
        format!("a=x-qt-text-nam:{}", session_name),
        format!("a=x-qt-text-inf:{}", p.stream_name),
        format!("m=video 0 RTP/AVP {}", payload_type),
        "c=IN IP4 0.0.0.0".to_string(),
        format!("b=AS:{}", p.bitrate),
    ];

    match p.encoder {
        EncoderType::H264 => {
            let (sps, pps) = p.param_sets.ok_or(Status::MissingSps)?;
            sdp.push(format!("a=rtpmap:{} H264/90000", payload_type));
            sdp.push(fmtp_line(payload_type, sps, pps)?);
        }
        EncoderType::Mpeg4 => {
            sdp.push(format!("a=rtpmap:{} MP4V-ES/90000", payload_type));
        }
        // Static payload type 26 needs no rtpmap (RFC 3551).
        EncoderType::Mjpeg => {}
        EncoderType::Unknown => return Err(Status::UnsupportedEncoder),
    }

    sdp.push("a=control:track1".to_string());

    tracing::debug!(stream = p.stream_name, "SDP: {}", sdp.join(" | "));
    Ok(format!("{}\r\n", sdp.join("\r\n")))
}

/// `a=fmtp:` attribute carrying packetization mode, profile-level-id and
/// the base64 parameter sets (RFC 6184 §8.1).
///
/// The profile-level-id is SPS bytes 1..4: profile_idc, constraint flags,
/// level_idc.
fn fmtp_line(payload_type: u8, sps: &[u8], pps: &[u8]) -> Result<String, Status> {
    if sps.len() < 4 || pps.is_empty() {
        return Err(Status::MissingSps);
    }
    Ok(format!(
        "a=fmtp:{} packetization-mode=1;profile-level-id={:02x}{:02x}{:02x};sprop-parameter-sets={},{}",
        payload_type,
        sps[1],
        sps[2],
        sps[3],
        BASE64_STANDARD.encode(sps),
        BASE64_STANDARD.encode(pps)
    ))
}
