//! Media sources: one producer feeding one [`Streamer`].
//!
//! A source is either *live* (frames pushed in by the encoder callback
//! through [`Server::ingest_frame`](crate::server::Server::ingest_frame))
//! or *file-backed* (a reader thread pacing an H.264 elementary stream,
//! see [`file_source`](crate::file_source)). Both share the same state:
//! the stream description, the SPS/PPS cache, the last RTP timestamp and
//! the playing flag.
//!
//! Live sources exist for the lifetime of the process once created; file
//! sources are destroyed when their last client tears down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, Status};
use crate::file_source::FileStream;
use crate::media::{self, EncoderType, StreamDesc};
use crate::streamer::Streamer;

/// Hooks into the embedding application.
///
/// The server calls these to resolve stream names, to fetch stream
/// descriptions on DESCRIBE, and to notify the application when clients
/// arrive and leave. The default implementation maps decimal names to
/// live stream ids and everything else to file sources.
pub trait StreamHooks: Send + Sync {
    /// Resolve a stream name from the request URL to a live stream id.
    /// `None` means the name refers to a file.
    fn stream_id(&self, name: &str) -> Option<u32> {
        name.parse().ok()
    }

    /// Describe a live stream. `None` keeps whatever the producer has
    /// reported so far.
    fn describe(&self, _stream_id: u32) -> Option<StreamDesc> {
        None
    }

    /// First client subscribed to a live stream.
    fn play(&self, _stream_id: u32) {}

    /// Last client left a live stream.
    fn teardown(&self, _stream_id: u32) {}
}

/// [`StreamHooks`] with all defaults.
pub struct DefaultHooks;

impl StreamHooks for DefaultHooks {}

/// DESCRIBE waits this long for in-band SPS/PPS, about two GOPs.
const PARAM_SET_POLLS: u32 = 60;
const PARAM_SET_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Default bitrate advertised when the application provides none.
const DEFAULT_BITRATE: u32 = 8000;

#[derive(Default)]
pub(crate) struct ParamSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

pub(crate) enum SourceKind {
    Live,
    File(FileStream),
}

/// One video producer and its fan-out streamer.
pub struct Source {
    name: String,
    stream_id: Option<u32>,
    desc: Mutex<StreamDesc>,
    /// SPS/PPS cache. Buffers are replaced whole, never extended, and
    /// only reallocate when a larger set arrives.
    params: Mutex<ParamSets>,
    timestamp: AtomicU32,
    playing: AtomicBool,
    streamer: Streamer,
    kind: SourceKind,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl Source {
    pub(crate) fn new_live(stream_id: u32, name: String, streamer: Streamer) -> Arc<Self> {
        tracing::debug!(stream_id, name, "created live source");
        Arc::new(Self {
            name,
            stream_id: Some(stream_id),
            desc: Mutex::new(StreamDesc::default()),
            params: Mutex::new(ParamSets::default()),
            timestamp: AtomicU32::new(0),
            playing: AtomicBool::new(false),
            streamer,
            kind: SourceKind::Live,
        })
    }

    pub(crate) fn new_file(
        name: String,
        streamer: Streamer,
        file: FileStream,
        sps: Vec<u8>,
        pps: Vec<u8>,
    ) -> Arc<Self> {
        tracing::debug!(name, "created file source");
        Arc::new(Self {
            name,
            stream_id: None,
            desc: Mutex::new(StreamDesc {
                encoder_type: EncoderType::H264,
                bitrate: DEFAULT_BITRATE,
                ..StreamDesc::default()
            }),
            params: Mutex::new(ParamSets { sps, pps }),
            timestamp: AtomicU32::new(0),
            playing: AtomicBool::new(false),
            streamer,
            kind: SourceKind::File(file),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub fn is_live(&self) -> bool {
        matches!(self.kind, SourceKind::Live)
    }

    pub(crate) fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub(crate) fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub(crate) fn set_timestamp(&self, timestamp: u32) {
        self.timestamp.store(timestamp, Ordering::Relaxed);
    }

    pub(crate) fn desc_copy(&self) -> StreamDesc {
        *self.desc.lock()
    }

    /// Cache the frame if it is an SPS or PPS NAL unit.
    pub(crate) fn save_if_sps_pps(&self, frame: &[u8]) -> bool {
        let Some(&octet) = frame.first() else {
            return false;
        };
        match media::frame_type(octet) {
            's' => {
                tracing::debug!(source = %self.name, "saving SPS");
                save_param(&mut self.params.lock().sps, frame);
                true
            }
            'p' => {
                tracing::debug!(source = %self.name, "saving PPS");
                save_param(&mut self.params.lock().pps, frame);
                true
            }
            _ => false,
        }
    }

    /// Producer entry point for live sources. For H.264 the first byte
    /// of `frame` must be the NAL type octet.
    ///
    /// The frame reaches the streamer only while the source is playing;
    /// SPS/PPS are cached and the timestamp recorded either way.
    pub(crate) fn send_frame(
        &self,
        frame: &[u8],
        timestamp: u32,
        encoder: EncoderType,
    ) -> Result<()> {
        if !self.is_live() {
            tracing::warn!(source = %self.name, "ignoring pushed frame on a file source");
            return Ok(());
        }
        self.timestamp.store(timestamp, Ordering::Relaxed);
        self.desc.lock().encoder_type = encoder;
        if encoder == EncoderType::H264 {
            if frame.is_empty() {
                return Err(Status::BadRequest.into());
            }
            self.save_if_sps_pps(frame);
        }
        if self.playing.load(Ordering::Relaxed) {
            let desc = self.desc_copy();
            self.streamer.send_frame(frame, timestamp, &desc)?;
        }
        Ok(())
    }

    /// Start delivering frames: unblock a live source, or spin up the
    /// reader thread of a file source.
    pub(crate) fn play(self: &Arc<Self>) {
        match &self.kind {
            SourceKind::Live => {
                if !self.playing.swap(true, Ordering::Relaxed) {
                    tracing::info!(source = %self.name, "started to play stream");
                }
            }
            SourceKind::File(file) => {
                if !self.playing.swap(true, Ordering::Relaxed) {
                    tracing::info!(source = %self.name, "starting to play file");
                    file.start(self.clone());
                }
            }
        }
    }

    /// Last client left: stop delivery. File sources join their reader
    /// thread; live sources notify the application and persist.
    pub(crate) fn teardown(&self, hooks: &dyn StreamHooks) {
        self.playing.store(false, Ordering::Relaxed);
        match &self.kind {
            SourceKind::Live => {
                tracing::info!(source = %self.name, "tearing down stream");
                if let Some(id) = self.stream_id {
                    hooks.teardown(id);
                }
            }
            SourceKind::File(file) => {
                file.join();
                tracing::debug!(source = %self.name, "file source teardown");
            }
        }
    }

    /// First DESCRIBE with no clients attached asks the application to
    /// start producing.
    pub(crate) fn request_app_play(&self, hooks: &dyn StreamHooks) {
        if let (SourceKind::Live, Some(id)) = (&self.kind, self.stream_id) {
            hooks.play(id);
        }
    }

    /// Fetch the stream description for a DESCRIBE reply, asking the
    /// application first for live streams.
    pub(crate) fn fill_desc(&self, hooks: &dyn StreamHooks) -> std::result::Result<StreamDesc, Status> {
        if let (SourceKind::Live, Some(id)) = (&self.kind, self.stream_id)
            && let Some(desc) = hooks.describe(id)
        {
            *self.desc.lock() = desc;
        }
        let mut desc = self.desc.lock();
        if desc.encoder_type == EncoderType::Unknown {
            return Err(Status::UnsupportedEncoder);
        }
        if desc.bitrate == 0 {
            desc.bitrate = DEFAULT_BITRATE;
        }
        Ok(*desc)
    }

    /// Block until both SPS and PPS are cached, polling for about two
    /// GOPs before giving up with 581.
    pub(crate) fn wait_param_sets(&self) -> std::result::Result<(Vec<u8>, Vec<u8>), Status> {
        for _ in 0..PARAM_SET_POLLS {
            {
                let params = self.params.lock();
                if !params.sps.is_empty() && !params.pps.is_empty() {
                    return Ok((params.sps.clone(), params.pps.clone()));
                }
            }
            tracing::debug!(source = %self.name, "waiting for sps/pps");
            thread::sleep(PARAM_SET_POLL_INTERVAL);
        }
        Err(Status::MissingSps)
    }
}

fn save_param(buffer: &mut Vec<u8>, frame: &[u8]) {
    buffer.clear();
    buffer.extend_from_slice(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Pacer;

    fn live_source() -> Arc<Source> {
        Source::new_live(0, "0".to_string(), Streamer::new(1456, Arc::new(Pacer::new(0))))
    }

    #[test]
    fn sps_pps_are_cached_from_frames() {
        let source = live_source();
        let sps = [0x67, 0x42, 0x00, 0x1E];
        let pps = [0x68, 0xCE, 0x38, 0x80];
        source
            .send_frame(&sps, 0, EncoderType::H264)
            .and_then(|_| source.send_frame(&pps, 0, EncoderType::H264))
            .unwrap();
        let (got_sps, got_pps) = source.wait_param_sets().unwrap();
        assert_eq!(got_sps, sps);
        assert_eq!(got_pps, pps);
    }

    #[test]
    fn newer_param_sets_replace_older() {
        let source = live_source();
        source.save_if_sps_pps(&[0x67, 0x01, 0x02, 0x03, 0x04]);
        source.save_if_sps_pps(&[0x67, 0x0A, 0x0B]);
        assert_eq!(source.params.lock().sps, [0x67, 0x0A, 0x0B]);
    }

    #[test]
    fn non_parameter_nals_are_not_cached() {
        let source = live_source();
        assert!(!source.save_if_sps_pps(&[0x65, 0x11]));
        assert!(!source.save_if_sps_pps(&[]));
        assert!(source.params.lock().sps.is_empty());
    }

    #[test]
    fn wait_param_sets_times_out_with_581() {
        let source = live_source();
        assert_eq!(source.wait_param_sets().unwrap_err(), Status::MissingSps);
    }

    #[test]
    fn describe_rejects_unknown_encoder() {
        let source = live_source();
        assert_eq!(
            source.fill_desc(&DefaultHooks).unwrap_err(),
            Status::UnsupportedEncoder
        );
    }

    #[test]
    fn describe_uses_application_hook() {
        struct FixedDesc;
        impl StreamHooks for FixedDesc {
            fn describe(&self, _id: u32) -> Option<StreamDesc> {
                Some(StreamDesc {
                    encoder_type: EncoderType::Mjpeg,
                    bitrate: 4000,
                    quality: 70,
                    width: 320,
                    height: 240,
                })
            }
        }
        let source = live_source();
        let desc = source.fill_desc(&FixedDesc).unwrap();
        assert_eq!(desc.encoder_type, EncoderType::Mjpeg);
        assert_eq!(desc.bitrate, 4000);
    }

    #[test]
    fn describe_defaults_bitrate() {
        let source = live_source();
        source.send_frame(&[0x67, 1, 2, 3], 0, EncoderType::H264).unwrap();
        let desc = source.fill_desc(&DefaultHooks).unwrap();
        assert_eq!(desc.bitrate, 8000);
    }

    #[test]
    fn frames_only_flow_while_playing() {
        let source = live_source();
        source.send_frame(&[0x67, 1, 2, 3], 100, EncoderType::H264).unwrap();
        assert!(!source.is_playing());
        assert_eq!(source.timestamp(), 100);
        source.play();
        assert!(source.is_playing());
        source.teardown(&DefaultHooks);
        assert!(!source.is_playing());
    }

    #[test]
    fn hooks_observe_lifecycle() {
        use std::sync::atomic::AtomicU32;
        #[derive(Default)]
        struct Counting {
            plays: AtomicU32,
            teardowns: AtomicU32,
        }
        impl StreamHooks for Counting {
            fn play(&self, _id: u32) {
                self.plays.fetch_add(1, Ordering::Relaxed);
            }
            fn teardown(&self, _id: u32) {
                self.teardowns.fetch_add(1, Ordering::Relaxed);
            }
        }
        let hooks = Counting::default();
        let source = live_source();
        source.request_app_play(&hooks);
        source.teardown(&hooks);
        assert_eq!(hooks.plays.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.teardowns.load(Ordering::Relaxed), 1);
    }
}
