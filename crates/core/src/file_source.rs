//! File-backed H.264 sources.
//!
//! A file source streams an H.264 elementary stream (Annex B, 4-byte
//! start codes) in an endless loop. The file must begin with an SPS NAL
//! followed by a PPS NAL; both are cached when the source is opened so a
//! DESCRIBE can be answered before the reader thread exists.
//!
//! The reader thread starts on the first RTSP PLAY. It paces delivery at
//! one frame per `1s / fps` using absolute deadlines, so processing time
//! does not accumulate into drift, and advances the RTP timestamp by
//! `ts_clock / fps` per paced frame. SPS and PPS frames are sent without
//! a wait and without a timestamp step, keeping them on the same tick as
//! the frame they precede.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Status;
use crate::media;
use crate::source::Source;
use crate::streamer::Streamer;

/// Read buffer for the elementary stream.
const BUFFER_SIZE: usize = 1_000_000;
const START_CODE_LEN: usize = 4;

/// Reader-thread state owned by a file-backed [`Source`].
pub(crate) struct FileStream {
    name: String,
    fps: u32,
    ts_clock: u32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Open a file source: validate the stream, cache SPS/PPS and build the
/// source. The reader thread is not started until PLAY.
pub(crate) fn open(
    name: &str,
    streamer: Streamer,
    fps: u32,
    ts_clock: u32,
) -> Result<Arc<Source>, Status> {
    let file = open_path(name).map_err(|e| {
        tracing::error!(name, error = %e, "unable to open file for streaming");
        Status::NotFound
    })?;
    let mut reader = NalReader::new(file, BUFFER_SIZE).map_err(|e| {
        tracing::error!(name, error = %e, "file is not an H264 elementary stream");
        Status::BadRequest
    })?;

    if media::frame_type(reader.current().first().copied().unwrap_or(0)) != 's' {
        tracing::error!(name, "file does not start with an SPS frame");
        return Err(Status::BadRequest);
    }
    let sps = reader.current().to_vec();
    reader.advance().map_err(|_| Status::BadRequest)?;
    if media::frame_type(reader.current().first().copied().unwrap_or(0)) != 'p' {
        tracing::error!(name, "file does not have a PPS frame after the SPS");
        return Err(Status::BadRequest);
    }
    let pps = reader.current().to_vec();

    tracing::debug!(name, fps, ts_clock, "file source opened");
    let file = FileStream {
        name: name.to_string(),
        fps,
        ts_clock,
        thread: Mutex::new(None),
    };
    Ok(Source::new_file(name.to_string(), streamer, file, sps, pps))
}

/// Stream names come from URL paths, which arrive without their leading
/// slash; retry as an absolute path when the relative open fails.
fn open_path(name: &str) -> io::Result<File> {
    File::open(name).or_else(|_| File::open(format!("/{name}")))
}

impl FileStream {
    /// Spawn the reader thread. Runs until the source stops playing.
    pub(crate) fn start(&self, source: Arc<Source>) {
        let name = self.name.clone();
        let fps = self.fps;
        let ts_clock = self.ts_clock;
        let handle = thread::spawn(move || {
            play_file(&source, &name, fps, ts_clock);
            tracing::debug!(source = %name, "file reader thread terminating");
        });
        *self.thread.lock() = Some(handle);
    }

    /// Wait for the reader thread after the playing flag was cleared.
    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn play_file(source: &Arc<Source>, name: &str, fps: u32, ts_clock: u32) {
    let mut reader = match open_path(name).and_then(|f| NalReader::new(f, BUFFER_SIZE)) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::error!(source = %name, error = %e, "file reader failed to start");
            return;
        }
    };

    let period = Duration::from_nanos(1_000_000_000 / u64::from(fps));
    let ts_delta = ts_clock / fps;
    let mut timestamp = 0u32;
    let mut deadline = Instant::now();

    while source.is_playing() {
        let sps_pps = {
            let frame = reader.current();
            let sps_pps = source.save_if_sps_pps(frame);
            source.set_timestamp(timestamp);
            tracing::trace!(
                source = %name,
                frame_type = %media::frame_type(frame.first().copied().unwrap_or(0)),
                size = frame.len(),
                timestamp,
                "file frame"
            );
            let desc = source.desc_copy();
            if let Err(e) = source.streamer().send_frame(frame, timestamp, &desc) {
                tracing::error!(source = %name, error = %e, "file frame dropped");
            }
            sps_pps
        };
        if let Err(e) = reader.advance() {
            tracing::error!(source = %name, error = %e, "file read failed, reader exiting");
            break;
        }
        // parameter sets ride on the tick of the frame they precede
        if !sps_pps {
            deadline += period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
            timestamp = timestamp.wrapping_add(ts_delta);
        }
    }
}

/// Incremental Annex B frame scanner.
///
/// Holds a window of the file; `current()` is the frame between two
/// start codes. When the window runs out the residual bytes shift to the
/// buffer head before the refill, and EOF rewinds to the file start for
/// the endless loop.
struct NalReader {
    file: File,
    buf: Vec<u8>,
    /// Valid bytes in `buf`.
    len: usize,
    /// Start of the current frame (start code already skipped).
    pos: usize,
    frame_size: usize,
    eof: bool,
}

impl NalReader {
    fn new(file: File, buffer_size: usize) -> Result<Self, io::Error> {
        let mut reader = Self {
            file,
            buf: vec![0u8; buffer_size],
            len: 0,
            pos: 0,
            frame_size: 0,
            eof: false,
        };
        reader.fill()?;
        if !media::is_start_code(&reader.buf[..reader.len.min(START_CODE_LEN)]) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing NAL start code",
            ));
        }
        reader.pos = START_CODE_LEN;
        reader.frame_size = find_frame(&reader.buf[reader.pos..reader.len]);
        if reader.frame_size == 0 {
            reader.frame_size = reader.len - reader.pos;
        }
        Ok(reader)
    }

    fn current(&self) -> &[u8] {
        &self.buf[self.pos..self.pos + self.frame_size]
    }

    /// Step to the next frame, refilling or rewinding as needed.
    fn advance(&mut self) -> io::Result<()> {
        self.pos = (self.pos + self.frame_size + START_CODE_LEN).min(self.len);
        self.frame_size = find_frame(&self.buf[self.pos..self.len]);
        if self.frame_size > 0 {
            return Ok(());
        }
        let residual = self.len - self.pos;
        if self.eof {
            if residual > 0 {
                // no further start code before EOF: the tail is one frame
                self.frame_size = residual;
                return Ok(());
            }
            tracing::debug!("rewinding input file");
            self.file.seek(SeekFrom::Start(0))?;
            self.eof = false;
            self.len = 0;
            self.fill()?;
            self.pos = START_CODE_LEN.min(self.len);
        } else {
            self.buf.copy_within(self.pos..self.len, 0);
            self.len = residual;
            self.pos = 0;
            self.fill()?;
        }
        self.frame_size = find_frame(&self.buf[self.pos..self.len]);
        if self.frame_size == 0 {
            self.frame_size = self.len - self.pos;
        }
        Ok(())
    }

    fn fill(&mut self) -> io::Result<()> {
        while self.len < self.buf.len() {
            let read = self.file.read(&mut self.buf[self.len..])?;
            if read == 0 {
                self.eof = true;
                break;
            }
            self.len += read;
        }
        Ok(())
    }
}

/// Distance to the next 4-byte start code, or 0 when none is in view.
fn find_frame(buf: &[u8]) -> usize {
    buf.windows(START_CODE_LEN)
        .position(|w| w == [0, 0, 0, 1])
        .unwrap_or(0)
}
