//! The RTSP server: listen socket, source registry and global options.
//!
//! One [`Server`] owns the TCP listener, the [`SourceMap`] behind its
//! global mutex, and the packet pacer. Each accepted connection runs a
//! [`talker`](crate::talker) on its own thread; frame producers enter
//! through [`Server::ingest_frame`].

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;
use crate::media::EncoderType;
use crate::source::{DefaultHooks, Source, StreamHooks};
use crate::source_map::SourceMap;
use crate::streamer::Streamer;
use crate::talker;

/// Highest secondary-stream number an ingest channel may carry.
const MAX_STREAM_NUM: u32 = 3;

/// Server-wide options.
#[derive(Debug, Clone)]
pub struct Options {
    /// RTP payload budget per packet. The default backs off from the
    /// 1458 bytes that fit an Ethernet frame after IP/UDP/RTP headers.
    pub packet_size: usize,
    /// Frame rate for file sources.
    pub fps: u32,
    /// RTP timestamp clock for file sources, in Hz.
    pub ts_clock: u32,
    /// TCP send buffer size for interleaved clients; 0 keeps the OS
    /// default.
    pub send_buff_size: usize,
    /// TCP receive buffer size for accepted connections; 0 keeps the OS
    /// default.
    pub recv_buff_size: usize,
    /// Set TCP_NODELAY on interleaved clients.
    pub tcp_nodelay: bool,
    /// Set TCP_CORK on interleaved clients.
    pub tcp_cork: bool,
    /// Enable receiver-report-driven temporal-level congestion control.
    pub temporal_levels: bool,
    /// Seconds without loss before a client's rate is increased again.
    pub increase_time: u64,
    /// Gap enforced between consecutive packet sends, in nanoseconds;
    /// 0 disables pacing.
    pub packet_gap: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            packet_size: 1456,
            fps: 30,
            ts_clock: 90_000,
            send_buff_size: 0,
            recv_buff_size: 0,
            tcp_nodelay: true,
            tcp_cork: false,
            temporal_levels: false,
            increase_time: 60,
            packet_gap: 0,
        }
    }
}

/// Packet-gap pacing shared by all streamers.
///
/// The first packet of a frame records a tick; every following packet
/// busy-waits until `tick + gap`. Spinning (rather than sleeping) is
/// deliberate — the gaps are sub-millisecond and must hold precisely.
pub(crate) struct Pacer {
    gap: AtomicU64,
    tick: Mutex<Option<Instant>>,
}

impl Pacer {
    pub(crate) fn new(gap_ns: u64) -> Self {
        Self {
            gap: AtomicU64::new(gap_ns),
            tick: Mutex::new(None),
        }
    }

    pub(crate) fn set_gap(&self, gap_ns: u64) {
        self.gap.store(gap_ns, Ordering::Relaxed);
    }

    /// A new frame is starting: the next packet goes out immediately.
    pub(crate) fn reset(&self) {
        *self.tick.lock() = None;
    }

    pub(crate) fn wait(&self) {
        let gap = self.gap.load(Ordering::Relaxed);
        if gap == 0 {
            return;
        }
        let mut tick = self.tick.lock();
        match *tick {
            None => *tick = Some(Instant::now()),
            Some(previous) => {
                let deadline = previous + Duration::from_nanos(gap);
                while Instant::now() < deadline {
                    std::hint::spin_loop();
                }
                *tick = Some(deadline);
            }
        }
    }
}

/// RTSP media server.
pub struct Server {
    options: Options,
    sources: Mutex<SourceMap>,
    pacer: Arc<Pacer>,
    hooks: Arc<dyn StreamHooks>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    next_talker_id: AtomicU32,
}

impl Server {
    /// Bind the listener and start accepting connections, with the
    /// default application hooks (decimal names map to live streams).
    pub fn start(bind_addr: &str, options: Options) -> Result<Arc<Self>> {
        Self::start_with_hooks(bind_addr, options, Arc::new(DefaultHooks))
    }

    /// Bind the listener with explicit application hooks.
    pub fn start_with_hooks(
        bind_addr: &str,
        options: Options,
        hooks: Arc<dyn StreamHooks>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let pacer = Arc::new(Pacer::new(options.packet_gap));
        let server = Arc::new(Self {
            options,
            sources: Mutex::new(SourceMap::default()),
            pacer,
            hooks,
            running: Arc::new(AtomicBool::new(true)),
            local_addr,
            next_talker_id: AtomicU32::new(0),
        });

        let accept_server = server.clone();
        thread::spawn(move || accept_loop(listener, accept_server));
        tracing::info!(addr = %local_addr, "RTSP server listening");
        Ok(server)
    }

    /// Stop accepting connections. Running talkers finish on their own
    /// when their clients disconnect.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address, useful when the server was started on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn StreamHooks> {
        &self.hooks
    }

    pub(crate) fn new_streamer(&self) -> Streamer {
        Streamer::new(self.options.packet_size, self.pacer.clone())
    }

    /// Look up the live source for `stream_id`, creating it on first
    /// use. Also resynchronizes the packet pacer: the caller is about to
    /// deliver the first packet of a frame.
    pub fn get_source(&self, stream_id: u32) -> Arc<Source> {
        let source = {
            let mut map = self.sources.lock();
            match map.find_by_id(stream_id) {
                Some(source) => source,
                None => {
                    let source =
                        Source::new_live(stream_id, stream_id.to_string(), self.new_streamer());
                    map.save(stream_id, source.clone(), None);
                    tracing::debug!(stream_id, "created live source for stream");
                    source
                }
            }
        };
        self.pacer.reset();
        source
    }

    /// Resolve a stream name from a request URL: an existing source, a
    /// new live source when the application recognizes the name, or a
    /// freshly opened file source.
    pub(crate) fn resolve_source(
        &self,
        name: &str,
    ) -> std::result::Result<Arc<Source>, crate::error::Status> {
        let mut map = self.sources.lock();
        if let Some(source) = map.find_by_name(name) {
            return Ok(source);
        }
        match self.hooks.stream_id(name) {
            Some(stream_id) => {
                if let Some(source) = map.find_by_id(stream_id) {
                    return Ok(source);
                }
                let source = Source::new_live(stream_id, name.to_string(), self.new_streamer());
                map.save(stream_id, source.clone(), Some(name));
                tracing::debug!(stream_id, name, "created live source");
                Ok(source)
            }
            None => {
                let source = crate::file_source::open(
                    name,
                    self.new_streamer(),
                    self.options.fps,
                    self.options.ts_clock,
                )?;
                map.save_named(name, source.clone());
                tracing::debug!(name, "created file source");
                Ok(source)
            }
        }
    }

    /// Detach a client from its source; the last client tears the
    /// source down, and file sources are dropped from the map entirely.
    pub(crate) fn teardown_client(
        &self,
        source: &Arc<Source>,
        client: &Arc<crate::streamer::Client>,
    ) {
        let mut map = self.sources.lock();
        source.streamer().delete_client(client);
        if source.streamer().client_count() == 0 {
            source.teardown(&**self.hooks());
            if !source.is_live() {
                map.erase(source.name());
                tracing::debug!(source = %source.name(), "deleted file source");
            }
        }
    }

    /// Clients currently attached to a stream, or `None` for an unknown
    /// id.
    pub fn client_count(&self, stream_id: u32) -> Option<usize> {
        self.sources
            .lock()
            .find_by_id(stream_id)
            .map(|source| source.streamer().client_count())
    }

    /// Force the temporal level of every client on every stream.
    pub fn set_temporal_level(&self, level: u8) {
        tracing::debug!(level, "setting temporal level for all streams");
        for source in self.sources.lock().sources() {
            source.streamer().set_temporal_level(level);
        }
    }

    /// Adjust the packet-gap pacing at runtime.
    pub fn set_packet_gap(&self, gap_ns: u64) {
        self.pacer.set_gap(gap_ns);
    }

    /// Frame-producer entry point.
    ///
    /// `(chan_num, stream_num)` identify the encoder output; the stream
    /// id is `chan_num * 10 + stream_num` with `stream_num` in `[0, 3]`.
    /// For H.264 the frame must start at the NAL type octet (start code
    /// stripped). Errors are logged and the frame dropped — producer
    /// failures never reach clients.
    pub fn ingest_frame(
        &self,
        chan_num: u32,
        stream_num: u32,
        frame: &[u8],
        timestamp: u32,
        encoder: EncoderType,
    ) {
        if stream_num > MAX_STREAM_NUM {
            tracing::error!(chan_num, stream_num, "incorrect stream number, dropping frame");
            return;
        }
        let stream_id = chan_num * 10 + stream_num;
        let source = self.get_source(stream_id);
        if let Err(e) = source.send_frame(frame, timestamp, encoder) {
            tracing::error!(stream_id, error = %e, "frame dropped");
        }
    }
}

/// Non-blocking accept loop, polling the running flag between accepts
/// so [`Server::stop`] can end it promptly.
fn accept_loop(listener: TcpListener, server: Arc<Server>) {
    while server.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                if server.options.recv_buff_size > 0 {
                    set_recv_buffer(&stream, server.options.recv_buff_size);
                }
                let id = server.next_talker_id.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(talker = id, peer = %peer_addr, "client connected");
                let talker_server = server.clone();
                thread::spawn(move || talker::run(stream, id, talker_server));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if server.running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

fn setsockopt(stream: &TcpStream, level: i32, option: i32, value: i32, what: &str) {
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            level,
            option,
            &value as *const i32 as *const libc::c_void,
            size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(
            what,
            value,
            error = %std::io::Error::last_os_error(),
            "setsockopt failed"
        );
    }
}

pub(crate) fn set_send_buffer(stream: &TcpStream, size: usize) {
    setsockopt(stream, libc::SOL_SOCKET, libc::SO_SNDBUF, size as i32, "SO_SNDBUF");
}

pub(crate) fn set_recv_buffer(stream: &TcpStream, size: usize) {
    setsockopt(stream, libc::SOL_SOCKET, libc::SO_RCVBUF, size as i32, "SO_RCVBUF");
}

pub(crate) fn set_cork(stream: &TcpStream, enable: bool) {
    setsockopt(
        stream,
        libc::IPPROTO_TCP,
        libc::TCP_CORK,
        enable as i32,
        "TCP_CORK",
    );
}
