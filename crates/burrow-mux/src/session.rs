//! Multiplexed session over one pipe connection
//!
//! A session owns the transport and two tasks: a writer draining a frame
//! channel, and a reader routing inbound frames to per-stream channels.
//! Handles are cheap to clone; all of them observe the same session state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameType, StreamId};
use crate::stream::MuxStream;

/// Marker trait for transports a session can run over
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Conn for T {}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("session closed")]
    SessionClosed,

    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest payload carried by a single frame
    pub max_frame_size: usize,
    /// Receive-buffer target per session; divided across streams
    pub max_receive_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
        }
    }
}

impl MuxConfig {
    fn stream_channel_capacity(&self) -> usize {
        std::cmp::max(1, self.max_receive_buffer / self.max_frame_size)
    }
}

pub(crate) struct Shared {
    pub(crate) config: MuxConfig,
    pub(crate) streams: Mutex<HashMap<StreamId, mpsc::Sender<Bytes>>>,
    next_stream_id: AtomicU32,
    pub(crate) write_tx: mpsc::UnboundedSender<Frame>,
    close_tx: watch::Sender<bool>,
}

impl Shared {
    /// Flip the session to closed; returns true on the first call
    pub(crate) fn begin_close(&self) -> bool {
        self.close_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }
}

/// Handle to a multiplexed session
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
}

impl MuxSession {
    /// Start a session on the stream-initiating side (odd stream ids).
    ///
    /// The server runs this role on pipes: the pipe is initiated by the
    /// remote tunnel client, but stream opens flow server → client.
    pub fn client<C: Conn + 'static>(conn: C, config: MuxConfig) -> Self {
        Self::start(Box::new(conn), config, 1)
    }

    /// Start a session on the stream-accepting side (even stream ids)
    pub fn server<C: Conn + 'static>(conn: C, config: MuxConfig) -> Self {
        Self::start(Box::new(conn), config, 2)
    }

    fn start(conn: Box<dyn Conn>, config: MuxConfig, first_stream_id: u32) -> Self {
        let (read_half, write_half) = tokio::io::split(conn);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let (close_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(first_stream_id),
            write_tx,
            close_tx,
        });

        tokio::spawn(write_loop(write_half, write_rx, shared.clone()));
        tokio::spawn(read_loop(read_half, shared.clone(), accept_tx));

        Self {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// True once the session is closed (locally or by the peer)
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of live streams on this session
    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().unwrap().len()
    }

    /// Open a new stream, identified to the peer by `name`
    pub fn open_stream(&self, name: &str) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.stream_channel_capacity());
        self.shared.streams.lock().unwrap().insert(stream_id, tx);

        if self.shared.write_tx.send(Frame::open(stream_id, name)).is_err() {
            self.shared.streams.lock().unwrap().remove(&stream_id);
            return Err(MuxError::SessionClosed);
        }

        trace!(stream_id, name, "opened stream");
        Ok(MuxStream::new(stream_id, name.to_string(), self.shared.clone(), rx))
    }

    /// Wait for the next peer-opened stream; `None` once the session dies
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Close the session. The peer is told to go away, both tasks stop,
    /// and every live stream observes EOF. Idempotent.
    pub fn close(&self) {
        if self.shared.begin_close() {
            debug!("closing mux session");
            let _ = self.shared.write_tx.send(Frame::go_away());
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<Box<dyn Conn>>,
    mut write_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = write_rx.recv().await {
        let is_go_away = frame.frame_type == FrameType::GoAway;
        let encoded = match frame.encode(shared.config.max_frame_size) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "dropping unencodable frame");
                continue;
            }
        };
        if writer.write_all(&encoded).await.is_err() || writer.flush().await.is_err() {
            break;
        }
        if is_go_away {
            break;
        }
    }
    shared.begin_close();
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: ReadHalf<Box<dyn Conn>>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
) {
    let mut closed = shared.close_tx.subscribe();
    let max_frame = shared.config.max_frame_size;

    loop {
        let frame = tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            result = read_frame(&mut reader, max_frame) => match result {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(error = %err, "session read ended");
                    break;
                }
            },
        };

        match frame.frame_type {
            FrameType::Open => {
                let name = String::from_utf8_lossy(&frame.payload).into_owned();
                let (tx, rx) = mpsc::channel(shared.config.stream_channel_capacity());
                shared.streams.lock().unwrap().insert(frame.stream_id, tx);
                let stream = MuxStream::new(frame.stream_id, name, shared.clone(), rx);
                if accept_tx.try_send(stream).is_err() {
                    // Dropping the refused stream detaches it and tells
                    // the peer it is closed
                    warn!(stream_id = frame.stream_id, "accept queue full, refusing stream");
                }
            }
            FrameType::Data => {
                let sender = shared
                    .streams
                    .lock()
                    .unwrap()
                    .get(&frame.stream_id)
                    .cloned();
                match sender {
                    Some(tx) => {
                        // Backpressure: a full stream buffer stalls the session
                        if tx.send(frame.payload).await.is_err() {
                            trace!(stream_id = frame.stream_id, "data for closing stream");
                        }
                    }
                    None => {
                        trace!(stream_id = frame.stream_id, "data for unknown stream");
                    }
                }
            }
            FrameType::Close => {
                shared.streams.lock().unwrap().remove(&frame.stream_id);
                trace!(stream_id = frame.stream_id, "stream closed by peer");
            }
            FrameType::GoAway => {
                debug!("peer closed session");
                break;
            }
        }
    }

    shared.begin_close();
    shared.streams.lock().unwrap().clear();
}

async fn read_frame(
    reader: &mut ReadHalf<Box<dyn Conn>>,
    max_frame: usize,
) -> Result<Frame, MuxError> {
    let mut header = [0u8; Frame::HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (stream_id, frame_type, length) = Frame::decode_header(&header)?;

    if length > max_frame {
        return Err(MuxError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame::new(stream_id, frame_type, payload.into()))
}
