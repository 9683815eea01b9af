//! Inbound endpoints a client streams mission telemetry to.
//!
//! Every connection carries frames with a 4-byte big-endian length prefix and
//! each frame is one message. A listener accepts any number of connections
//! until it is shut down.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mission::{Mp4Settings, VideoRequest};
use crate::runtime::SocketConfigurator;
use crate::world_state::{FramePose, TimestampedString, TimestampedVideoFrame, VideoFrame};

pub mod recorder;

pub use recorder::{FileRecorder, RawVideoSink, VideoSink};

/// Size of the big-endian `x, y, z, yaw, pitch` header in front of every
/// video frame.
pub const FRAME_POSE_BYTES: usize = 20;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {kind} listener on {addr}: {source}")]
    Bind {
        kind: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to open recording {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: TimestampedString);
}

#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame(&self, frame: TimestampedVideoFrame);
}

/// Where and how listeners bind.
#[derive(Clone)]
pub struct ListenerSettings {
    pub listen_address: IpAddr,
    pub max_frame_bytes: usize,
    pub sockets: SocketConfigurator,
}

impl ListenerSettings {
    pub fn new(listen_address: IpAddr, max_frame_bytes: usize) -> Self {
        Self {
            listen_address,
            max_frame_bytes,
            sockets: SocketConfigurator::new(),
        }
    }

    fn bind(&self, kind: &'static str, port: u16) -> Result<TcpListener, ListenerError> {
        let addr = SocketAddr::new(self.listen_address, port);
        self.sockets
            .bind(addr)
            .map_err(|source| ListenerError::Bind { kind, addr, source })
    }
}

/// Accept loop plus one task per connection, all stopped by one token.
struct Endpoint {
    kind: &'static str,
    port: u16,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Endpoint {
    fn start<F, Fut>(
        kind: &'static str,
        listener: TcpListener,
        max_frame_bytes: usize,
        on_frame: F,
    ) -> io::Result<Self>
    where
        F: Fn(Bytes) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let port = listener.local_addr()?.port();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            kind,
            listener,
            max_frame_bytes,
            cancel.clone(),
            on_frame,
        ));
        info!(kind, port, "listener started");
        Ok(Self {
            kind,
            port,
            cancel,
            task: Some(task),
        })
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
            debug!(kind = self.kind, port = self.port, "listener stopped");
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<F, Fut>(
    kind: &'static str,
    listener: TcpListener,
    max_frame_bytes: usize,
    cancel: CancellationToken,
    on_frame: F,
) where
    F: Fn(Bytes) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    metrics::counter!("listener.connections", "kind" => kind).increment(1);
                    debug!(kind, peer = %peer, "accepted connection");
                    connections.spawn(serve_connection(
                        kind,
                        stream,
                        max_frame_bytes,
                        cancel.clone(),
                        on_frame.clone(),
                    ));
                }
                Err(err) => {
                    metrics::counter!("listener.accept_errors", "kind" => kind).increment(1);
                    warn!(kind, error = %err, "failed to accept connection");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn serve_connection<F, Fut>(
    kind: &'static str,
    stream: TcpStream,
    max_frame_bytes: usize,
    cancel: CancellationToken,
    on_frame: F,
) where
    F: Fn(Bytes) -> Fut,
    Fut: Future<Output = ()>,
{
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec();
    let mut frames = FramedRead::new(stream, codec);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                metrics::counter!("listener.messages", "kind" => kind).increment(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = on_frame(frame.freeze()) => {}
                }
            }
            Some(Err(err)) => {
                metrics::counter!("listener.frame_errors", "kind" => kind).increment(1);
                warn!(kind, error = %err, "dropping connection after framing error");
                break;
            }
            None => break,
        }
    }
}

type SharedRecorder = Arc<Mutex<Option<FileRecorder>>>;

/// Listener for text messages: mission control, rewards and observations.
pub struct StringListener {
    endpoint: Endpoint,
    recorder: SharedRecorder,
}

impl StringListener {
    pub fn bind(
        kind: &'static str,
        port: u16,
        settings: &ListenerSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ListenerError> {
        let listener = settings.bind(kind, port)?;
        let addr = SocketAddr::new(settings.listen_address, port);
        let recorder: SharedRecorder = Arc::new(Mutex::new(None));
        let on_frame = {
            let recorder = recorder.clone();
            move |payload: Bytes| {
                let recorder = recorder.clone();
                let handler = handler.clone();
                async move {
                    let message = TimestampedString::new(
                        Utc::now(),
                        String::from_utf8_lossy(&payload).into_owned(),
                    );
                    if let Some(recorder) = recorder.lock().await.as_ref() {
                        recorder.record(&message);
                    }
                    handler.on_message(message).await;
                }
            }
        };
        let endpoint = Endpoint::start(kind, listener, settings.max_frame_bytes, on_frame)
            .map_err(|source| ListenerError::Bind { kind, addr, source })?;
        Ok(Self { endpoint, recorder })
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Starts recording every received message to `path`, replacing any
    /// previous recording.
    pub async fn record(&self, path: &Path) -> Result<(), ListenerError> {
        let recorder = FileRecorder::create(path)
            .await
            .map_err(|source| ListenerError::Record {
                path: path.to_path_buf(),
                source,
            })?;
        let previous = self.recorder.lock().await.replace(recorder);
        if let Some(mut previous) = previous {
            previous.close().await;
        }
        Ok(())
    }

    pub async fn is_recording(&self) -> bool {
        self.recorder.lock().await.is_some()
    }

    /// Writes `message` to the active recording, if any.
    pub async fn record_message(&self, message: &TimestampedString) {
        if let Some(recorder) = self.recorder.lock().await.as_ref() {
            recorder.record(message);
        }
    }

    pub async fn stop_recording(&self) {
        let previous = self.recorder.lock().await.take();
        if let Some(mut previous) = previous {
            previous.close().await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.endpoint.shutdown().await;
        self.stop_recording().await;
    }
}

type SharedSink = Arc<Mutex<Option<Box<dyn VideoSink>>>>;

/// Listener for fixed-geometry video frames.
pub struct VideoListener {
    endpoint: Endpoint,
    request: VideoRequest,
    sink: SharedSink,
}

impl VideoListener {
    pub fn bind(
        port: u16,
        request: VideoRequest,
        settings: &ListenerSettings,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self, ListenerError> {
        const KIND: &str = "video";
        let listener = settings.bind(KIND, port)?;
        let addr = SocketAddr::new(settings.listen_address, port);
        let sink: SharedSink = Arc::new(Mutex::new(None));
        let on_frame = {
            let sink = sink.clone();
            move |payload: Bytes| {
                let sink = sink.clone();
                let handler = handler.clone();
                async move {
                    let Some(frame) = decode_frame(&request, payload) else {
                        return;
                    };
                    let frame = TimestampedVideoFrame::new(Utc::now(), frame);
                    if let Some(sink) = sink.lock().await.as_ref() {
                        sink.write_frame(&frame);
                    }
                    handler.on_frame(frame).await;
                }
            }
        };
        let endpoint = Endpoint::start(KIND, listener, settings.max_frame_bytes, on_frame)
            .map_err(|source| ListenerError::Bind {
                kind: KIND,
                addr,
                source,
            })?;
        Ok(Self {
            endpoint,
            request,
            sink,
        })
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn request(&self) -> VideoRequest {
        self.request
    }

    /// Starts writing frames to a raw video file, replacing any previous sink.
    pub async fn record(&self, path: &Path, settings: Mp4Settings) -> Result<(), ListenerError> {
        let sink = RawVideoSink::create(path, settings)
            .await
            .map_err(|source| ListenerError::Record {
                path: path.to_path_buf(),
                source,
            })?;
        self.attach_sink(Box::new(sink)).await;
        Ok(())
    }

    pub async fn attach_sink(&self, sink: Box<dyn VideoSink>) {
        let previous = self.sink.lock().await.replace(sink);
        if let Some(mut previous) = previous {
            previous.finish().await;
        }
    }

    pub async fn is_recording(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    pub async fn stop_recording(&self) {
        let previous = self.sink.lock().await.take();
        if let Some(mut previous) = previous {
            previous.finish().await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.endpoint.shutdown().await;
        self.stop_recording().await;
    }
}

/// Splits a frame into pose header and pixels. Frames whose size does not
/// match the negotiated geometry are dropped.
pub fn decode_frame(request: &VideoRequest, mut payload: Bytes) -> Option<VideoFrame> {
    let expected = FRAME_POSE_BYTES + request.frame_len();
    if payload.len() != expected {
        metrics::counter!("listener.dropped_frames", "kind" => "video").increment(1);
        warn!(
            expected,
            received = payload.len(),
            width = request.width,
            height = request.height,
            channels = request.channels,
            "dropping video frame with unexpected size"
        );
        return None;
    }
    let pose = FramePose {
        x: payload.get_f32(),
        y: payload.get_f32(),
        z: payload.get_f32(),
        yaw: payload.get_f32(),
        pitch: payload.get_f32(),
    };
    Some(VideoFrame {
        width: request.width,
        height: request.height,
        channels: request.channels,
        pose,
        pixels: payload,
    })
}

fn reusable(existing_port: u16, requested: u16) -> bool {
    requested == 0 || requested == existing_port
}

/// Callbacks the four listeners deliver to.
#[derive(Clone)]
pub struct ListenerHandlers {
    pub mission_control: Arc<dyn MessageHandler>,
    pub rewards: Arc<dyn MessageHandler>,
    pub observations: Arc<dyn MessageHandler>,
    pub video: Arc<dyn FrameHandler>,
}

/// The four inbound endpoints of a host, kept across missions and reused when
/// a new mission asks for compatible ones.
#[derive(Default)]
pub struct ListenerSet {
    mission_control: Option<StringListener>,
    rewards: Option<StringListener>,
    observations: Option<StringListener>,
    video: Option<VideoListener>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses the mission-control listener when `port` is 0 or its bound
    /// port. Returns the effective port.
    pub async fn ensure_mission_control(
        &mut self,
        port: u16,
        settings: &ListenerSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<u16, ListenerError> {
        ensure_string_listener(&mut self.mission_control, "mission_control", port, settings, handler)
            .await
            .map(|listener| listener.port())
    }

    /// Like [`Self::ensure_mission_control`], then records to `record_path`
    /// when given.
    pub async fn ensure_rewards(
        &mut self,
        port: u16,
        settings: &ListenerSettings,
        handler: Arc<dyn MessageHandler>,
        record_path: Option<&Path>,
    ) -> Result<u16, ListenerError> {
        let listener =
            ensure_string_listener(&mut self.rewards, "rewards", port, settings, handler).await?;
        if let Some(path) = record_path {
            listener.record(path).await?;
        }
        Ok(listener.port())
    }

    pub async fn ensure_observations(
        &mut self,
        port: u16,
        settings: &ListenerSettings,
        handler: Arc<dyn MessageHandler>,
        record_path: Option<&Path>,
    ) -> Result<u16, ListenerError> {
        let listener =
            ensure_string_listener(&mut self.observations, "observations", port, settings, handler)
                .await?;
        if let Some(path) = record_path {
            listener.record(path).await?;
        }
        Ok(listener.port())
    }

    /// Reuses the video listener only when the port is compatible and the
    /// geometry matches exactly.
    pub async fn ensure_video(
        &mut self,
        port: u16,
        request: VideoRequest,
        settings: &ListenerSettings,
        handler: Arc<dyn FrameHandler>,
        recording: Option<(&Path, Mp4Settings)>,
    ) -> Result<u16, ListenerError> {
        let listener = match self.video.take() {
            Some(existing) if reusable(existing.port(), port) && existing.request() == request => {
                existing
            }
            previous => {
                if let Some(mut previous) = previous {
                    previous.shutdown().await;
                }
                VideoListener::bind(port, request, settings, handler)?
            }
        };
        let listener = self.video.insert(listener);
        if let Some((path, mp4)) = recording {
            listener.record(path, mp4).await?;
        }
        Ok(listener.port())
    }

    pub fn mission_control_port(&self) -> Option<u16> {
        self.mission_control.as_ref().map(StringListener::port)
    }

    pub fn rewards_port(&self) -> Option<u16> {
        self.rewards.as_ref().map(StringListener::port)
    }

    pub fn observations_port(&self) -> Option<u16> {
        self.observations.as_ref().map(StringListener::port)
    }

    pub fn video_port(&self) -> Option<u16> {
        self.video.as_ref().map(VideoListener::port)
    }

    pub fn rewards(&self) -> Option<&StringListener> {
        self.rewards.as_ref()
    }

    pub fn observations(&self) -> Option<&StringListener> {
        self.observations.as_ref()
    }

    pub fn video(&self) -> Option<&VideoListener> {
        self.video.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.mission_control.is_none()
            && self.rewards.is_none()
            && self.observations.is_none()
            && self.video.is_none()
    }

    /// Writes `message` to the rewards recording, if one is active.
    pub async fn record_reward_message(&self, message: &TimestampedString) {
        if let Some(rewards) = &self.rewards {
            rewards.record_message(message).await;
        }
    }

    pub async fn stop_recording(&self) {
        if let Some(video) = &self.video {
            video.stop_recording().await;
        }
        if let Some(observations) = &self.observations {
            observations.stop_recording().await;
        }
        if let Some(rewards) = &self.rewards {
            rewards.stop_recording().await;
        }
    }

    /// Stops every listener and waits for its tasks to finish.
    pub async fn shutdown(&mut self) {
        for mut listener in [
            self.mission_control.take(),
            self.rewards.take(),
            self.observations.take(),
        ]
        .into_iter()
        .flatten()
        {
            listener.shutdown().await;
        }
        if let Some(mut video) = self.video.take() {
            video.shutdown().await;
        }
    }
}

async fn ensure_string_listener<'a>(
    slot: &'a mut Option<StringListener>,
    kind: &'static str,
    port: u16,
    settings: &ListenerSettings,
    handler: Arc<dyn MessageHandler>,
) -> Result<&'a StringListener, ListenerError> {
    let listener = match slot.take() {
        Some(existing) if reusable(existing.port(), port) => existing,
        previous => {
            if let Some(mut previous) = previous {
                previous.shutdown().await;
            }
            StringListener::bind(kind, port, settings, handler)?
        }
    };
    Ok(slot.insert(listener))
}
