use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::mission::Mp4Settings;
use crate::world_state::{TimestampedString, TimestampedVideoFrame};

const RAW_VIDEO_MAGIC: &[u8; 8] = b"MHVIDEO1";

/// Append-only file writer fed through an unbounded channel so callers never
/// wait on disk I/O. Writes are applied in submission order by a background
/// task; [`FileRecorder::close`] drains and flushes it.
pub struct FileRecorder {
    path: PathBuf,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
}

impl FileRecorder {
    /// Creates (or truncates) `path` and starts the writer task.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            let mut writer = BufWriter::new(file);
            while let Some(chunk) = rx.recv().await {
                if let Err(err) = write_batch(&mut writer, chunk, &mut rx).await {
                    metrics::counter!("recorder.write_errors").increment(1);
                    warn!(error = %err, path = %task_path.display(), "failed to write recording");
                    break;
                }
            }
            if let Err(err) = writer.shutdown().await {
                warn!(error = %err, path = %task_path.display(), "failed to close recording");
            }
        });
        Ok(Self {
            path,
            tx: Some(tx),
            task: Some(task),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, chunk: Bytes) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(chunk);
        }
    }

    /// Writes `<timestamp> <text>\n`.
    pub fn record(&self, message: &TimestampedString) {
        let mut line = message.to_record_line();
        line.push('\n');
        self.write(Bytes::from(line));
    }

    /// Stops accepting writes and waits for everything queued to hit disk.
    pub async fn close(&mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn write_batch(
    writer: &mut BufWriter<File>,
    first: Bytes,
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    writer.write_all(&first).await?;
    while let Ok(chunk) = rx.try_recv() {
        writer.write_all(&chunk).await?;
    }
    writer.flush().await
}

/// Destination for the frames of a recorded video stream.
#[async_trait]
pub trait VideoSink: Send + Sync {
    fn write_frame(&self, frame: &TimestampedVideoFrame);
    async fn finish(&mut self);
}

/// Stores frames uncompressed: an 8-byte magic, the requested frame rate and
/// bit rate, then per frame the capture time in microseconds, the geometry,
/// the pose and the pixels, all big-endian.
pub struct RawVideoSink {
    recorder: FileRecorder,
}

impl RawVideoSink {
    pub async fn create(path: impl AsRef<Path>, settings: Mp4Settings) -> io::Result<Self> {
        let recorder = FileRecorder::create(path).await?;
        let mut header = BytesMut::with_capacity(20);
        header.put_slice(RAW_VIDEO_MAGIC);
        header.put_u32(settings.frames_per_second);
        header.put_u64(settings.bit_rate);
        recorder.write(header.freeze());
        Ok(Self { recorder })
    }
}

#[async_trait]
impl VideoSink for RawVideoSink {
    fn write_frame(&self, frame: &TimestampedVideoFrame) {
        let pixels = &frame.frame.pixels;
        let mut record = BytesMut::with_capacity(33 + pixels.len());
        record.put_i64(frame.timestamp.timestamp_micros());
        record.put_u16(frame.frame.width);
        record.put_u16(frame.frame.height);
        record.put_u8(frame.frame.channels);
        let pose = frame.frame.pose;
        for value in [pose.x, pose.y, pose.z, pose.yaw, pose.pitch] {
            record.put_f32(value);
        }
        record.put_slice(pixels);
        self.recorder.write(record.freeze());
    }

    async fn finish(&mut self) {
        self.recorder.close().await;
    }
}
