//! Video sources the capture stage can read.
//!
//! Three kinds, selected by the source string:
//! * `http(s)://...` — a live MJPEG multipart stream, reconnecting with
//!   exponential backoff.
//! * a `.mjpeg`/`.mjpg` file — concatenated JPEG frames.
//! * a directory — ordered `*.jpg` files.
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

const SOI: &[u8] = &[0xff, 0xd8];
const EOI: &[u8] = &[0xff, 0xd9];

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub(crate) enum SourceError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("source path pattern invalid: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("live sources cannot be rewound")]
    NotRewindable,
}

/// A frame source. `next_frame` returns [None] at the end of a finite
/// source; live sources block (reconnecting as needed) until a frame is
/// available.
pub(crate) enum VideoSource {
    MjpegHttp(MjpegHttpSource),
    MjpegFile(MjpegFileSource),
    JpegDir(JpegDirSource),
}

impl VideoSource {
    pub(crate) async fn next_frame(&mut self) -> Result<Option<Bytes>, SourceError> {
        match self {
            VideoSource::MjpegHttp(source) => source.next_frame().await.map(Some),
            VideoSource::MjpegFile(source) => Ok(source.next_frame()),
            VideoSource::JpegDir(source) => source.next_frame(),
        }
    }

    /// Restarts a finite source for another loop.
    pub(crate) fn rewind(&mut self) -> Result<(), SourceError> {
        match self {
            VideoSource::MjpegHttp(_) => Err(SourceError::NotRewindable),
            VideoSource::MjpegFile(source) => {
                source.cursor = 0;
                Ok(())
            }
            VideoSource::JpegDir(source) => {
                source.next_index = 0;
                Ok(())
            }
        }
    }
}

/// Opens a source by its string form.
pub(crate) fn open_source(source: &str) -> Result<VideoSource, SourceError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(VideoSource::MjpegHttp(MjpegHttpSource::new(source)?));
    }

    let path = Path::new(source);
    if path.is_dir() {
        return Ok(VideoSource::JpegDir(JpegDirSource::open(path)?));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("mjpeg" | "mjpg") => Ok(VideoSource::MjpegFile(MjpegFileSource::open(path)?)),
        _ => Err(SourceError::Unsupported(source.to_owned())),
    }
}

/// Live MJPEG multipart stream over HTTP.
pub(crate) struct MjpegHttpSource {
    url: String,
    client: reqwest::Client,
    stream: Option<futures_util::stream::BoxStream<'static, reqwest::Result<Bytes>>>,
    buffer: BytesMut,
    backoff: Duration,
}

impl MjpegHttpSource {
    fn new(url: &str) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.to_owned(),
            client,
            stream: None,
            buffer: BytesMut::with_capacity(256 * 1024),
            backoff: INITIAL_BACKOFF,
        })
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        let response = self.client.get(&self.url).send().await?;
        let response = response.error_for_status()?;
        info!(url = %self.url, "connected to MJPEG stream");
        self.stream = Some(response.bytes_stream().boxed());
        self.buffer.clear();
        Ok(())
    }

    /// Blocks until a frame arrives, reconnecting with exponential
    /// backoff after disconnects. Resumes from the next available frame.
    async fn next_frame(&mut self) -> Result<Bytes, SourceError> {
        loop {
            if self.stream.is_none() {
                if let Err(e) = self.connect().await {
                    warn!("stream connect failed, retrying in {:?}: {e}", self.backoff);
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                self.backoff = INITIAL_BACKOFF;
            }

            if let Some(frame) = extract_jpeg(&mut self.buffer) {
                return Ok(frame);
            }

            let chunk = match self.stream.as_mut() {
                Some(stream) => stream.next().await,
                None => continue,
            };
            match chunk {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    warn!("stream error, reconnecting: {e}");
                    self.stream = None;
                }
                None => {
                    info!("stream ended, reconnecting");
                    self.stream = None;
                }
            }
        }
    }
}

/// Pulls the next complete JPEG out of a multipart buffer. Part headers
/// and boundary lines between frames are discarded.
fn extract_jpeg(buffer: &mut BytesMut) -> Option<Bytes> {
    let Some(start) = find_subsequence(buffer, SOI) else {
        // Nothing but boundary and header bytes so far; keep one byte in
        // case the start marker spans chunks.
        if buffer.len() > 1 {
            let _ = buffer.split_to(buffer.len() - 1);
        }
        return None;
    };

    // Drop boundary and part headers preceding the image.
    let _ = buffer.split_to(start);

    let end = find_subsequence(buffer.get(SOI.len()..)?, EOI)? + SOI.len() + EOI.len();
    let frame = buffer.split_to(end);
    Some(frame.freeze())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A file of concatenated JPEG frames.
pub(crate) struct MjpegFileSource {
    data: Bytes,
    cursor: usize,
}

impl MjpegFileSource {
    fn open(path: &Path) -> Result<Self, SourceError> {
        let data = Bytes::from(std::fs::read(path)?);
        Ok(Self { data, cursor: 0 })
    }

    fn next_frame(&mut self) -> Option<Bytes> {
        let remaining = self.data.get(self.cursor..)?;
        let start = find_subsequence(remaining, SOI)?;
        let end = find_subsequence(remaining.get(start + SOI.len()..)?, EOI)? + SOI.len() + EOI.len();
        let frame = self.data.slice(self.cursor + start..self.cursor + start + end);
        self.cursor += start + end;
        Some(frame)
    }
}

/// A directory of ordered JPEG files.
pub(crate) struct JpegDirSource {
    files: Vec<std::path::PathBuf>,
    next_index: usize,
}

impl JpegDirSource {
    fn open(path: &Path) -> Result<Self, SourceError> {
        let pattern = path.join("*.jpg");
        let mut files: Vec<std::path::PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .chain(glob::glob(&path.join("*.jpeg").to_string_lossy())?)
            .filter_map(Result::ok)
            .collect();
        files.sort();
        Ok(Self {
            files,
            next_index: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>, SourceError> {
        let Some(path) = self.files.get(self.next_index) else {
            return Ok(None);
        };
        self.next_index += 1;
        Ok(Some(Bytes::from(std::fs::read(path)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = SOI.to_vec();
        frame.extend_from_slice(body);
        frame.extend_from_slice(EOI);
        frame
    }

    #[test]
    fn multipart_buffer_yields_frames_without_headers() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        buffer.extend_from_slice(&jpeg(b"one"));
        buffer.extend_from_slice(b"\r\n--frame\r\n\r\n");
        buffer.extend_from_slice(&jpeg(b"two"));

        let first = extract_jpeg(&mut buffer).expect("first frame");
        assert_eq!(&first[..], jpeg(b"one").as_slice());
        let second = extract_jpeg(&mut buffer).expect("second frame");
        assert_eq!(&second[..], jpeg(b"two").as_slice());
        assert!(extract_jpeg(&mut buffer).is_none());
    }

    #[test]
    fn partial_frame_stays_buffered_until_complete() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(SOI);
        buffer.extend_from_slice(b"partial");
        assert!(extract_jpeg(&mut buffer).is_none());

        buffer.extend_from_slice(EOI);
        assert!(extract_jpeg(&mut buffer).is_some());
    }

    #[test]
    fn mjpeg_file_source_iterates_and_rewinds() {
        let mut file = tempfile::NamedTempFile::with_suffix(".mjpeg").expect("temp file");
        file.write_all(&jpeg(b"a")).expect("write");
        file.write_all(&jpeg(b"bb")).expect("write");
        file.flush().expect("flush");

        let mut source = MjpegFileSource::open(file.path()).expect("opens");
        assert_eq!(source.next_frame().as_deref(), Some(jpeg(b"a").as_slice()));
        assert_eq!(source.next_frame().as_deref(), Some(jpeg(b"bb").as_slice()));
        assert!(source.next_frame().is_none());

        source.cursor = 0;
        assert_eq!(source.next_frame().as_deref(), Some(jpeg(b"a").as_slice()));
    }

    #[test]
    fn unsupported_sources_are_rejected() {
        assert!(matches!(
            open_source("rtsp://camera/stream"),
            Err(SourceError::Unsupported(_))
        ));
    }
}
