//! Streaming compression codec and per-file compressibility gate.
//!
//! Transfers that cross a slow remote link can compress on the wire; the
//! destination always receives the original bytes. The codec streams
//! through zstd at its fastest level in 1 MiB blocks and reports progress
//! on a time base so tight loops do not flood the sink.

use crate::utils::errors::{EngineError, Result};
use async_compression::tokio::write::{ZstdDecoder, ZstdEncoder};
use async_compression::Level;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Streaming block size.
const BLOCK_BYTES: usize = 1024 * 1024;

/// Minimum interval between progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Extensions worth compressing: text, code, logs, config, and image
/// formats stored uncompressed.
const COMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "log", "csv", "tsv", "json", "xml", "html", "htm", "css", "js", "ts",
    "jsx", "tsx", "rs", "c", "cc", "cpp", "h", "hpp", "py", "java", "kt", "go", "rb", "php",
    "swift", "cs", "sh", "bash", "ps1", "sql", "yaml", "yml", "toml", "ini", "cfg", "conf",
    "properties", "env", "bmp", "tiff", "tif", "svg", "wav", "psd",
];

/// Extensions already carrying their own compression; recompressing them
/// burns CPU for nothing.
const PRECOMPRESSED_EXTENSIONS: &[&str] = &[
    "zip", "7z", "rar", "gz", "tgz", "bz2", "xz", "zst", "lz4", "br", "jpg", "jpeg", "png",
    "gif", "webp", "heic", "avif", "mp4", "mkv", "avi", "mov", "wmv", "webm", "mp3", "aac",
    "ogg", "opus", "flac", "m4a", "pdf", "docx", "xlsx", "pptx", "odt", "ods", "odp", "epub",
    "apk", "jar", "war", "deb", "rpm", "dmg", "iso",
];

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Whether an extension belongs to the compressible set.
pub fn is_compressible_extension(ext: &str) -> bool {
    COMPRESSIBLE_EXTENSIONS.contains(&ext)
}

/// Whether an extension marks an already-compressed container.
pub fn is_precompressed_extension(ext: &str) -> bool {
    PRECOMPRESSED_EXTENSIONS.contains(&ext)
}

/// Per-file compression gate: compressible and not already compressed.
pub fn should_compress(path: &Path) -> bool {
    match extension_of(path) {
        Some(ext) => is_compressible_extension(&ext) && !is_precompressed_extension(&ext),
        None => false,
    }
}

/// Byte totals from a codec pass.
#[derive(Debug, Clone, Copy)]
pub struct CodecTotals {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl CodecTotals {
    /// uncompressed / compressed; 1.0 when nothing was written yet.
    pub fn ratio(uncompressed: u64, compressed: u64) -> f64 {
        if compressed > 0 {
            uncompressed as f64 / compressed as f64
        } else {
            1.0
        }
    }
}

/// AsyncWrite wrapper that counts bytes accepted by the inner writer.
struct CountingWriter<W> {
    inner: W,
    written: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> (Self, Arc<AtomicU64>) {
        let written = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                written: Arc::clone(&written),
            },
            written,
        )
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                self.written.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Stream-compress `reader` into `writer`.
///
/// `progress` receives (uncompressed processed, compressed written, ratio)
/// at most every ~500 ms plus one final call.
pub async fn compress_stream<R, W, F>(
    reader: &mut R,
    writer: W,
    mut progress: F,
    cancel: &CancellationToken,
) -> Result<CodecTotals>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64, u64, f64),
{
    let (counting, written) = CountingWriter::new(writer);
    let mut encoder = ZstdEncoder::with_quality(counting, Level::Fastest);

    let mut buf = vec![0u8; BLOCK_BYTES];
    let mut bytes_in = 0u64;
    let mut last_progress = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        encoder.write_all(&buf[..n]).await?;
        bytes_in += n as u64;

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            let out = written.load(Ordering::Relaxed);
            progress(bytes_in, out, CodecTotals::ratio(bytes_in, out));
            last_progress = Instant::now();
        }
    }

    encoder.shutdown().await?;
    let mut counting = encoder.into_inner();
    counting.flush().await?;

    let bytes_out = written.load(Ordering::Relaxed);
    progress(bytes_in, bytes_out, CodecTotals::ratio(bytes_in, bytes_out));

    Ok(CodecTotals {
        bytes_in,
        bytes_out,
    })
}

/// Stream-decompress `reader` into `writer`.
pub async fn decompress_stream<R, W, F>(
    reader: &mut R,
    writer: W,
    mut progress: F,
    cancel: &CancellationToken,
) -> Result<CodecTotals>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64, u64, f64),
{
    let (counting, written) = CountingWriter::new(writer);
    let mut decoder = ZstdDecoder::new(counting);

    let mut buf = vec![0u8; BLOCK_BYTES];
    let mut bytes_in = 0u64;
    let mut last_progress = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        decoder.write_all(&buf[..n]).await?;
        bytes_in += n as u64;

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            let out = written.load(Ordering::Relaxed);
            progress(out, bytes_in, CodecTotals::ratio(out, bytes_in));
            last_progress = Instant::now();
        }
    }

    decoder.shutdown().await?;
    let mut counting = decoder.into_inner();
    counting.flush().await?;

    let bytes_out = written.load(Ordering::Relaxed);
    progress(bytes_out, bytes_in, CodecTotals::ratio(bytes_out, bytes_in));

    Ok(CodecTotals {
        bytes_in,
        bytes_out,
    })
}
