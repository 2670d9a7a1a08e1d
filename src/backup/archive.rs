// plexbackup/src/backup/archive.rs
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use super::compress::{Compressor, StreamEncoder};
use super::counting::{ByteCounter, CountingReader};
use super::types::CompressionFormat;

/// Names left out of every archive, wherever they appear in the tree.
pub const EXCLUDED_PATTERNS: [&str; 4] =
    ["Cache", "Crash Reports", "Diagnostics", "plexmediaserver.pid"];

const CHUNK_SIZE: usize = 64 * 1024;
// Chunks in flight between the producer and the upload.
const PIPE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("source {} is not a readable directory: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source {} has no parent directory to archive from", .0.display())]
    SourceRoot(PathBuf),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read from {stage}: {source}")]
    Read {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to feed the compressor: {0}")]
    Feed(#[source] io::Error),

    #[error("compression failed: {0}")]
    Encode(#[source] io::Error),

    #[error("failed to wait for {stage}: {source}")]
    Wait {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{stage} completed improperly: {status}")]
    Exit {
        stage: &'static str,
        status: ExitStatus,
    },

    #[error("upload stopped consuming the backup stream")]
    ConsumerClosed,
}

/// Compressed archive bytes as seen by the uploader. Yields an error instead of
/// EOF if any stage fails.
pub type ArchiveStream = CountingReader<StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>>;

/// Drives every producing stage; resolves to the uncompressed archive size.
pub type Producer = Pin<Box<dyn Future<Output = Result<u64, PipelineError>> + Send>>;

/// One pipeline execution: the stream to upload and the future producing it.
/// Both must be polled together. Dropping the producer kills the child processes.
pub struct PipelineRun {
    pub output: ArchiveStream,
    pub producer: Producer,
}

/// tar | compress, streamed without touching the local disk.
#[derive(Debug, Clone)]
pub struct ArchivePipeline {
    archiver: PathBuf,
    compressor: Compressor,
}

impl ArchivePipeline {
    pub fn new(archiver: impl Into<PathBuf>, compressor: Compressor) -> Self {
        ArchivePipeline { archiver: archiver.into(), compressor }
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    pub fn format(&self) -> CompressionFormat {
        self.compressor.format()
    }

    pub fn start(&self, directory: &Path) -> PipelineRun {
        let (tx, rx) = mpsc::channel(PIPE_DEPTH);
        let output = CountingReader::new(StreamReader::new(ReceiverStream::new(rx)));
        let producer = Box::pin(self.clone().produce(directory.to_path_buf(), tx));
        PipelineRun { output, producer }
    }

    async fn produce(
        self,
        directory: PathBuf,
        tx: mpsc::Sender<io::Result<Bytes>>,
    ) -> Result<u64, PipelineError> {
        let uncompressed = ByteCounter::default();
        let result = self.run_stages(&directory, &tx, &uncompressed).await;
        match &result {
            // Nobody is left to tell.
            Err(PipelineError::ConsumerClosed) => {}
            Err(e) => {
                tracing::debug!(error = %e, "pipeline failed, poisoning upload stream");
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
            }
            Ok(()) => {}
        }
        // Dropping tx after a clean run is the only way the uploader sees EOF.
        result.map(|()| uncompressed.get())
    }

    async fn run_stages(
        &self,
        directory: &Path,
        tx: &mpsc::Sender<io::Result<Bytes>>,
        uncompressed: &ByteCounter,
    ) -> Result<(), PipelineError> {
        let metadata = tokio::fs::metadata(directory).await.map_err(|source| {
            PipelineError::Source { path: directory.to_path_buf(), source }
        })?;
        if !metadata.is_dir() {
            return Err(PipelineError::Source {
                path: directory.to_path_buf(),
                source: io::Error::other("not a directory"),
            });
        }

        let mut tar = self
            .archive_command(directory)?
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                program: self.archiver.display().to_string(),
                source,
            })?;
        let archive = take_stdout(&mut tar, &self.archiver)?;

        tracing::debug!(
            directory = %directory.display(),
            compressor = %self.compressor.describe(),
            "archive stage started"
        );

        match &self.compressor {
            Compressor::InProcess(format) => {
                compress_in_process(tar, archive, *format, tx, uncompressed).await
            }
            Compressor::External { program, args, .. } => {
                compress_external(tar, archive, program, args, tx, uncompressed).await
            }
        }
    }

    /// tar runs from the parent directory so the archive root is the leaf
    /// directory itself. Output goes to stdout: tar reads `host:path` archive
    /// names as remote locations, so the archive is never named on the command line.
    fn archive_command(&self, directory: &Path) -> Result<Command, PipelineError> {
        let name = directory
            .file_name()
            .ok_or_else(|| PipelineError::SourceRoot(directory.to_path_buf()))?;
        let parent = match directory.parent() {
            Some(p) if p.as_os_str().is_empty() => Path::new("."),
            Some(p) => p,
            None => return Err(PipelineError::SourceRoot(directory.to_path_buf())),
        };

        let mut cmd = Command::new(&self.archiver);
        cmd.arg("-cf").arg("-").arg("-C").arg(parent);
        for pattern in EXCLUDED_PATTERNS {
            cmd.arg("--exclude").arg(pattern);
        }
        cmd.arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

fn take_stdout(child: &mut Child, program: &Path) -> Result<ChildStdout, PipelineError> {
    child.stdout.take().ok_or_else(|| PipelineError::Spawn {
        program: program.display().to_string(),
        source: io::Error::other("stdout was not captured"),
    })
}

async fn wait_success(child: &mut Child, stage: &'static str) -> Result<(), PipelineError> {
    let status = child
        .wait()
        .await
        .map_err(|source| PipelineError::Wait { stage, source })?;
    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::Exit { stage, status })
    }
}

async fn send(tx: &mpsc::Sender<io::Result<Bytes>>, chunk: Vec<u8>) -> Result<(), PipelineError> {
    if chunk.is_empty() {
        return Ok(());
    }
    tx.send(Ok(Bytes::from(chunk)))
        .await
        .map_err(|_| PipelineError::ConsumerClosed)
}

fn send_blocking(tx: &mpsc::Sender<io::Result<Bytes>>, chunk: Vec<u8>) -> Result<(), PipelineError> {
    if chunk.is_empty() {
        return Ok(());
    }
    tx.blocking_send(Ok(Bytes::from(chunk)))
        .map_err(|_| PipelineError::ConsumerClosed)
}

enum EncoderInput {
    Chunk(Vec<u8>),
    Finish,
}

/// Runs on a blocking thread. Returns without writing the trailer if the
/// input closes before `Finish` arrives.
fn encode_blocking(
    format: CompressionFormat,
    mut input: mpsc::Receiver<EncoderInput>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> Result<(), PipelineError> {
    let mut encoder = StreamEncoder::new(format).map_err(PipelineError::Encode)?;
    while let Some(message) = input.blocking_recv() {
        match message {
            EncoderInput::Chunk(chunk) => {
                let compressed = encoder.compress(&chunk).map_err(PipelineError::Encode)?;
                send_blocking(&tx, compressed)?;
            }
            EncoderInput::Finish => {
                let tail = encoder.finish().map_err(PipelineError::Encode)?;
                return send_blocking(&tx, tail);
            }
        }
    }
    Ok(())
}

/// Reads tar's output on this task and compresses it on a blocking thread,
/// so encoding never holds up the upload polled alongside the producer.
async fn compress_in_process(
    mut tar: Child,
    mut archive: ChildStdout,
    format: CompressionFormat,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    uncompressed: &ByteCounter,
) -> Result<(), PipelineError> {
    let (input, chunks) = mpsc::channel(PIPE_DEPTH);
    let output = tx.clone();
    let encoder = tokio::task::spawn_blocking(move || encode_blocking(format, chunks, output));

    let fed = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = archive
                .read(&mut buf)
                .await
                .map_err(|source| PipelineError::Read { stage: "tar", source })?;
            if n == 0 {
                break;
            }
            uncompressed.add(n as u64);
            if input.send(EncoderInput::Chunk(buf[..n].to_vec())).await.is_err() {
                // The encoder stopped early; its own result says why.
                return Ok(());
            }
        }
        // The trailer is only written once tar is known to have finished cleanly,
        // so a failed archive never looks like a complete compressed stream.
        wait_success(&mut tar, "tar").await?;
        let _ = input.send(EncoderInput::Finish).await;
        Ok::<(), PipelineError>(())
    }
    .await;

    // Closing the input and joining the thread keeps every chunk it still
    // holds ahead of any poison sent by the caller.
    drop(input);
    let encoded = encoder
        .await
        .map_err(|e| PipelineError::Encode(io::Error::other(e)))?;
    fed?;
    encoded
}

/// tar | compressor as two processes, with this task pumping bytes between them.
async fn compress_external(
    mut tar: Child,
    mut archive: ChildStdout,
    program: &Path,
    args: &[String],
    tx: &mpsc::Sender<io::Result<Bytes>>,
    uncompressed: &ByteCounter,
) -> Result<(), PipelineError> {
    let mut compressor = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| PipelineError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
    let mut stdin = compressor.stdin.take().ok_or_else(|| PipelineError::Spawn {
        program: program.display().to_string(),
        source: io::Error::other("stdin was not captured"),
    })?;
    let mut compressed = take_stdout(&mut compressor, program)?;

    let counter = uncompressed.clone();
    let feed = async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = archive
                .read(&mut buf)
                .await
                .map_err(|source| PipelineError::Read { stage: "tar", source })?;
            if n == 0 {
                break;
            }
            counter.add(n as u64);
            stdin.write_all(&buf[..n]).await.map_err(PipelineError::Feed)?;
        }
        // Closing stdin lets the compressor flush and exit.
        stdin.shutdown().await.map_err(PipelineError::Feed)?;
        Ok::<(), PipelineError>(())
    };
    let forward = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = compressed
                .read(&mut buf)
                .await
                .map_err(|source| PipelineError::Read { stage: "compressor", source })?;
            if n == 0 {
                return Ok::<(), PipelineError>(());
            }
            send(tx, buf[..n].to_vec()).await?;
        }
    };
    tokio::try_join!(feed, forward)?;

    wait_success(&mut tar, "tar").await?;
    wait_success(&mut compressor, "compressor").await
}
