// plexbackup/src/backup/compress.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{self, Write};
use std::path::PathBuf;
use which::which;

use super::types::CompressionFormat;

const ZSTD_LEVEL: i32 = 3;

/// How the compression stage runs for this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compressor {
    /// A multi-threaded compressor binary reading stdin and writing stdout.
    External {
        format: CompressionFormat,
        program: PathBuf,
        args: Vec<String>,
    },
    /// The single-threaded encoder linked into this binary.
    InProcess(CompressionFormat),
}

impl Compressor {
    /// Prefers a parallel compressor on PATH (pigz, zstd -T0) and falls back to
    /// the in-process encoder. Only looks things up; runs nothing.
    pub fn detect(format: CompressionFormat) -> Self {
        let (name, args): (&str, &[&str]) = match format {
            CompressionFormat::Gzip => ("pigz", &["-c"]),
            CompressionFormat::Zstd => ("zstd", &["-T0", "-q", "-c"]),
        };
        match which(name) {
            Ok(program) => Compressor::External {
                format,
                program,
                args: args.iter().map(|a| a.to_string()).collect(),
            },
            Err(_) => Compressor::InProcess(format),
        }
    }

    pub fn format(&self) -> CompressionFormat {
        match self {
            Compressor::External { format, .. } | Compressor::InProcess(format) => *format,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Compressor::External { program, .. } => program.display().to_string(),
            Compressor::InProcess(CompressionFormat::Gzip) => "in-process gzip".to_string(),
            Compressor::InProcess(CompressionFormat::Zstd) => "in-process zstd".to_string(),
        }
    }
}

/// Incremental encoder whose output is drained after every chunk, so it never
/// holds more than one chunk's worth of compressed data.
pub enum StreamEncoder {
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl StreamEncoder {
    pub fn new(format: CompressionFormat) -> io::Result<Self> {
        Ok(match format {
            CompressionFormat::Gzip => {
                StreamEncoder::Gzip(GzEncoder::new(Vec::new(), Compression::default()))
            }
            CompressionFormat::Zstd => {
                StreamEncoder::Zstd(zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)?)
            }
        })
    }

    /// Feeds `chunk` and returns whatever compressed output is ready.
    pub fn compress(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            StreamEncoder::Gzip(enc) => {
                enc.write_all(chunk)?;
                Ok(std::mem::take(enc.get_mut()))
            }
            StreamEncoder::Zstd(enc) => {
                enc.write_all(chunk)?;
                Ok(std::mem::take(enc.get_mut()))
            }
        }
    }

    /// Flushes the remaining output and the format trailer.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            StreamEncoder::Gzip(enc) => enc.finish(),
            StreamEncoder::Zstd(enc) => enc.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 97) as u8).collect()
    }

    fn encode_in_chunks(format: CompressionFormat, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = StreamEncoder::new(format)?;
        let mut out = Vec::new();
        for chunk in data.chunks(4096) {
            out.extend(encoder.compress(chunk)?);
        }
        out.extend(encoder.finish()?);
        Ok(out)
    }

    #[test]
    fn test_gzip_stream_is_complete() -> anyhow::Result<()> {
        let data = sample();
        let compressed = encode_in_chunks(CompressionFormat::Gzip, &data)?;

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..]).read_to_end(&mut decoded)?;
        assert_eq!(decoded, data);
        Ok(())
    }

    #[test]
    fn test_zstd_stream_is_complete() -> anyhow::Result<()> {
        let data = sample();
        let compressed = encode_in_chunks(CompressionFormat::Zstd, &data)?;
        assert_eq!(zstd::stream::decode_all(&compressed[..])?, data);
        Ok(())
    }

    #[test]
    fn test_detect_keeps_requested_format() {
        for format in [CompressionFormat::Gzip, CompressionFormat::Zstd] {
            let compressor = Compressor::detect(format);
            assert_eq!(compressor.format(), format);
            if let Compressor::External { program, .. } = &compressor {
                assert!(program.exists());
            }
        }
    }

    #[test]
    fn test_describe_in_process() {
        assert_eq!(Compressor::InProcess(CompressionFormat::Gzip).describe(), "in-process gzip");
    }
}
