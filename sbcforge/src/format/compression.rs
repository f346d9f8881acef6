// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek};

use flate2::read::GzDecoder;
use lzma_rust2::XzReader;
use thiserror::Error;

use crate::stream::ReadFixedSizeExt;

static GZIP_MAGIC: &[u8; 2] = b"\x1f\x8b";
static XZ_MAGIC: &[u8; 6] = b"\xfd\x37\x7a\x58\x5a\x00";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compression format")]
    UnknownFormat,
    #[error("I/O error when autodetecting compression format")]
    AutoDetect(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedFormat {
    Gzip,
    Xz,
}

pub enum CompressedReader<R: Read> {
    Gzip(GzDecoder<R>),
    /// Boxed because the [`XzReader`] is nearly 4 KiB.
    Xz(Box<XzReader<R>>),
}

impl<R: Read> CompressedReader<R> {
    pub fn with_format(reader: R, format: CompressedFormat) -> Self {
        match format {
            CompressedFormat::Gzip => Self::Gzip(GzDecoder::new(reader)),
            CompressedFormat::Xz => Self::Xz(Box::new(XzReader::new(reader, false))),
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::Gzip(_) => CompressedFormat::Gzip,
            Self::Xz(_) => CompressedFormat::Xz,
        }
    }

    pub fn into_inner(self) -> R {
        match self {
            Self::Gzip(r) => r.into_inner(),
            Self::Xz(r) => r.into_inner(),
        }
    }
}

impl<R: Read + Seek> CompressedReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let magic = reader.read_array_exact::<6>().map_err(Error::AutoDetect)?;

        reader.rewind().map_err(Error::AutoDetect)?;

        if &magic[0..2] == GZIP_MAGIC {
            Ok(Self::Gzip(GzDecoder::new(reader)))
        } else if &magic == XZ_MAGIC {
            Ok(Self::Xz(Box::new(XzReader::new(reader, false))))
        } else {
            Err(Error::UnknownFormat)
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(r) => r.read(buf),
            Self::Xz(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};

    use flate2::{write::GzEncoder, Compression};

    use super::{CompressedFormat, CompressedReader};

    #[test]
    fn sniff_gzip() {
        let mut encoder = GzEncoder::new(Cursor::new(Vec::new()), Compression::default());
        encoder.write_all(b"foobar").unwrap();
        let raw = encoder.finish().unwrap().into_inner();

        let mut reader = CompressedReader::new(Cursor::new(raw)).unwrap();
        assert_eq!(reader.format(), CompressedFormat::Gzip);

        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"foobar");
    }

    #[test]
    fn sniff_unknown() {
        let raw = b"not compressed".to_vec();
        assert!(CompressedReader::new(Cursor::new(raw)).is_err());
    }
}
