// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use num_traits::ToPrimitive;

use crate::util;

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}

fn seek_out_of_bounds() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "Offset would be before the start of the section",
    )
}

/// A stream wrapper that restricts all reads and writes to a specific section
/// of a file, with positions relative to the start of the section. This is how
/// partition windows are handed to the filesystem authoring code: anything
/// trying to touch bytes outside the window fails instead of corrupting
/// neighboring regions.
pub struct SectionStream<F> {
    inner: F,
    start: u64,
    size: u64,
    pos: u64,
}

impl<F: Seek> SectionStream<F> {
    pub fn new(mut inner: F, start: u64, size: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;

        Ok(Self {
            inner,
            start,
            size,
            pos: 0,
        })
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Read + Seek> Read for SectionStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = self.size.saturating_sub(self.pos).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..to_read])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<F: Write + Seek> Write for SectionStream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let to_write = self.size.saturating_sub(self.pos).min(buf.len() as u64) as usize;
        if to_write == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "Write at offset {} would exceed the section size of {}",
                    self.pos, self.size,
                ),
            ));
        }

        let n = self.inner.write(&buf[..to_write])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<F: Seek> Seek for SectionStream<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => self
                .size
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(seek_out_of_bounds)?,
            SeekFrom::Current(o) => self
                .pos
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(seek_out_of_bounds)?,
        };

        let raw_pos = self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        Ok(raw_pos - self.start)
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`. If either `reader` or
/// `writer` reaches EOF before `size` bytes are copied, an error is returned.
/// The operation is cancelled on the next loop iteration if `cancel_signal` is
/// set to `true`.
pub fn copy_n(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;

        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF. If `writer`
/// reaches EOF before `reader` does, an error is returned. The operation is
/// cancelled on the next loop iteration if `cancel_signal` is set to `true`.
pub fn copy(
    mut reader: impl Read,
    mut writer: impl Write,
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor, Read, Seek, SeekFrom, Write},
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::SectionStream;

    #[test]
    fn section_stream_read() {
        let raw = Cursor::new(b"fooinnerbar".to_vec());
        let mut stream = SectionStream::new(raw, 3, 5).unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"inner");

        // Reads past the end of the section see EOF.
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        stream.seek(SeekFrom::End(-4)).unwrap();
        stream.read_exact(&mut buf[..4]).unwrap();
        assert_eq!(&buf[..4], b"nner");
    }

    #[test]
    fn section_stream_write() {
        let raw = Cursor::new(vec![0u8; 11]);
        let mut stream = SectionStream::new(raw, 3, 5).unwrap();

        stream.write_all(b"inner").unwrap();

        // Writes past the end of the section must fail instead of spilling
        // into the surrounding bytes.
        let err = stream.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);

        let raw = stream.into_inner().into_inner();
        assert_eq!(&raw, b"\0\0\0inner\0\0\0");
    }

    #[test]
    fn copy_cancel() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(b"foobar".to_vec());
        let mut writer = Cursor::new(vec![0u8; 6]);

        super::copy_n(&mut reader, &mut writer, 6, &cancel_signal).unwrap();
        assert_eq!(writer.get_ref(), b"foobar");

        reader.rewind().unwrap();
        writer.rewind().unwrap();
        cancel_signal.store(true, Ordering::SeqCst);

        let err = super::copy(&mut reader, &mut writer, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
