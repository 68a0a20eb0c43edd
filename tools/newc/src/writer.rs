use std::io::{Read, Write};

use snafu::{ensure, ResultExt};

use crate::{error, pad4, Entry, Result, HEADER_LEN, MAGIC, TRAILER};

/// Streaming archive writer. Records are appended one at a time and the
/// end-of-archive trailer is emitted by [`Writer::finish`].
#[derive(Debug)]
pub struct Writer<W: Write> {
    inner: W,
    finished: bool,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// Append a record whose body is already in memory.
    pub fn append_data(&mut self, entry: &Entry, data: &[u8]) -> Result<()> {
        self.append(entry, &mut &data[..])
    }

    /// Append a record, streaming `entry.size` body bytes from `body`.
    ///
    /// Symlink targets are part of the body and must be supplied by the
    /// caller; [`Entry::symlink`] sizes the record accordingly.
    pub fn append<R: Read>(&mut self, entry: &Entry, body: &mut R) -> Result<()> {
        ensure!(!self.finished, error::FinishedSnafu);
        ensure!(!entry.name.is_empty(), error::EmptyNameSnafu);

        self.write_header(entry)?;

        let copied = std::io::copy(&mut body.take(u64::from(entry.size)), &mut self.inner)
            .context(error::IoSnafu {
                what: "write record body",
            })?;
        ensure!(
            copied == u64::from(entry.size),
            error::ShortBodySnafu {
                name: entry.name.clone(),
                expected: u64::from(entry.size),
                actual: copied,
            }
        );
        self.pad(pad4(entry.size as usize))?;
        Ok(())
    }

    /// Write the trailer record. Idempotent; further appends fail.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let trailer = Entry {
            name: TRAILER.to_string(),
            nlink: 1,
            ..Default::default()
        };
        self.write_header(&trailer)?;
        self.inner.flush().context(error::IoSnafu {
            what: "flush archive",
        })?;
        self.finished = true;
        Ok(())
    }

    /// Consume the writer, finishing the archive if needed.
    pub fn into_inner(mut self) -> Result<W> {
        self.finish()?;
        Ok(self.inner)
    }

    fn write_header(&mut self, entry: &Entry) -> Result<()> {
        // namesize counts the terminating NUL.
        let name_len = entry.name.len() + 1;

        let mut header = Vec::with_capacity(HEADER_LEN + name_len + 3);
        header.extend_from_slice(MAGIC);
        for field in [
            entry.ino,
            entry.mode,
            entry.uid,
            entry.gid,
            entry.nlink,
            entry.mtime,
            entry.size,
            entry.dev_major,
            entry.dev_minor,
            entry.rdev_major,
            entry.rdev_minor,
            name_len as u32,
            0, // check, always zero for newc
        ] {
            header.extend_from_slice(format!("{:08X}", field).as_bytes());
        }
        header.extend_from_slice(entry.name.as_bytes());
        header.push(0);
        header.extend_from_slice(&[0u8; 3][..pad4(HEADER_LEN + name_len)]);

        self.inner.write_all(&header).context(error::IoSnafu {
            what: "write record header",
        })
    }

    fn pad(&mut self, n: usize) -> Result<()> {
        self.inner
            .write_all(&[0u8; 3][..n])
            .context(error::IoSnafu {
                what: "write record padding",
            })
    }
}
