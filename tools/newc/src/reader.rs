use std::collections::HashMap;
use std::io::Read;
use std::path::Component;

use snafu::{ensure, OptionExt, ResultExt};

use crate::{error, pad4, Entry, FileType, Result, HEADER_LEN, MAGIC, TRAILER};

/// Streaming archive reader.
///
/// Yields each record with its body until the trailer is reached.
/// Record paths are validated: absolute paths and paths containing a
/// `..` component are refused, since archives are unpacked beneath a
/// caller-chosen root.
#[derive(Debug)]
pub struct Reader<R: Read> {
    inner: R,
    done: bool,
    // (dev_major, dev_minor, ino) of body-carrying link-group members,
    // keyed to the path later members reference.
    link_primaries: HashMap<(u32, u32, u32), String>,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            done: false,
            link_primaries: HashMap::new(),
        }
    }

    /// Read the next record, or `None` once the trailer is seen.
    pub fn next_entry(&mut self) -> Result<Option<(Entry, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }

        let mut entry = self.read_header()?;
        if entry.name == TRAILER {
            self.done = true;
            return Ok(None);
        }
        validate_path(&entry.name)?;

        let mut body = vec![0u8; entry.size as usize];
        self.inner
            .read_exact(&mut body)
            .context(error::IoSnafu {
                what: "read record body",
            })?;
        self.skip(pad4(entry.size as usize))?;

        match entry.file_type() {
            FileType::Symlink => {
                entry.link_name =
                    Some(String::from_utf8(body.clone()).context(error::BadNameSnafu)?);
            }
            FileType::Regular if entry.nlink > 1 => {
                let key = (entry.dev_major, entry.dev_minor, entry.ino);
                if entry.size > 0 {
                    self.link_primaries.insert(key, entry.name.clone());
                } else if let Some(primary) = self.link_primaries.get(&key) {
                    entry.link_name = Some(primary.clone());
                }
            }
            _ => {}
        }

        Ok(Some((entry, body)))
    }

    fn read_header(&mut self) -> Result<Entry> {
        let mut raw = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut raw).context(error::IoSnafu {
            what: "read record header",
        })?;
        ensure!(
            &raw[..6] == MAGIC,
            error::BadMagicSnafu {
                found: String::from_utf8_lossy(&raw[..6]).into_owned(),
            }
        );

        let mut fields = [0u32; 13];
        for (i, field) in fields.iter_mut().enumerate() {
            let start = 6 + i * 8;
            *field = parse_hex(FIELD_NAMES[i], &raw[start..start + 8])?;
        }
        let [ino, mode, uid, gid, nlink, mtime, size, dev_major, dev_minor, rdev_major, rdev_minor, name_len, _check] =
            fields;

        ensure!(
            name_len > 0,
            error::BadFieldSnafu {
                field: "namesize",
                value: "0".to_string(),
            }
        );
        let mut name = vec![0u8; name_len as usize];
        self.inner.read_exact(&mut name).context(error::IoSnafu {
            what: "read record name",
        })?;
        name.pop(); // terminating NUL
        let name = String::from_utf8(name).context(error::BadNameSnafu)?;
        self.skip(pad4(HEADER_LEN + name_len as usize))?;

        Ok(Entry {
            name,
            ino,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            size,
            dev_major,
            dev_minor,
            rdev_major,
            rdev_minor,
            link_name: None,
        })
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        let mut pad = [0u8; 3];
        self.inner
            .read_exact(&mut pad[..n])
            .context(error::IoSnafu {
                what: "read record padding",
            })
    }

    /// Collect every remaining record.
    pub fn entries(mut self) -> Result<Vec<(Entry, Vec<u8>)>> {
        let mut out = Vec::new();
        while let Some(item) = self.next_entry()? {
            out.push(item);
        }
        Ok(out)
    }
}

const FIELD_NAMES: [&str; 13] = [
    "ino", "mode", "uid", "gid", "nlink", "mtime", "filesize", "devmajor", "devminor", "rdevmajor",
    "rdevminor", "namesize", "check",
];

fn parse_hex(field: &'static str, raw: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(raw)
        .ok()
        .filter(|t| !t.is_empty())
        .context(error::BadFieldSnafu {
            field,
            value: String::from_utf8_lossy(raw).into_owned(),
        })?;
    u32::from_str_radix(text, 16).ok().context(error::BadFieldSnafu {
        field,
        value: text.to_string(),
    })
}

fn validate_path(name: &str) -> Result<()> {
    let path = std::path::Path::new(name);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    ensure!(safe, error::UnsafePathSnafu { name });
    Ok(())
}
