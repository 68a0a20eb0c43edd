//! Codec for the SVR4 "newc" CPIO archive format (magic `070701`), the
//! container format consumed by unikernels as an initramfs.
//!
//! The format is a flat stream of records. Each record is a 110-byte
//! ASCII-hex header, a NUL-terminated path name, and the file body,
//! with both name and body padded to four-byte boundaries. The stream
//! ends with a `TRAILER!!!` record.
//!
//! Hardlinks are encoded the way `cpio(1)` encodes them: all members of
//! a link group share an inode number and a link count greater than
//! one, and only one member carries the file body. [`Reader`] resolves
//! the group back into [`Entry::link_name`] references on the member
//! entries that carry no body.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

/// Magic bytes that open every newc header.
pub const MAGIC: &[u8; 6] = b"070701";

/// Name of the end-of-archive record.
pub const TRAILER: &str = "TRAILER!!!";

const HEADER_LEN: usize = 110;

// File type bits in the mode field, per stat(2).
const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// The file type carried in an entry's mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
    Unknown,
}

/// A single archive record. Field names follow the newc header layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    /// Path of the record relative to the archive root, e.g. `./etc/fstab`.
    pub name: String,
    pub ino: u32,
    /// Permission bits plus `S_IFMT` type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    /// Body length in bytes. Zero for directories and for hardlink
    /// members that do not carry the body.
    pub size: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    /// Symlink target, or the path of the body-carrying member for a
    /// hardlink that does not carry the body itself. Not part of the
    /// wire header; symlink targets travel as the record body.
    pub link_name: Option<String>,
}

impl Entry {
    /// A directory record. `perm` is the permission bits only.
    pub fn directory<S: Into<String>>(name: S, perm: u32) -> Self {
        Self {
            name: name.into(),
            mode: S_IFDIR | (perm & !S_IFMT),
            nlink: 2,
            ..Default::default()
        }
    }

    /// A regular file record of `size` body bytes.
    pub fn file<S: Into<String>>(name: S, perm: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            mode: S_IFREG | (perm & !S_IFMT),
            nlink: 1,
            size,
            ..Default::default()
        }
    }

    /// A symbolic link record. The target is written as the body.
    pub fn symlink<S: Into<String>, T: Into<String>>(name: S, target: T) -> Self {
        let target = target.into();
        Self {
            name: name.into(),
            mode: S_IFLNK | 0o777,
            nlink: 1,
            size: target.len() as u32,
            link_name: Some(target),
            ..Default::default()
        }
    }

    /// A hardlink member that references `primary` for its body. Shares
    /// the primary's inode and device numbers and carries no body.
    pub fn hardlink<S: Into<String>>(name: S, primary: &Entry) -> Self {
        Self {
            name: name.into(),
            ino: primary.ino,
            mode: primary.mode,
            uid: primary.uid,
            gid: primary.gid,
            nlink: primary.nlink.max(2),
            mtime: primary.mtime,
            size: 0,
            dev_major: primary.dev_major,
            dev_minor: primary.dev_minor,
            link_name: Some(primary.name.clone()),
            ..Default::default()
        }
    }

    pub fn file_type(&self) -> FileType {
        match self.mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFREG => FileType::Regular,
            S_IFLNK => FileType::Symlink,
            S_IFIFO => FileType::Fifo,
            S_IFCHR => FileType::CharDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// True for a regular record that references another member of its
    /// hardlink group instead of carrying the body.
    pub fn is_hardlink(&self) -> bool {
        self.file_type() == FileType::Regular && self.size == 0 && self.link_name.is_some()
    }

    /// Permission bits without the type bits.
    pub fn perm(&self) -> u32 {
        self.mode & !S_IFMT
    }
}

/// Padding needed to bring `len` up to a four-byte boundary.
fn pad4(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

pub type Result<T> = std::result::Result<T, error::Error>;

pub mod error {
    use snafu::Snafu;

    #[derive(Snafu, Debug)]
    #[snafu(visibility(pub(crate)))]
    pub enum Error {
        #[snafu(display("Failed to {what}: {source}"))]
        Io {
            what: &'static str,
            source: std::io::Error,
        },

        #[snafu(display("Bad archive magic '{found}', expected '070701'"))]
        BadMagic { found: String },

        #[snafu(display("Header field '{field}' is not hexadecimal: '{value}'"))]
        BadField { field: &'static str, value: String },

        #[snafu(display("Record name is not valid UTF-8"))]
        BadName { source: std::string::FromUtf8Error },

        #[snafu(display("Record '{name}' body ended after {actual} of {expected} bytes"))]
        ShortBody {
            name: String,
            expected: u64,
            actual: u64,
        },

        #[snafu(display("Refusing record with empty name"))]
        EmptyName,

        #[snafu(display("Refusing unsafe record path '{name}'"))]
        UnsafePath { name: String },

        #[snafu(display("Archive already finished"))]
        Finished,
    }
}
