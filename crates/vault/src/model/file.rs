use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::crypto::PublicKey;

/// Status flags of a file row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// The body still has to be written to the store
    pub const PENDING_WRITE: Flags = Flags(1);
    /// The body still has to be fetched to the local copy
    pub const PENDING_READ: Flags = Flags(2);
    /// Tombstone: the name was deleted at this version
    pub const DELETED: Flags = Flags(4);
    /// Encrypted with a group key
    pub const SYMMETRIC: Flags = Flags(8);
    /// Sealed to a single recipient
    pub const EC: Flags = Flags(16);
    /// Deleted version whose body is still in the store
    pub const PENDING_WIPE: Flags = Flags(32);

    /// Flags that travel in the file header. Pending states are local only.
    pub const PERSISTENT: Flags = Flags(4 | 8 | 16);

    pub fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

impl BitAnd for Flags {
    type Output = Flags;
    fn bitand(self, rhs: Self) -> Self::Output {
        Flags(self.0 & rhs.0)
    }
}

/// Local row id of a file version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub i64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One version of a logical file, or a directory
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub id: FileId,
    /// Full slash separated name, without leading slash
    pub name: String,
    pub size: u64,
    /// Bytes used in the store, header included
    pub allocated_size: u64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
    pub flags: Flags,
    pub attrs: Vec<u8>,
    /// 0 when not encrypted
    pub key_id: u64,
    pub store_dir: String,
    pub store_name: String,
    pub author: Option<PublicKey>,
    pub local_copy: Option<PathBuf>,
}

impl File {
    pub(crate) fn dir(name: String, mod_time: DateTime<Utc>) -> Self {
        File {
            id: FileId(0),
            name,
            size: 0,
            allocated_size: 0,
            mod_time,
            is_dir: true,
            flags: Flags::NONE,
            attrs: Vec::new(),
            key_id: 0,
            store_dir: String::new(),
            store_name: String::new(),
            author: None,
            local_copy: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(Flags::DELETED)
    }

    /// Last path segment of the name
    pub fn base_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Normalize a caller supplied name: no leading, trailing or repeated slashes.
pub(crate) fn clean_name(name: &str) -> String {
    name.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a clean name into parent directory and last segment.
pub(crate) fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('/') {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => ("", name),
    }
}

pub(crate) fn join_name(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// How a name addresses a file row
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FileQuery {
    /// The newest version
    Latest { dir: String, name: String },
    /// The n-th non deleted version, oldest first
    Version {
        dir: String,
        name: String,
        version: u32,
    },
    /// A row by id, written `:<hex id>`
    Id(FileId),
}

impl FileQuery {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        let name = clean_name(name);
        let (dir, base) = split_name(&name);
        match base.find(':') {
            Some(0) => i64::from_str_radix(&base[1..], 16)
                .ok()
                .map(|id| FileQuery::Id(FileId(id))),
            Some(idx) => {
                let version = base[idx + 1..].parse().ok()?;
                Some(FileQuery::Version {
                    dir: dir.to_string(),
                    name: base[..idx].to_string(),
                    version,
                })
            }
            None => Some(FileQuery::Latest {
                dir: dir.to_string(),
                name: base.to_string(),
            }),
        }
    }
}

/// Name without a `:version` suffix
pub(crate) fn strip_version(name: &str) -> &str {
    let (_, base) = split_name(name);
    match base.rfind(':') {
        Some(idx) => &name[..name.len() - base.len() + idx],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(clean_name("/docs//a.txt/"), "docs/a.txt");
        assert_eq!(split_name("docs/sub/a.txt"), ("docs/sub", "a.txt"));
        assert_eq!(split_name("a.txt"), ("", "a.txt"));
        assert_eq!(join_name("", "a"), "a");
        assert_eq!(strip_version("docs/a.txt:2"), "docs/a.txt");
        assert_eq!(strip_version("docs/a.txt"), "docs/a.txt");
    }

    #[test]
    fn test_query_parse() {
        assert_eq!(
            FileQuery::parse("docs/a.txt"),
            Some(FileQuery::Latest {
                dir: "docs".into(),
                name: "a.txt".into()
            })
        );
        assert_eq!(
            FileQuery::parse("docs/a.txt:1"),
            Some(FileQuery::Version {
                dir: "docs".into(),
                name: "a.txt".into(),
                version: 1
            })
        );
        assert_eq!(FileQuery::parse(":1f"), Some(FileQuery::Id(FileId(31))));
        assert_eq!(FileQuery::parse("a.txt:x"), None);
    }

    #[test]
    fn test_flags() {
        let mut flags = Flags::PENDING_WRITE | Flags::SYMMETRIC;
        assert!(flags.contains(Flags::PENDING_WRITE));
        flags.remove(Flags::PENDING_WRITE);
        assert_eq!(flags & Flags::PERSISTENT, Flags::SYMMETRIC);
    }
}
