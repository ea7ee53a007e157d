//! Attribute snapshots returned by stat and directory listing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote object type
///
/// The numeric values are stable and may be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Special = 4,
    Unknown = 5,
}

impl FileType {
    /// Stable numeric code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`FileType::code`]; anything out of range maps to `Unknown`
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => FileType::Regular,
            2 => FileType::Directory,
            3 => FileType::Symlink,
            4 => FileType::Special,
            _ => FileType::Unknown,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Regular => "file",
            FileType::Directory => "dir",
            FileType::Symlink => "link",
            FileType::Special => "special",
            FileType::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Raw stat result as reported by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub file_type: FileType,
}

impl RemoteStat {
    pub fn file(size: u64) -> Self {
        Self {
            size,
            file_type: FileType::Regular,
        }
    }

    pub fn directory() -> Self {
        Self {
            size: 0,
            file_type: FileType::Directory,
        }
    }
}

/// Immutable snapshot of a remote object taken at stat/list time
///
/// The snapshot may go stale; callers re-stat before relying on it
/// (opening a file always does).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttributes {
    /// Entry name (for stat results this is the requested path)
    pub name: String,

    /// `parent + "/" + name`, never normalised
    pub full_path: String,

    /// Size in bytes
    pub size: u64,

    pub file_type: FileType,
}

impl RemoteAttributes {
    /// Attributes for an entry found while listing `parent`
    pub fn from_listing(parent: &str, name: impl Into<String>, stat: RemoteStat) -> Self {
        let name = name.into();
        Self {
            full_path: join_remote(parent, &name),
            name,
            size: stat.size,
            file_type: stat.file_type,
        }
    }

    /// Attributes for a path that was stat'ed directly
    pub fn from_stat(path: &str, stat: RemoteStat) -> Self {
        Self {
            name: path.to_string(),
            full_path: path.to_string(),
            size: stat.size,
            file_type: stat.file_type,
        }
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::Regular
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// Build a remote path the way listings do: plain concatenation with `/`
pub fn join_remote(parent: &str, name: &str) -> String {
    format!("{}/{}", parent, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_codes_are_stable() {
        assert_eq!(FileType::Regular.code(), 1);
        assert_eq!(FileType::Directory.code(), 2);
        assert_eq!(FileType::Symlink.code(), 3);
        assert_eq!(FileType::Special.code(), 4);
        assert_eq!(FileType::Unknown.code(), 5);
        assert_eq!(FileType::from_code(2), FileType::Directory);
        assert_eq!(FileType::from_code(42), FileType::Unknown);
    }

    #[test]
    fn test_listing_paths_are_not_normalised() {
        let attrs = RemoteAttributes::from_listing("/srv/media/", "..odd name", RemoteStat::file(7));
        assert_eq!(attrs.full_path, "/srv/media//..odd name");
        assert_eq!(attrs.name, "..odd name");
        assert!(attrs.is_file());
    }

    #[test]
    fn test_stat_attributes() {
        let attrs = RemoteAttributes::from_stat("/srv/media/show", RemoteStat::directory());
        assert_eq!(attrs.name, "/srv/media/show");
        assert_eq!(attrs.full_path, "/srv/media/show");
        assert!(attrs.is_dir());
        assert_eq!(attrs.size, 0);
    }
}
