//! Directory layout for partitions and their data files.
//!
//! ```text
//! <data_dir>/<table>/<partition key hex>/
//!     {seq:016x}.seg            committed segments
//!     chunk_G{gen:06}.col       compacted chunks
//!     {index}_{offset:016x}.idx derived index files
//!     SNAPSHOT                  partition descriptor
//!     REPLICATION               replicated offsets
//! ```

use crate::error::{BurrowError, Result};
use crate::key::PartitionKey;
use std::fs;
use std::path::{Path, PathBuf};

/// File holding the encoded partition descriptor.
pub const DESCRIPTOR_FILE: &str = "SNAPSHOT";

/// File holding the per-replica replicated offsets.
pub const REPLICATION_FILE: &str = "REPLICATION";

const SEGMENT_SUFFIX: &str = ".seg";
const CHUNK_SUFFIX: &str = ".col";
const INDEX_SUFFIX: &str = ".idx";

/// Kind of a data file, parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataFileKind {
    /// Segment written by the commit with this first offset.
    Segment(u64),
    /// Chunk written by the compaction with this generation.
    Chunk(u32),
    /// Index file for a named index at an offset.
    Index {
        /// Index name.
        name: String,
        /// Partition offset the file was built for.
        offset: u64,
    },
}

impl DataFileKind {
    /// Builds the file name for this kind.
    ///
    /// # Examples
    /// ```rust,ignore
    /// use alopex_burrow::storage::DataFileKind;
    ///
    /// assert_eq!(DataFileKind::Chunk(3).file_name(), "chunk_G000003.col");
    /// ```
    pub fn file_name(&self) -> String {
        match self {
            Self::Segment(first_offset) => format!("{:016x}{}", first_offset, SEGMENT_SUFFIX),
            Self::Chunk(generation) => format!("chunk_G{:06}{}", generation, CHUNK_SUFFIX),
            Self::Index { name, offset } => format!("{}_{:016x}{}", name, offset, INDEX_SUFFIX),
        }
    }

    /// Parses a data file name; returns `None` for anything else.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        if let Some(hex) = name.strip_suffix(SEGMENT_SUFFIX) {
            if hex.len() != 16 {
                return None;
            }
            return u64::from_str_radix(hex, 16).ok().map(Self::Segment);
        }
        if let Some(rest) = name.strip_suffix(CHUNK_SUFFIX) {
            let generation = rest.strip_prefix("chunk_G")?;
            if generation.is_empty() || !generation.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            return generation.parse::<u32>().ok().map(Self::Chunk);
        }
        if let Some(rest) = name.strip_suffix(INDEX_SUFFIX) {
            let (index_name, hex) = rest.rsplit_once('_')?;
            if index_name.is_empty() || hex.len() != 16 {
                return None;
            }
            let offset = u64::from_str_radix(hex, 16).ok()?;
            return Some(Self::Index {
                name: index_name.to_string(),
                offset,
            });
        }
        None
    }
}

/// Rejects table names that cannot be used as a single directory name.
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table != "."
        && table != ".."
        && table
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(BurrowError::Validation(format!(
            "invalid table name {:?}",
            table
        )))
    }
}

/// Provides filesystem paths for tables and partitions.
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    data_dir: PathBuf,
}

impl PartitionLayout {
    /// Creates a layout rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the root data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the directory of a table.
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.data_dir.join(table)
    }

    /// Returns the directory of a partition.
    ///
    /// # Examples
    /// ```rust,ignore
    /// use alopex_burrow::storage::PartitionLayout;
    /// use alopex_burrow::key::Hash160;
    ///
    /// let layout = PartitionLayout::new("/data");
    /// let _dir = layout.partition_dir("events", &Hash160::digest(b"k"));
    /// ```
    pub fn partition_dir(&self, table: &str, key: &PartitionKey) -> PathBuf {
        self.table_dir(table).join(key.to_hex())
    }

    /// Lists the partitions stored for a table.
    pub fn list_partitions(&self, table: &str) -> Result<Vec<PartitionKey>> {
        let mut keys = Vec::new();
        let entries = match fs::read_dir(self.table_dir(table)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(PartitionKey::from_hex)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Lists the data files in a partition directory, sorted by kind.
    pub fn list_data_files(dir: &Path) -> Result<Vec<(DataFileKind, PathBuf)>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some(kind) = DataFileKind::parse_file_name(file_name) {
                files.push((kind, path));
            }
        }

        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Hash160;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_roundtrip() {
        let kinds = [
            DataFileKind::Segment(0x2a),
            DataFileKind::Chunk(7),
            DataFileKind::Index {
                name: "record_bloom".to_string(),
                offset: 99,
            },
        ];
        for kind in kinds {
            let name = kind.file_name();
            assert_eq!(DataFileKind::parse_file_name(&name), Some(kind));
        }
        assert_eq!(DataFileKind::Segment(1).file_name(), "0000000000000001.seg");
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        for name in [
            "SNAPSHOT",
            "0001.seg",
            "0000000000000001.seg.tmp",
            "chunk_Gx.col",
            "chunk_G.col",
            "_0000000000000001.idx",
            "bloom_01.idx",
        ] {
            assert_eq!(DataFileKind::parse_file_name(name), None, "{}", name);
        }
    }

    #[test]
    fn test_partition_dir() {
        let layout = PartitionLayout::new("/data");
        let key = Hash160::from_bytes([0xab; 20]);
        assert_eq!(
            layout.partition_dir("events", &key),
            PathBuf::from(format!("/data/events/{}", "ab".repeat(20)))
        );
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("events_v2").is_ok());
        for name in ["", ".", "..", "a/b", "a b"] {
            assert!(validate_table_name(name).is_err(), "{}", name);
        }
    }

    #[test]
    fn test_list_partitions_and_files() {
        let temp_dir = TempDir::new().unwrap();
        let layout = PartitionLayout::new(temp_dir.path());
        assert!(layout.list_partitions("events").unwrap().is_empty());

        let key = Hash160::digest(b"p1");
        let dir = layout.partition_dir("events", &key);
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(layout.table_dir("events").join("not-a-key")).unwrap();
        fs::write(dir.join(DataFileKind::Chunk(1).file_name()), b"c").unwrap();
        fs::write(dir.join(DataFileKind::Segment(5).file_name()), b"s").unwrap();
        fs::write(dir.join(DataFileKind::Segment(2).file_name()), b"s").unwrap();
        fs::write(dir.join(DESCRIPTOR_FILE), b"d").unwrap();

        assert_eq!(layout.list_partitions("events").unwrap(), vec![key]);
        let kinds: Vec<DataFileKind> = PartitionLayout::list_data_files(&dir)
            .unwrap()
            .into_iter()
            .map(|(kind, _)| kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                DataFileKind::Segment(2),
                DataFileKind::Segment(5),
                DataFileKind::Chunk(1)
            ]
        );
    }
}
