//! Where fetched metadata goes once a session SHA-1-verifies it. Grounded
//! on `original_source/crawler_file.py`'s `TorrentCrawlerFile`.

use krpc_encoding::InfoHash;
use std::fs;
use std::path::PathBuf;

/// Destination for SHA-1-verified `info` dictionaries. The orchestrator
/// consults `exists` before starting a fetch and calls `save` once one
/// completes; both are synchronous since a sink backed by a filesystem or
/// a local document store does not need to yield the executor, and a
/// network-backed sink can wrap these in `spawn_blocking` itself.
pub trait Sink: Send + Sync {
    fn exists(&self, info_hash: &InfoHash) -> bool;
    fn save(&self, info_hash: &InfoHash, info_dict: &[u8]) -> std::io::Result<()>;
}

/// Writes each metadata dict, bencoded, to `<dir>/<hex info_hash>`.
/// Presence of that file is the `exists` check -- no index, no database.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<FileSink> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileSink { dir })
    }

    fn path_for(&self, info_hash: &InfoHash) -> PathBuf {
        self.dir.join(info_hash.to_string())
    }
}

impl Sink for FileSink {
    fn exists(&self, info_hash: &InfoHash) -> bool {
        self.path_for(info_hash).exists()
    }

    fn save(&self, info_hash: &InfoHash, info_dict: &[u8]) -> std::io::Result<()> {
        fs::write(self.path_for(info_hash), info_dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::NodeID;

    #[test]
    fn save_then_exists_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path()).unwrap();
        let info_hash = NodeID::random();

        assert!(!sink.exists(&info_hash));
        sink.save(&info_hash, b"d4:infod4:name4:testee").unwrap();
        assert!(sink.exists(&info_hash));
    }

    #[test]
    fn save_writes_the_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path()).unwrap();
        let info_hash = NodeID::random();

        sink.save(&info_hash, b"hello").unwrap();
        let contents = fs::read(dir.path().join(info_hash.to_string())).unwrap();
        assert_eq!(contents, b"hello");
    }
}
