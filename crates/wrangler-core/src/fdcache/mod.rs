//! Bounded LRU of append-mode file handles (§4.5), used to land IOData
//! messages without exhausting the process's open-file limit.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum FdCacheError {
    #[error("configured cache size {configured} exceeds soft NOFILE rlimit {rlimit}")]
    SizeExceedsRlimit { configured: usize, rlimit: usize },
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create parent directory for {path}: {source}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct Node {
    path: PathBuf,
    file: File,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A bounded LRU cache of open file handles, keyed by path. Implemented as a
/// slab plus explicit head/tail indices rather than intrusive pointers, to
/// stay within safe Rust while preserving the same eviction order.
pub struct FdCache {
    maxsize: usize,
    by_path: HashMap<PathBuf, usize>,
    slab: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    hits: u64,
    misses: u64,
}

impl FdCache {
    /// Construct a cache with the given capacity, or the default sizing
    /// formula when `configured` is 0: `min(soft-NOFILE-rlimit - 64, 256)`,
    /// never less than 1. Refuses to start if `configured` exceeds the soft
    /// rlimit.
    pub fn new(configured: usize) -> Result<Self, FdCacheError> {
        let rlimit = soft_nofile_rlimit();

        let maxsize = if configured == 0 {
            let candidate = rlimit.saturating_sub(64).min(256);
            candidate.max(1)
        } else {
            if configured > rlimit {
                return Err(FdCacheError::SizeExceedsRlimit {
                    configured,
                    rlimit,
                });
            }
            configured
        };

        Ok(FdCache {
            maxsize,
            by_path: HashMap::new(),
            slab: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
            hits: 0,
            misses: 0,
        })
    }

    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Append `bytes` to `path`, opening (and creating parent directories
    /// for) the file on first use or after eviction. Moves the entry to the
    /// head of the LRU.
    pub fn write(&mut self, path: &Path, bytes: &[u8]) -> Result<(), FdCacheError> {
        let idx = if let Some(&idx) = self.by_path.get(path) {
            self.hits += 1;
            self.move_to_head(idx);
            idx
        } else {
            self.misses += 1;
            self.open_and_insert(path)?
        };

        let node = self.slab[idx].as_mut().expect("slab entry missing");
        node.file.write_all(bytes).map_err(|source| FdCacheError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        trace!(path = %path.display(), bytes = bytes.len(), "fdcache write");
        Ok(())
    }

    fn open_and_insert(&mut self, path: &Path) -> Result<usize, FdCacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| FdCacheError::Mkdir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| FdCacheError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        if self.by_path.len() >= self.maxsize {
            self.evict_tail();
        }

        let idx = self.alloc_slot(Node {
            path: path.to_path_buf(),
            file,
            prev: None,
            next: None,
        });
        self.by_path.insert(path.to_path_buf(), idx);
        self.push_front(idx);
        debug!(path = %path.display(), "fdcache open");
        Ok(idx)
    }

    fn alloc_slot(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free_slots.pop() {
            self.slab[idx] = Some(node);
            idx
        } else {
            self.slab.push(Some(node));
            self.slab.len() - 1
        }
    }

    fn evict_tail(&mut self) {
        let Some(tail_idx) = self.tail else { return };
        self.unlink(tail_idx);
        let node = self.slab[tail_idx].take().expect("tail slab entry missing");
        self.by_path.remove(&node.path);
        self.free_slots.push(tail_idx);
        debug!(path = %node.path.display(), "fdcache evict");
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slab[idx].as_ref().expect("unlink missing node");
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slab[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        let node = self.slab[idx].as_mut().expect("unlink missing node");
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.slab[idx].as_mut().expect("push_front missing node");
            node.next = old_head;
            node.prev = None;
        }
        if let Some(h) = old_head {
            self.slab[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }
}

#[cfg(unix)]
fn soft_nofile_rlimit() -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rl` is a valid, fully-initialized `libc::rlimit` and
    // `RLIMIT_NOFILE` is a well-known resource kind; the call cannot write
    // outside `rl`.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
    if rc != 0 {
        return 256;
    }
    rl.rlim_cur as usize
}

#[cfg(not(unix))]
fn soft_nofile_rlimit() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::new(2).unwrap();

        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");

        cache.write(&a, b"first").unwrap();
        cache.write(&b, b"second").unwrap();
        cache.write(&a, b"+third").unwrap();
        cache.write(&c, b"fourth").unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.by_path.contains_key(&b));
        assert!(cache.by_path.contains_key(&a));
        assert!(cache.by_path.contains_key(&c));

        assert_eq!(std::fs::read_to_string(&a).unwrap(), "first+third");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "second");
        assert_eq!(std::fs::read_to_string(&c).unwrap(), "fourth");
    }

    #[test]
    fn reopen_after_eviction_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::new(1).unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");

        cache.write(&a, b"one").unwrap();
        cache.write(&b, b"two").unwrap();
        cache.write(&a, b"-more").unwrap();

        assert_eq!(std::fs::read_to_string(&a).unwrap(), "one-more");
    }

    #[test]
    fn hits_and_misses_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::new(4).unwrap();
        let a = dir.path().join("a");
        cache.write(&a, b"x").unwrap();
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
        cache.write(&a, b"y").unwrap();
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn configured_size_above_rlimit_is_rejected() {
        let huge = usize::MAX / 2;
        assert!(matches!(
            FdCache::new(huge),
            Err(FdCacheError::SizeExceedsRlimit { .. })
        ));
    }

    #[test]
    fn default_sizing_is_never_less_than_one() {
        let cache = FdCache::new(0).unwrap();
        assert!(cache.maxsize() >= 1);
    }

    #[test]
    fn creates_intermediate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::new(4).unwrap();
        let nested = dir.path().join("nested/deep/path/file.out");
        cache.write(&nested, b"hi").unwrap();
        assert_eq!(std::fs::read_to_string(&nested).unwrap(), "hi");
    }
}
