//! Index Persistence
//!
//! Writes each index tree to its own append-only file on clean shutdown and
//! reads it back on the next start.
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │ Header (32 bytes)                                                  │
//! │ ┌──────────┬────────────┬───────────┬───────────┬────────────────┐ │
//! │ │Magic (4) │Version (4) │CacheSeg(4)│IndexSeg(4)│ Root Offset (8)│ │
//! │ └──────────┴────────────┴───────────┴───────────┴────────────────┘ │
//! │ Entry Count (8)                                                    │
//! ├────────────────────────────────────────────────────────────────────┤
//! │ Node frames, children before parents                               │
//! │ ┌─────────┬─────────┬─────────────────────────────┐                │
//! │ │ Len (4) │ CRC (4) │ bincode(DiskNode)           │                │
//! │ └─────────┴─────────┴─────────────────────────────┘                │
//! │ ... (inner nodes reference children by file offset)                │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The header is written last with the clean magic. Loading flips it to the
//! dirty magic before the store accepts writes, so a crash at any later point
//! forces a rebuild from the data files.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::node::{IndexEntry, IndexKey, Node, NodeId, Tree};

const CLEAN_MAGIC: u32 = 0x5349_4458;
const DIRTY_MAGIC: u32 = 0x5349_4444;
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 32;
/// Bytes of length and checksum before each node frame
const FRAME_PREFIX: u64 = 8;
/// Deeper trees than this are treated as damaged
const MAX_DEPTH: usize = 64;

/// Node layout on disk
#[derive(Debug, Serialize, Deserialize)]
enum DiskNode {
    Leaf(Vec<(IndexKey, IndexEntry)>),
    Inner {
        keys: Vec<IndexKey>,
        children: Vec<u64>,
    },
}

/// Segment counts a tree file must agree with to be usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLayout {
    pub cache_segments: u32,
    pub index_segments: u32,
}

struct Header {
    magic: u32,
    version: u32,
    layout: TreeLayout,
    root_offset: u64,
    entry_count: u64,
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.layout.cache_segments.to_le_bytes());
        buf[12..16].copy_from_slice(&self.layout.index_segments.to_le_bytes());
        buf[16..24].copy_from_slice(&self.root_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.entry_count.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE as usize]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Self {
            magic: u32_at(0),
            version: u32_at(4),
            layout: TreeLayout {
                cache_segments: u32_at(8),
                index_segments: u32_at(12),
            },
            root_offset: u64_at(16),
            entry_count: u64_at(24),
        }
    }
}

// =============================================================================
// Write
// =============================================================================

/// Write `tree` to `path`, replacing any previous content
pub fn write_tree(path: &Path, tree: &Tree, layout: TreeLayout) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);

    let mut header = Header {
        magic: DIRTY_MAGIC,
        version: FORMAT_VERSION,
        layout,
        root_offset: 0,
        entry_count: tree.len() as u64,
    };
    writer.write_all(&header.to_bytes())?;

    let mut offset = HEADER_SIZE;
    header.root_offset = write_node(&mut writer, &mut offset, tree, tree.root())?;
    writer.flush()?;

    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_data()?;

    // Header last: only a fully written tree is marked clean
    header.magic = CLEAN_MAGIC;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Post-order write; returns the offset of the frame written for `id`
fn write_node(
    writer: &mut BufWriter<File>,
    offset: &mut u64,
    tree: &Tree,
    id: NodeId,
) -> Result<u64> {
    let disk = match tree.node(id) {
        Node::Inner { keys, children } => {
            let mut child_offsets = Vec::with_capacity(children.len());
            for &child in children {
                child_offsets.push(write_node(writer, offset, tree, child)?);
            }
            DiskNode::Inner {
                keys: keys.clone(),
                children: child_offsets,
            }
        }
        Node::Leaf { entries } => DiskNode::Leaf(entries.clone()),
        Node::Free => DiskNode::Leaf(Vec::new()),
    };

    let bytes = bincode::serialize(&disk)?;
    let at = *offset;
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&crc32fast::hash(&bytes).to_le_bytes())?;
    writer.write_all(&bytes)?;
    *offset += FRAME_PREFIX + bytes.len() as u64;
    Ok(at)
}

// =============================================================================
// Read
// =============================================================================

/// Load a tree written by [`write_tree`]
///
/// Returns `Ok(None)` when the file is missing, was not closed cleanly, was
/// built for another segment layout, or is damaged. On success the file is
/// immediately marked dirty.
pub fn read_tree(path: &Path, layout: TreeLayout, capacity: usize) -> Result<Option<Tree>> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut raw = [0u8; HEADER_SIZE as usize];
    if let Err(e) = file.read_exact(&mut raw) {
        return eof_as_none(e);
    }
    let header = Header::from_bytes(&raw);
    if header.magic != CLEAN_MAGIC {
        tracing::debug!(path = %path.display(), "Index file was not closed cleanly");
        return Ok(None);
    }
    if header.version != FORMAT_VERSION || header.layout != layout {
        tracing::warn!(path = %path.display(), "Index file has a different layout");
        return Ok(None);
    }

    let file_len = file.metadata()?.len();
    let mut reader = NodeReader {
        file: &mut file,
        nodes: Vec::new(),
        visited: HashSet::new(),
    };
    let root = match reader.read(header.root_offset, file_len, 0)? {
        Some(root) => root,
        None => {
            tracing::warn!(path = %path.display(), "Index file is damaged");
            return Ok(None);
        }
    };
    let nodes = reader.nodes;
    let tree = Tree::from_parts(nodes, root, capacity);
    if tree.len() as u64 != header.entry_count {
        tracing::warn!(path = %path.display(), "Index entry count mismatch");
        return Ok(None);
    }

    // From now on a crash must lead to a rebuild
    let dirty = Header {
        magic: DIRTY_MAGIC,
        ..header
    };
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&dirty.to_bytes())?;
    file.sync_all()?;

    Ok(Some(tree))
}

/// Reads node frames back into memory
///
/// Frames are written children first, so a child frame must end before its
/// parent starts. Every offset is visited at most once.
struct NodeReader<'a> {
    file: &'a mut File,
    nodes: Vec<Node>,
    visited: HashSet<u64>,
}

impl NodeReader<'_> {
    /// Read the frame at `offset`, which must end at or before `limit`
    fn read(&mut self, offset: u64, limit: u64, depth: usize) -> Result<Option<NodeId>> {
        if depth > MAX_DEPTH || offset < HEADER_SIZE || !self.visited.insert(offset) {
            return Ok(None);
        }
        let payload_start = offset.checked_add(FRAME_PREFIX);
        let available = match payload_start.and_then(|start| limit.checked_sub(start)) {
            Some(available) => available,
            None => return Ok(None),
        };

        self.file.seek(SeekFrom::Start(offset))?;
        let mut prefix = [0u8; FRAME_PREFIX as usize];
        if let Err(e) = self.file.read_exact(&mut prefix) {
            return eof_as_none(e);
        }
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
        let crc = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if len > available {
            tracing::warn!(offset, len, "Index node overruns its frame");
            return Ok(None);
        }

        let mut bytes = vec![0u8; len as usize];
        if let Err(e) = self.file.read_exact(&mut bytes) {
            return eof_as_none(e);
        }
        if crc32fast::hash(&bytes) != crc {
            tracing::warn!(offset, "Index node checksum mismatch");
            return Ok(None);
        }

        let node = match bincode::deserialize::<DiskNode>(&bytes) {
            Ok(DiskNode::Leaf(entries)) => Node::Leaf { entries },
            Ok(DiskNode::Inner { keys, children }) => {
                if children.len() != keys.len() + 1 {
                    return Ok(None);
                }
                let mut ids = Vec::with_capacity(children.len());
                for child in children {
                    match self.read(child, offset, depth + 1)? {
                        Some(id) => ids.push(id),
                        None => return Ok(None),
                    }
                }
                Node::Inner {
                    keys,
                    children: ids,
                }
            }
            Err(e) => {
                tracing::warn!(offset, error = %e, "Index node unreadable");
                return Ok(None);
            }
        };

        self.nodes.push(node);
        Ok(Some((self.nodes.len() - 1) as NodeId))
    }
}

fn eof_as_none<T>(err: io::Error) -> Result<Option<T>> {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Ok(None)
    } else {
        Err(err.into())
    }
}
