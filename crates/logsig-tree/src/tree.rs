//! Incremental blinded hash tree, one per block.
//!
//! Every leaf is paired with a blinding mask derived from the previous leaf
//! and the block IV, so a leaf's position cannot be verified without the
//! chain that led to it:
//!
//! ```text
//! mask  = H(last_leaf ‖ IV)
//! leaf  = H(data)
//! node  = H(mask ‖ leaf ‖ 1)      ordinary record
//! node  = H(leaf ‖ mask ‖ 1)      metadata record
//! ```
//!
//! Each level-1 node becomes the new `last_leaf`, and it is merged into a
//! forest of partial roots (at most one per level) the way a binary counter
//! carries. Finishing a block folds the forest into a single root.
//!
//! ```text
//! records:  r0  r1  r2  r3          forest after each leaf
//!            \  /    \  /           1 leaf:  [n0]
//!             m01     m23           2:       [  , m01]
//!               \    /              3:       [n2, m01]
//!                root (level 3)     4:       [  ,    , root]
//! ```

use std::{io::Write, time::SystemTime};

use logsig_core::{hash_node, tlv::tags, HashAlgorithm, Imprint};

use crate::{
    entropy::EntropySource,
    error::{Result, TreeError},
    metadata, record,
};

/// Smallest block level limit accepted.
pub const MIN_LEVEL_LIMIT: u8 = 2;

/// Largest block level limit accepted.
pub const MAX_LEVEL_LIMIT: u8 = 32;

/// Number of forest slots, one per tree level below the block root.
pub const MAX_TREE_HEIGHT: usize = MAX_LEVEL_LIMIT as usize;

/// Kind of leaf added to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// Ordinary log record.
    Record,
    /// Metadata record, hashed with the mask on the right.
    Metadata,
}

/// Hashing and retention options of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    /// Algorithm for leaves, masks and nodes.
    pub algorithm: HashAlgorithm,
    /// Write every record hash to the block file.
    pub keep_record_hashes: bool,
    /// Write every tree node to the block file.
    pub keep_tree_hashes: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self { algorithm: HashAlgorithm::Sha256, keep_record_hashes: true, keep_tree_hashes: false }
    }
}

/// Root of a finished block, ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedBlock {
    /// Tree root.
    pub root: Imprint,
    /// Number of leaves, metadata included.
    pub record_count: u64,
    /// Height of the aggregation request, counting masks as leaves.
    pub level: u8,
}

/// Records per block for a level limit.
pub fn block_size(level_limit: u8) -> u64 {
    1u64 << (level_limit.saturating_sub(1))
}

/// Tree height for a block of `record_count` leaves: `ceil(log2(2n))`.
///
/// Every leaf has a blinding mask as its sibling, hence the doubling.
pub fn signature_level(record_count: u64) -> u8 {
    if record_count == 0 {
        return 0;
    }
    let leaves = record_count.saturating_mul(2);
    // at most 64
    (u64::BITS - (leaves - 1).leading_zeros()) as u8
}

/// Validates a block level limit.
pub fn check_level_limit(level: u8) -> Result<()> {
    if (MIN_LEVEL_LIMIT..=MAX_LEVEL_LIMIT).contains(&level) {
        Ok(())
    } else {
        Err(TreeError::LevelOutOfRange { level, min: MIN_LEVEL_LIMIT, max: MAX_LEVEL_LIMIT })
    }
}

fn node_level(slot: usize) -> u8 {
    // slot < MAX_TREE_HEIGHT, so this stays below 34
    (slot + 2) as u8
}

#[derive(Debug)]
struct OpenBlock {
    iv: Vec<u8>,
    record_count: u64,
    size_limit: u64,
    started: SystemTime,
    forest: [Option<Imprint>; MAX_TREE_HEIGHT],
}

/// Block tree of one log stream.
///
/// Owns the chain hash (`last_leaf`) and at most one open block. Artifact
/// output goes to the writer passed to each call, so the same tree can write
/// into a file, a buffer, or a sink that discards everything.
#[derive(Debug)]
pub struct BlockTree {
    options: TreeOptions,
    last_leaf: Imprint,
    block: Option<OpenBlock>,
}

impl BlockTree {
    /// Creates a tree continuing the chain from `last_leaf`.
    pub fn new(options: TreeOptions, last_leaf: Imprint) -> Self {
        Self { options, last_leaf, block: None }
    }

    /// Hashing and retention options.
    pub fn options(&self) -> TreeOptions {
        self.options
    }

    /// Current chain hash: the most recent level-1 node.
    pub fn last_leaf(&self) -> &Imprint {
        &self.last_leaf
    }

    /// Whether a block is open.
    pub fn is_open(&self) -> bool {
        self.block.is_some()
    }

    /// Leaves in the open block, zero when none is open.
    pub fn record_count(&self) -> u64 {
        self.block.as_ref().map_or(0, |b| b.record_count)
    }

    /// Whether the open block reached its size limit.
    pub fn is_full(&self) -> bool {
        self.block.as_ref().is_some_and(|b| b.record_count >= b.size_limit)
    }

    /// Start time of the open block.
    pub fn block_started(&self) -> Option<SystemTime> {
        self.block.as_ref().map(|b| b.started)
    }

    /// IV of the open block.
    pub fn iv(&self) -> Option<&[u8]> {
        self.block.as_ref().map(|b| b.iv.as_slice())
    }

    /// Bitmask of occupied forest slots, bit `i` for slot `i`.
    pub fn occupied_levels(&self) -> u64 {
        self.block.as_ref().map_or(0, |b| {
            b.forest
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.is_some())
                .fold(0u64, |mask, (i, _)| mask | (1 << i))
        })
    }

    /// Opens a new block with a fresh IV drawn from `entropy`.
    ///
    /// The block holds `2^(level_limit - 1)` records.
    pub fn start_block(
        &mut self,
        entropy: &dyn EntropySource,
        started: SystemTime,
        level_limit: u8,
    ) -> Result<()> {
        if self.block.is_some() {
            return Err(TreeError::BlockAlreadyOpen);
        }
        check_level_limit(level_limit)?;

        let mut iv = vec![0u8; self.options.algorithm.digest_len()];
        entropy.fill(&mut iv)?;

        self.block = Some(OpenBlock {
            iv,
            record_count: 0,
            size_limit: block_size(level_limit),
            started,
            forest: std::array::from_fn(|_| None),
        });
        Ok(())
    }

    /// Adds a leaf, writing the block header first if this is the first leaf.
    ///
    /// All output for the leaf is written in one call before any state
    /// changes, so a failed write leaves the tree as it was.
    pub fn add_leaf<W: Write>(&mut self, out: &mut W, data: &[u8], kind: LeafKind) -> Result<()> {
        let options = self.options;
        let algorithm = options.algorithm;
        let block = self.block.as_mut().ok_or(TreeError::NoOpenBlock)?;
        if block.record_count >= block.size_limit {
            return Err(TreeError::BlockFull { limit: block.size_limit });
        }

        let mask = {
            let mut input = Vec::with_capacity(self.last_leaf.len() + block.iv.len());
            input.extend_from_slice(self.last_leaf.as_bytes());
            input.extend_from_slice(&block.iv);
            algorithm.digest(&input)
        };
        let leaf = algorithm.digest(data);

        let mut pending = Vec::new();
        if block.record_count == 0 {
            pending.extend(record::block_header(algorithm, &block.iv, &self.last_leaf)?);
        }
        if kind == LeafKind::Metadata {
            pending.extend_from_slice(data);
        }
        if options.keep_record_hashes {
            pending.extend(record::hash_record(tags::RECORD_HASH, &leaf)?);
        }

        let node = match kind {
            LeafKind::Record => hash_node(algorithm, &mask, &leaf, 1),
            LeafKind::Metadata => hash_node(algorithm, &leaf, &mask, 1),
        };
        if options.keep_tree_hashes {
            pending.extend(record::hash_record(tags::TREE_HASH, &node)?);
        }

        let mut carry = node.clone();
        let mut slot = 0;
        while let Some(Some(left)) = block.forest.get(slot) {
            carry = hash_node(algorithm, left, &carry, node_level(slot));
            if options.keep_tree_hashes {
                pending.extend(record::hash_record(tags::TREE_HASH, &carry)?);
            }
            slot += 1;
        }
        if slot >= MAX_TREE_HEIGHT {
            return Err(TreeError::BlockFull { limit: block.size_limit });
        }

        out.write_all(&pending)?;

        block.forest[..slot].iter_mut().for_each(|s| *s = None);
        block.forest[slot] = Some(carry);
        block.record_count += 1;
        self.last_leaf = node;
        Ok(())
    }

    /// Adds a metadata record indexed at the current record count.
    pub fn add_metadata<W: Write>(&mut self, out: &mut W, key: &str, value: &str) -> Result<()> {
        let encoded = metadata::encode(self.record_count(), key, value)?;
        self.add_leaf(out, &encoded, LeafKind::Metadata)
    }

    /// Closes the open block and folds its forest into the root.
    ///
    /// Returns `None` for an empty block: nothing is signed and the chain
    /// does not advance.
    pub fn finish_block<W: Write>(&mut self, out: &mut W) -> Result<Option<FinishedBlock>> {
        let options = self.options;
        let block = self.block.as_ref().ok_or(TreeError::NoOpenBlock)?;

        let mut pending = Vec::new();
        let mut root: Option<Imprint> = None;
        for (slot, node) in block.forest.iter().enumerate() {
            let Some(node) = node else { continue };
            root = Some(match root {
                None => node.clone(),
                Some(acc) => {
                    let merged = hash_node(options.algorithm, node, &acc, node_level(slot));
                    if options.keep_tree_hashes {
                        pending.extend(record::hash_record(tags::TREE_HASH, &merged)?);
                    }
                    merged
                },
            });
        }

        out.write_all(&pending)?;

        let record_count = block.record_count;
        self.block = None;
        Ok(root.map(|root| FinishedBlock { root, record_count, level: signature_level(record_count) }))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[derive(Debug)]
    struct PatternEntropy(u8);

    impl EntropySource for PatternEntropy {
        fn fill(&self, buf: &mut [u8]) -> Result<()> {
            buf.iter_mut().enumerate().for_each(|(i, b)| *b = self.0.wrapping_add(i as u8));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct NoEntropy;

    impl EntropySource for NoEntropy {
        fn fill(&self, _buf: &mut [u8]) -> Result<()> {
            Err(TreeError::entropy("exhausted"))
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn open_tree(level_limit: u8) -> BlockTree {
        let mut tree =
            BlockTree::new(TreeOptions::default(), Imprint::zero(HashAlgorithm::Sha256));
        tree.start_block(&PatternEntropy(0), SystemTime::UNIX_EPOCH, level_limit).unwrap();
        tree
    }

    #[test]
    fn levels_follow_leaf_count() {
        assert_eq!(signature_level(0), 0);
        assert_eq!(signature_level(1), 1);
        assert_eq!(signature_level(2), 2);
        assert_eq!(signature_level(3), 3);
        assert_eq!(signature_level(4), 3);
        assert_eq!(signature_level(5), 4);
        assert_eq!(signature_level(128), 8);
    }

    #[test]
    fn block_size_doubles_per_level() {
        assert_eq!(block_size(2), 2);
        assert_eq!(block_size(3), 4);
        assert_eq!(block_size(8), 128);
        assert_eq!(block_size(32), 1 << 31);
    }

    #[test]
    fn level_limits_outside_range_are_rejected() {
        let mut tree =
            BlockTree::new(TreeOptions::default(), Imprint::zero(HashAlgorithm::Sha256));
        for level in [0, 1, 33, 64] {
            let err = tree.start_block(&PatternEntropy(0), SystemTime::UNIX_EPOCH, level);
            assert!(matches!(err, Err(TreeError::LevelOutOfRange { .. })));
        }
        assert!(!tree.is_open());
    }

    #[test]
    fn header_written_only_for_first_leaf() {
        let mut tree = open_tree(8);
        let mut out = Vec::new();

        tree.add_leaf(&mut out, b"r0", LeafKind::Record).unwrap();
        let first_len = out.len();
        tree.add_leaf(&mut out, b"r1", LeafKind::Record).unwrap();

        // header (76) + record hash (37), then only a record hash
        assert_eq!(first_len, 76 + 37);
        assert_eq!(out.len() - first_len, 37);
        assert_eq!(&out[..2], &[0x89, 0x01]);
    }

    #[test]
    fn record_hashes_can_be_omitted() {
        let options = TreeOptions { keep_record_hashes: false, ..TreeOptions::default() };
        let mut tree = BlockTree::new(options, Imprint::zero(HashAlgorithm::Sha256));
        tree.start_block(&PatternEntropy(0), SystemTime::UNIX_EPOCH, 8).unwrap();

        let mut out = Vec::new();
        tree.add_leaf(&mut out, b"r0", LeafKind::Record).unwrap();
        tree.add_leaf(&mut out, b"r1", LeafKind::Record).unwrap();
        assert_eq!(out.len(), 76);
    }

    #[test]
    fn tree_hashes_include_every_merge() {
        let options = TreeOptions {
            keep_record_hashes: false,
            keep_tree_hashes: true,
            ..TreeOptions::default()
        };
        let mut tree = BlockTree::new(options, Imprint::zero(HashAlgorithm::Sha256));
        tree.start_block(&PatternEntropy(0), SystemTime::UNIX_EPOCH, 8).unwrap();

        let mut out = Vec::new();
        for data in [b"r0", b"r1", b"r2"] {
            tree.add_leaf(&mut out, data, LeafKind::Record).unwrap();
        }
        // three leaf nodes plus one merge
        assert_eq!(out.len(), 76 + 4 * 37);

        out.clear();
        tree.finish_block(&mut out).unwrap();
        // one fold of slot 1 with slot 0
        assert_eq!(out.len(), 37);
    }

    #[test]
    fn metadata_is_written_verbatim() {
        let mut tree = open_tree(8);
        let mut out = Vec::new();
        tree.add_leaf(&mut out, b"r0", LeafKind::Record).unwrap();

        let before = out.len();
        tree.add_metadata(&mut out, "key", "value").unwrap();

        let encoded = metadata::encode(1, "key", "value").unwrap();
        assert_eq!(&out[before..before + encoded.len()], encoded.as_slice());
        assert_eq!(tree.record_count(), 2);
    }

    #[test]
    fn chain_hash_is_last_level_one_node() {
        let mut tree = open_tree(8);
        let mut out = Vec::new();
        let seed = tree.last_leaf().clone();
        let iv = tree.iv().unwrap().to_vec();

        tree.add_leaf(&mut out, b"r0", LeafKind::Record).unwrap();

        let mut mask_input = seed.as_bytes().to_vec();
        mask_input.extend_from_slice(&iv);
        let mask = HashAlgorithm::Sha256.digest(&mask_input);
        let leaf = HashAlgorithm::Sha256.digest(b"r0");
        let expected = hash_node(HashAlgorithm::Sha256, &mask, &leaf, 1);
        assert_eq!(tree.last_leaf(), &expected);
    }

    #[test]
    fn full_block_rejects_more_leaves() {
        let mut tree = open_tree(2);
        let mut out = Vec::new();
        tree.add_leaf(&mut out, b"a", LeafKind::Record).unwrap();
        assert!(!tree.is_full());
        tree.add_leaf(&mut out, b"b", LeafKind::Record).unwrap();
        assert!(tree.is_full());

        let err = tree.add_leaf(&mut out, b"c", LeafKind::Record);
        assert!(matches!(err, Err(TreeError::BlockFull { limit: 2 })));
    }

    #[test]
    fn failed_write_leaves_tree_unchanged() {
        let mut tree = open_tree(8);
        let seed = tree.last_leaf().clone();

        assert!(tree.add_leaf(&mut FailingWriter, b"r0", LeafKind::Record).is_err());
        assert_eq!(tree.record_count(), 0);
        assert_eq!(tree.last_leaf(), &seed);
        assert_eq!(tree.occupied_levels(), 0);

        let mut out = Vec::new();
        tree.add_leaf(&mut out, b"r0", LeafKind::Record).unwrap();
        assert_eq!(&out[..2], &[0x89, 0x01]);
    }

    #[test]
    fn empty_block_finishes_without_root() {
        let mut tree = open_tree(8);
        let seed = tree.last_leaf().clone();

        assert_eq!(tree.finish_block(&mut io::sink()).unwrap(), None);
        assert!(!tree.is_open());
        assert_eq!(tree.last_leaf(), &seed);
    }

    #[test]
    fn operations_require_an_open_block() {
        let mut tree =
            BlockTree::new(TreeOptions::default(), Imprint::zero(HashAlgorithm::Sha256));

        assert!(matches!(
            tree.add_leaf(&mut io::sink(), b"r0", LeafKind::Record),
            Err(TreeError::NoOpenBlock)
        ));
        assert!(matches!(tree.finish_block(&mut io::sink()), Err(TreeError::NoOpenBlock)));

        tree.start_block(&PatternEntropy(0), SystemTime::UNIX_EPOCH, 8).unwrap();
        assert!(matches!(
            tree.start_block(&PatternEntropy(0), SystemTime::UNIX_EPOCH, 8),
            Err(TreeError::BlockAlreadyOpen)
        ));
    }

    #[test]
    fn entropy_failure_leaves_no_block_open() {
        let mut tree =
            BlockTree::new(TreeOptions::default(), Imprint::zero(HashAlgorithm::Sha256));

        let err = tree.start_block(&NoEntropy, SystemTime::UNIX_EPOCH, 8).unwrap_err();
        assert!(err.disables_stream());
        assert!(!tree.is_open());
    }

    #[test]
    fn iv_length_follows_algorithm() {
        let options = TreeOptions { algorithm: HashAlgorithm::Sha512, ..TreeOptions::default() };
        let mut tree = BlockTree::new(options, Imprint::zero(HashAlgorithm::Sha512));
        tree.start_block(&PatternEntropy(3), SystemTime::UNIX_EPOCH, 8).unwrap();

        assert_eq!(tree.iv().unwrap().len(), 64);
        assert_eq!(tree.iv().unwrap()[0], 3);
    }
}
