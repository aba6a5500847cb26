//! Bin registry: AVL tree while binning, singly linked list afterwards
//!
//! Both phases share one arena of nodes, so a [`BinId`] handed out by
//! [`BinTree::find_or_insert`] still names the same bin after
//! [`BinTree::into_list`]. The phases are separate types:
//!
//! - [`BinTree`]: keyed lookup, `left`/`right` links, per-node height.
//! - [`BinList`]: key-ordered `next` links between bins, plus a cluster
//!   chain hanging off each bin. Every node carries a [`NodeRole`] so a
//!   `next` link is never ambiguous between "next bin" and "next cluster".
//!
//! Key lookup is gone in the list phase; bins are addressed by id.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{ClusterError, Result};

/// Stable handle to a bin in either phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinId(usize);

impl BinId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Backing resources of a bin. Absent resources are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinFiles {
    pub fastq: Option<PathBuf>,
    /// One TSV row per read, first column the query id
    pub stats: Option<PathBuf>,
    pub best_read: Option<PathBuf>,
    pub top_reads: Option<PathBuf>,
    pub consensus: Option<PathBuf>,
}

impl BinFiles {
    fn slots(&mut self) -> [&mut Option<PathBuf>; 5] {
        [
            &mut self.fastq,
            &mut self.stats,
            &mut self.best_read,
            &mut self.top_reads,
            &mut self.consensus,
        ]
    }

    /// Delete every resource that is set. Already-missing files are fine.
    pub fn remove_all(&mut self) -> Result<()> {
        for slot in self.slots() {
            if let Some(path) = slot.take() {
                remove_file_if_exists(&path)?;
            }
        }
        Ok(())
    }
}

/// Remove a file, treating "not found" as success
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClusterError::file(path, e)),
    }
}

/// Append `src` onto `dst`. A missing `src` appends nothing.
fn append_file(src: &Path, dst: &Path) -> Result<u64> {
    let input = match File::open(src) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ClusterError::file(src, e)),
    };
    let output = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dst)
        .map_err(|e| ClusterError::file(dst, e))?;

    let mut reader = BufReader::new(input);
    let mut writer = BufWriter::new(output);
    let copied = io::copy(&mut reader, &mut writer).map_err(|e| ClusterError::file(dst, e))?;
    writer.flush().map_err(|e| ClusterError::file(dst, e))?;
    Ok(copied)
}

/// Fold one absorbed resource into the kept one. Returns true when the
/// kept bin had none and took over the absorbed path instead.
fn fold_file(keep: &mut Option<PathBuf>, absorb: Option<&Path>) -> Result<bool> {
    let Some(src) = absorb else {
        return Ok(false);
    };
    match keep.as_deref() {
        Some(dst) => {
            append_file(src, dst)?;
            Ok(false)
        }
        None => {
            *keep = Some(src.to_path_buf());
            Ok(true)
        }
    }
}

/// A named group of reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    key: String,
    read_count: u64,
    pub files: BinFiles,
}

impl Bin {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            read_count: 0,
            files: BinFiles::default(),
        }
    }

    pub fn with_reads(key: impl Into<String>, read_count: u64) -> Self {
        Self {
            read_count,
            ..Self::new(key)
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn set_read_count(&mut self, read_count: u64) {
        self.read_count = read_count;
    }
}

// ============================================================================
// Tree phase
// ============================================================================

#[derive(Debug)]
struct TreeNode {
    bin: Bin,
    /// Height of the subtree rooted here (leaf = 1)
    height: u8,
    left: Option<usize>,
    right: Option<usize>,
}

/// AVL tree of bins keyed by name
#[derive(Debug, Default)]
pub struct BinTree {
    nodes: Vec<TreeNode>,
    root: Option<usize>,
}

impl BinTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: BinId) -> Option<&Bin> {
        self.nodes.get(id.0).map(|n| &n.bin)
    }

    pub fn get_mut(&mut self, id: BinId) -> Option<&mut Bin> {
        self.nodes.get_mut(id.0).map(|n| &mut n.bin)
    }

    /// Height of the tree (empty = 0)
    pub fn height(&self) -> usize {
        self.height_of(self.root) as usize
    }

    #[inline]
    fn height_of(&self, idx: Option<usize>) -> i32 {
        idx.map_or(0, |i| self.nodes[i].height as i32)
    }

    fn update_height(&mut self, idx: usize) {
        let h = 1 + self
            .height_of(self.nodes[idx].left)
            .max(self.height_of(self.nodes[idx].right));
        self.nodes[idx].height = h as u8;
    }

    /// height(right) - height(left)
    fn balance(&self, idx: usize) -> i32 {
        self.height_of(self.nodes[idx].right) - self.height_of(self.nodes[idx].left)
    }

    /// Find the bin for `key`, creating it with one read if absent,
    /// otherwise counting one more read. Duplicates never change the shape.
    pub fn find_or_insert(&mut self, key: &str) -> BinId {
        let mut path: Vec<(usize, Ordering)> = Vec::new();
        let mut cur = self.root;

        while let Some(idx) = cur {
            match key.cmp(self.nodes[idx].bin.key.as_str()) {
                Ordering::Equal => {
                    self.nodes[idx].bin.read_count += 1;
                    return BinId(idx);
                }
                Ordering::Less => {
                    path.push((idx, Ordering::Less));
                    cur = self.nodes[idx].left;
                }
                Ordering::Greater => {
                    path.push((idx, Ordering::Greater));
                    cur = self.nodes[idx].right;
                }
            }
        }

        let new = self.nodes.len();
        self.nodes.push(TreeNode {
            bin: Bin::with_reads(key, 1),
            height: 1,
            left: None,
            right: None,
        });
        self.set_child(path.last().copied(), new);

        while let Some((idx, _)) = path.pop() {
            self.update_height(idx);
            if self.balance(idx).abs() > 1 {
                let subtree = self.rebalance(idx);
                self.set_child(path.last().copied(), subtree);
                break;
            }
        }

        BinId(new)
    }

    /// Point the parent's link (or the root) at `child`
    fn set_child(&mut self, parent: Option<(usize, Ordering)>, child: usize) {
        match parent {
            None => self.root = Some(child),
            Some((p, Ordering::Less)) => self.nodes[p].left = Some(child),
            Some((p, _)) => self.nodes[p].right = Some(child),
        }
    }

    fn rotate_right(&mut self, x: usize) -> usize {
        let Some(y) = self.nodes[x].left else {
            return x;
        };
        self.nodes[x].left = self.nodes[y].right;
        self.nodes[y].right = Some(x);
        self.update_height(x);
        self.update_height(y);
        y
    }

    fn rotate_left(&mut self, x: usize) -> usize {
        let Some(y) = self.nodes[x].right else {
            return x;
        };
        self.nodes[x].right = self.nodes[y].left;
        self.nodes[y].left = Some(x);
        self.update_height(x);
        self.update_height(y);
        y
    }

    /// Restore balance at `idx`; returns the new subtree root
    fn rebalance(&mut self, idx: usize) -> usize {
        let bal = self.balance(idx);
        if bal < -1 {
            if let Some(left) = self.nodes[idx].left {
                if self.balance(left) > 0 {
                    // left-right
                    let new_left = self.rotate_left(left);
                    self.nodes[idx].left = Some(new_left);
                }
            }
            self.rotate_right(idx)
        } else if bal > 1 {
            if let Some(right) = self.nodes[idx].right {
                if self.balance(right) < 0 {
                    // right-left
                    let new_right = self.rotate_right(right);
                    self.nodes[idx].right = Some(new_right);
                }
            }
            self.rotate_left(idx)
        } else {
            idx
        }
    }

    /// Node indices in key order
    fn in_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur.is_some() || !stack.is_empty() {
            while let Some(idx) = cur {
                stack.push(idx);
                cur = self.nodes[idx].left;
            }
            if let Some(idx) = stack.pop() {
                order.push(idx);
                cur = self.nodes[idx].right;
            }
        }
        order
    }

    /// Bins in key order
    pub fn iter(&self) -> impl Iterator<Item = (BinId, &Bin)> {
        self.in_order()
            .into_iter()
            .map(move |idx| (BinId(idx), &self.nodes[idx].bin))
    }

    /// Check AVL balance, stored heights and key order at every node
    pub fn is_balanced(&self) -> bool {
        fn visit(tree: &BinTree, idx: Option<usize>) -> Option<i32> {
            let Some(i) = idx else {
                return Some(0);
            };
            let node = &tree.nodes[i];
            let lh = visit(tree, node.left)?;
            let rh = visit(tree, node.right)?;
            if (rh - lh).abs() > 1 || node.height as i32 != 1 + lh.max(rh) {
                return None;
            }
            Some(1 + lh.max(rh))
        }

        let ordered = self
            .in_order()
            .windows(2)
            .all(|w| self.nodes[w[0]].bin.key < self.nodes[w[1]].bin.key);
        ordered && visit(self, self.root).is_some()
    }

    /// Convert to the list phase. Ids stay valid; key lookup is gone.
    pub fn into_list(self) -> BinList {
        let order = self.in_order();
        let mut nodes: Vec<ListNode> = self
            .nodes
            .into_iter()
            .map(|n| ListNode {
                bin: Some(n.bin),
                role: NodeRole::Bin,
                next: None,
                clusters: None,
            })
            .collect();

        for pair in order.windows(2) {
            nodes[pair[0]].next = Some(pair[1]);
        }

        BinList {
            nodes,
            head: order.first().copied(),
        }
    }
}

// ============================================================================
// List phase
// ============================================================================

/// What a list node's `next` link means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Top-level bin; `next` is the next bin in key order
    Bin,
    /// Cluster in `parent`'s chain; `next` is the next cluster
    Cluster { parent: usize },
}

#[derive(Debug)]
struct ListNode {
    /// `None` once removed or merged away
    bin: Option<Bin>,
    role: NodeRole,
    next: Option<usize>,
    /// Head of the cluster chain (top-level bins only)
    clusters: Option<usize>,
}

/// Key-ordered singly linked list of bins with per-bin cluster chains
#[derive(Debug, Default)]
pub struct BinList {
    nodes: Vec<ListNode>,
    head: Option<usize>,
}

impl BinList {
    pub fn get(&self, id: BinId) -> Option<&Bin> {
        self.nodes.get(id.0).and_then(|n| n.bin.as_ref())
    }

    pub fn get_mut(&mut self, id: BinId) -> Option<&mut Bin> {
        self.nodes.get_mut(id.0).and_then(|n| n.bin.as_mut())
    }

    fn live(&self, id: BinId) -> Result<&ListNode> {
        match self.nodes.get(id.0) {
            Some(node) if node.bin.is_some() => Ok(node),
            _ => Err(ClusterError::StaleBin(id)),
        }
    }

    pub fn role(&self, id: BinId) -> Option<NodeRole> {
        self.live(id).ok().map(|n| n.role)
    }

    fn chain(&self, start: Option<usize>) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(start, move |&idx| self.nodes[idx].next)
    }

    /// Top-level bins in key order
    pub fn iter(&self) -> impl Iterator<Item = (BinId, &Bin)> {
        self.chain(self.head).filter_map(move |idx| {
            self.nodes[idx].bin.as_ref().map(|bin| (BinId(idx), bin))
        })
    }

    /// Snapshot of top-level ids, for loops that mutate the list
    pub fn ids(&self) -> Vec<BinId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Cluster chain of a top-level bin, oldest first
    pub fn clusters(&self, parent: BinId) -> impl Iterator<Item = (BinId, &Bin)> {
        let start = self.nodes.get(parent.0).and_then(|n| n.clusters);
        self.chain(start).filter_map(move |idx| {
            self.nodes[idx].bin.as_ref().map(|bin| (BinId(idx), bin))
        })
    }

    /// Append a cluster bin to the end of `parent`'s chain
    pub fn push_cluster(&mut self, parent: BinId, cluster: Bin) -> Result<BinId> {
        if self.live(parent)?.role != NodeRole::Bin {
            return Err(ClusterError::StaleBin(parent));
        }

        let new = self.nodes.len();
        self.nodes.push(ListNode {
            bin: Some(cluster),
            role: NodeRole::Cluster { parent: parent.0 },
            next: None,
            clusters: None,
        });

        let tail = self.chain(self.nodes[parent.0].clusters).last();
        match tail {
            Some(tail) => self.nodes[tail].next = Some(new),
            None => self.nodes[parent.0].clusters = Some(new),
        }
        Ok(BinId(new))
    }

    /// Unlink `idx` from whichever chain holds it
    fn unlink(&mut self, idx: usize) {
        let next = self.nodes[idx].next.take();
        let head = match self.nodes[idx].role {
            NodeRole::Bin => self.head,
            NodeRole::Cluster { parent } => self.nodes[parent].clusters,
        };

        if head == Some(idx) {
            match self.nodes[idx].role {
                NodeRole::Bin => self.head = next,
                NodeRole::Cluster { parent } => self.nodes[parent].clusters = next,
            }
            return;
        }

        let prev = self.chain(head).find(|&i| self.nodes[i].next == Some(idx));
        if let Some(prev) = prev {
            self.nodes[prev].next = next;
        }
    }

    /// Detach a bin, delete its backing files and return it.
    ///
    /// Removing a top-level bin also removes its cluster chain.
    pub fn remove(&mut self, id: BinId) -> Result<Bin> {
        self.live(id)?;

        if self.nodes[id.0].role == NodeRole::Bin {
            let cluster_ids: Vec<usize> = self.chain(self.nodes[id.0].clusters).collect();
            self.nodes[id.0].clusters = None;
            for idx in cluster_ids {
                self.nodes[idx].next = None;
                if let Some(mut cluster) = self.nodes[idx].bin.take() {
                    cluster.files.remove_all()?;
                }
            }
        }

        self.unlink(id.0);
        let mut bin = self.nodes[id.0]
            .bin
            .take()
            .ok_or(ClusterError::StaleBin(id))?;
        bin.files.remove_all()?;
        Ok(bin)
    }

    /// Fold `absorb` into `keep`: append its reads and stats, sum the
    /// counts, then remove `absorb` and its resources.
    ///
    /// A missing backing file on `absorb` contributes nothing. A `keep`
    /// that sits in `absorb`'s cluster chain is refused as stale.
    pub fn merge(&mut self, keep: BinId, absorb: BinId) -> Result<()> {
        if keep == absorb {
            return Ok(());
        }
        let keep_role = self.live(keep)?.role;
        self.live(absorb)?;
        // `keep` would be removed along with `absorb`'s cluster chain
        if keep_role == (NodeRole::Cluster { parent: absorb.0 }) {
            return Err(ClusterError::StaleBin(keep));
        }

        let (absorb_files, absorb_reads) = {
            let bin = self.get(absorb).ok_or(ClusterError::StaleBin(absorb))?;
            (bin.files.clone(), bin.read_count)
        };

        let keep_bin = self.get_mut(keep).ok_or(ClusterError::StaleBin(keep))?;
        let adopted_fastq = fold_file(&mut keep_bin.files.fastq, absorb_files.fastq.as_deref())?;
        let adopted_stats = fold_file(&mut keep_bin.files.stats, absorb_files.stats.as_deref())?;
        keep_bin.read_count += absorb_reads;

        // Files now owned by `keep` must survive the removal of `absorb`
        if let Some(absorbed) = self.get_mut(absorb) {
            if adopted_fastq {
                absorbed.files.fastq = None;
            }
            if adopted_stats {
                absorbed.files.stats = None;
            }
        }

        self.remove(absorb)?;
        Ok(())
    }

    /// Remove every top-level bin with fewer than `min_reads` reads
    pub fn prune(&mut self, min_reads: u64) -> Result<usize> {
        let small: Vec<BinId> = self
            .iter()
            .filter(|(_, bin)| bin.read_count < min_reads)
            .map(|(id, _)| id)
            .collect();
        for id in &small {
            self.remove(*id)?;
        }
        Ok(small.len())
    }
}
