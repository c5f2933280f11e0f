
use crate::persistence::{GraphFormatError, read_artifact, write_artifact};
use crate::reference_graph::{NodeId, ReferenceGraph};

use log::debug;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;

const INDEX_MAGIC: &[u8; 8] = b"GTINDEX\0";
/// Largest k that fits in the 2-bit packed key
pub const MAX_K: usize = 32;

/// A k-mer start inside the graph
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct GraphLocation {
    /// the node holding the first base of the k-mer
    pub node: NodeId,
    /// offset of the first base inside that node
    pub offset: usize
}

/// Options for building the index
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// k-mer length, 1..=32
    pub k: usize,
    /// maximum number of distinct paths explored from any single start base
    pub max_bubble_paths: usize
}

impl Default for IndexConfig {
    fn default() -> IndexConfig {
        IndexConfig {
            k: MAX_K,
            max_bubble_paths: 64
        }
    }
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum IndexError {
    #[error("k must be in 1..={MAX_K}, got {k}")]
    InvalidK { k: usize },
    #[error("lookup with a {found}-mer in a {expected}-mer index")]
    KmerLength { expected: usize, found: usize }
}

/// Packs an ACGT string into 2 bits per base.
/// Returns None if any base is not ACGT (case-insensitive) or the string is longer than `MAX_K`.
pub fn encode_kmer(sequence: &[u8]) -> Option<u64> {
    if sequence.len() > MAX_K {
        return None;
    }
    let mut value: u64 = 0;
    for &base in sequence.iter() {
        value = (value << 2) | encode_base(base)?;
    }
    Some(value)
}

#[inline]
fn encode_base(base: u8) -> Option<u64> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None
    }
}

/// Maps every k-mer spelled by a path through the graph to the locations where it starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphIndex {
    /// the k-mer length
    k: usize,
    /// fingerprint of the graph this index was built from
    graph_fingerprint: u64,
    /// packed k-mer -> sorted distinct start locations
    kmers: HashMap<u64, Vec<GraphLocation>>,
    /// sites where path enumeration hit `max_bubble_paths`
    low_confidence_sites: Vec<usize>
}

/// Walks forward from one start base and collects the k-mers it spells
struct KmerWalker<'a> {
    graph: &'a ReferenceGraph,
    k: usize,
    mask: u64,
    max_paths: usize,
    /// packed k-mers found from the current start
    found: Vec<u64>,
    /// sites touched from the current start
    sites: Vec<usize>,
    /// number of complete or abandoned paths so far
    paths: usize,
    truncated: bool
}

impl KmerWalker<'_> {
    fn reset(&mut self) {
        self.found.clear();
        self.sites.clear();
        self.paths = 0;
        self.truncated = false;
    }

    /// Continues a partial k-mer from `offset` in `node`.
    /// # Arguments
    /// * `node` - the node being walked
    /// * `offset` - the next base to consume in `node`
    /// * `value` - the packed bases consumed so far
    /// * `filled` - the number of bases in `value`
    fn walk(&mut self, node: NodeId, offset: usize, mut value: u64, mut filled: usize) {
        let graph_node = self.graph.node(node);
        if let Some((site, _)) = graph_node.site_allele() {
            self.sites.push(site);
        }

        for &base in graph_node.sequence()[offset..].iter() {
            match encode_base(base) {
                Some(code) => {
                    value = ((value << 2) | code) & self.mask;
                    filled += 1;
                    if filled == self.k {
                        self.found.push(value);
                        self.paths += 1;
                        return;
                    }
                },
                None => {
                    // this path cannot produce an indexable k-mer
                    self.paths += 1;
                    return;
                }
            }
        }

        let successors = graph_node.out_edges();
        if successors.is_empty() {
            // ran off the end of the graph
            self.paths += 1;
            return;
        }
        for &next in successors.iter() {
            if self.paths >= self.max_paths {
                self.truncated = true;
                return;
            }
            self.walk(next, 0, value, filled);
        }
    }
}

impl GraphIndex {
    /// Builds the index by walking every path of k bases from every base in the graph.
    /// Each start explores at most `max_bubble_paths` paths; when that bound is hit, every site touched from that start is flagged low-confidence.
    /// # Errors
    /// * if `config.k` is 0 or larger than `MAX_K`
    pub fn build(graph: &ReferenceGraph, config: &IndexConfig) -> Result<GraphIndex, IndexError> {
        let k = config.k;
        if k == 0 || k > MAX_K {
            return Err(IndexError::InvalidK { k });
        }
        let mask: u64 = if k == MAX_K { u64::MAX } else { (1_u64 << (2 * k)) - 1 };

        let mut kmers: HashMap<u64, Vec<GraphLocation>> = Default::default();
        let mut low_confidence: HashSet<usize> = Default::default();
        let mut walker = KmerWalker {
            graph,
            k,
            mask,
            max_paths: config.max_bubble_paths.max(1),
            found: vec![],
            sites: vec![],
            paths: 0,
            truncated: false
        };

        for node in 0..graph.num_nodes() {
            for offset in 0..graph.node(node).len() {
                walker.reset();
                walker.walk(node, offset, 0, 0);
                let location = GraphLocation { node, offset };
                for &value in walker.found.iter() {
                    kmers.entry(value).or_default().push(location);
                }
                if walker.truncated {
                    low_confidence.extend(walker.sites.iter().cloned());
                }
            }
        }

        for locations in kmers.values_mut() {
            locations.sort_unstable();
            locations.dedup();
        }
        let mut low_confidence_sites: Vec<usize> = low_confidence.into_iter().collect();
        low_confidence_sites.sort_unstable();

        debug!("Indexed {} distinct {}-mers, {} low-confidence sites", kmers.len(), k, low_confidence_sites.len());
        Ok(GraphIndex {
            k,
            graph_fingerprint: graph.fingerprint(),
            kmers,
            low_confidence_sites
        })
    }

    /// Returns every location where `kmer` starts.
    /// An absent k-mer, or one containing non-ACGT bases, returns an empty slice.
    /// # Errors
    /// * if `kmer` is not exactly k bases long
    pub fn lookup(&self, kmer: &[u8]) -> Result<&[GraphLocation], IndexError> {
        if kmer.len() != self.k {
            return Err(IndexError::KmerLength { expected: self.k, found: kmer.len() });
        }
        Ok(match encode_kmer(kmer) {
            Some(value) => self.lookup_encoded(value),
            None => &[]
        })
    }

    /// Same as `lookup` for an already packed k-mer
    pub fn lookup_encoded(&self, value: u64) -> &[GraphLocation] {
        self.kmers.get(&value).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn graph_fingerprint(&self) -> u64 {
        self.graph_fingerprint
    }

    /// Number of distinct k-mers
    pub fn len(&self) -> usize {
        self.kmers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kmers.is_empty()
    }

    pub fn low_confidence_sites(&self) -> &[usize] {
        &self.low_confidence_sites
    }

    /// Writes the index next to its graph.
    /// # Errors
    /// * if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<(), GraphFormatError> {
        write_artifact(path, INDEX_MAGIC, self.graph_fingerprint, self)
    }

    /// Loads an index and verifies it was built from `graph`.
    /// # Errors
    /// * if the file cannot be read or has the wrong magic or version
    /// * `GraphFormatError::VersionMismatch` if it was built from a different graph
    pub fn load(path: &Path, graph: &ReferenceGraph) -> Result<GraphIndex, GraphFormatError> {
        let (stored_fingerprint, index): (u64, GraphIndex) = read_artifact(path, INDEX_MAGIC, "index")?;
        if stored_fingerprint != index.graph_fingerprint {
            return Err(GraphFormatError::Corrupt {
                path: path.to_path_buf(),
                message: "header and body fingerprints differ".to_string()
            });
        }
        if index.graph_fingerprint != graph.fingerprint() {
            return Err(GraphFormatError::VersionMismatch {
                index_fingerprint: index.graph_fingerprint,
                graph_fingerprint: graph.fingerprint()
            });
        }
        Ok(index)
    }
}

/// Default index path for a graph file
pub fn default_index_path(graph_path: &Path) -> std::path::PathBuf {
    let mut path = graph_path.as_os_str().to_owned();
    path.push(".gti");
    path.into()
}
