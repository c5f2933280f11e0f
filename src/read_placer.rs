
use crate::data_types::reference_genome::AbsolutePosition;
use crate::graph_index::{GraphIndex, GraphLocation, encode_kmer};
use crate::reference_graph::{NodeId, NodeKind, ReferenceGraph};

use log::trace;
use rustc_hash::FxHashSet as HashSet;
use std::cmp::Ordering;

/// Options for seeding and extending reads
#[derive(Clone, Debug)]
pub struct PlacementConfig {
    /// distance between seed starts along the read; 0 means one seed every k bases
    pub seed_step: usize,
    /// maximum edits (substitutions, insertions, deletions, clipped bases) in one alignment
    pub max_edits: usize,
    /// minimum fraction of read bases that must match
    pub min_identity: f64,
    /// seeds with more locations than this are treated as repeats and skipped
    pub max_seed_locations: usize,
    /// cap on search states for one extension
    pub max_extension_states: usize
}

impl Default for PlacementConfig {
    fn default() -> PlacementConfig {
        PlacementConfig {
            seed_step: 0,
            max_edits: 8,
            min_identity: 0.9,
            max_seed_locations: 64,
            max_extension_states: 10_000
        }
    }
}

/// A read aligned along a path through the graph.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GraphAlignment {
    /// nodes visited in order, including empty nodes
    nodes: Vec<NodeId>,
    /// offset of the first aligned base in the first node
    start_offset: usize,
    /// offset one past the last aligned base in the last node
    end_offset: usize,
    /// total edits, clipped bases included
    edits: usize,
    /// length of the read
    read_len: usize,
    /// absolute position of the first aligned base
    abs_start: AbsolutePosition,
    /// number of alternate nodes on the path
    alternate_nodes: usize
}

impl GraphAlignment {
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn end_offset(&self) -> usize {
        self.end_offset
    }

    pub fn edits(&self) -> usize {
        self.edits
    }

    pub fn abs_start(&self) -> AbsolutePosition {
        self.abs_start
    }

    pub fn alternate_nodes(&self) -> usize {
        self.alternate_nodes
    }

    /// Read bases that are not edits
    pub fn score(&self) -> usize {
        self.read_len.saturating_sub(self.edits)
    }

    /// Fraction of read bases that are not edits
    pub fn identity(&self) -> f64 {
        if self.read_len == 0 {
            0.0
        } else {
            self.score() as f64 / self.read_len as f64
        }
    }

    /// Ordering used to pick the best alignment: higher score, then fewer alternate nodes, then earliest position.
    fn preference(&self, other: &GraphAlignment) -> Ordering {
        other.score().cmp(&self.score())
            .then(self.alternate_nodes.cmp(&other.alternate_nodes))
            .then(self.abs_start.cmp(&other.abs_start))
            .then(self.nodes.cmp(&other.nodes))
    }

    /// Returns the (site, allele) pairs this alignment supports.
    /// An allele node only counts if the read covers it completely; empty allele nodes (deletions, insertion REF) only count when they are strictly inside the path.
    pub fn allele_support(&self, graph: &ReferenceGraph) -> Vec<(usize, usize)> {
        let last = self.nodes.len().saturating_sub(1);
        let mut support: Vec<(usize, usize)> = vec![];
        for (i, &node_id) in self.nodes.iter().enumerate() {
            let node = graph.node(node_id);
            let Some(site_allele) = node.site_allele() else {
                continue;
            };
            let covers_start = i > 0 || self.start_offset == 0;
            let covers_end = i < last || self.end_offset == node.len();
            let interior = i > 0 && i < last;
            if covers_start && covers_end && (interior || !node.is_empty()) {
                support.push(site_allele);
            }
        }
        support
    }
}

/// Result of extending in one direction from an anchor
#[derive(Clone, Debug)]
struct Extension {
    edits: usize,
    /// nodes entered after the anchor node, in walk order
    path: Vec<NodeId>,
    /// final position in the last node; forward: exclusive end, backward: inclusive start
    position: usize
}

/// Bounded depth-first extension of a read along the graph in one direction.
/// Exact runs are consumed greedily; mismatches branch into substitution, insertion, and deletion.
struct Extender<'a> {
    graph: &'a ReferenceGraph,
    /// read bases in walk order, reversed for backward extension
    read: Vec<u8>,
    forward: bool,
    max_edits: usize,
    states_left: usize,
    path: Vec<NodeId>,
    best: Option<Extension>
}

impl Extender<'_> {
    fn has_next(&self, node: NodeId, position: usize) -> bool {
        if self.forward {
            position < self.graph.node(node).len()
        } else {
            position > 0
        }
    }

    fn next_base(&self, node: NodeId, position: usize) -> u8 {
        let sequence = self.graph.node(node).sequence();
        if self.forward {
            sequence[position]
        } else {
            sequence[position - 1]
        }
    }

    fn advance(&self, position: usize) -> usize {
        if self.forward { position + 1 } else { position - 1 }
    }

    fn record(&mut self, edits: usize, position: usize) {
        let improves = match self.best.as_ref() {
            Some(best) => edits < best.edits,
            None => true
        };
        if improves {
            self.best = Some(Extension {
                edits,
                path: self.path.clone(),
                position
            });
        }
    }

    fn extend(&mut self, node: NodeId, mut position: usize, mut read_index: usize, edits: usize) {
        if self.states_left == 0 {
            return;
        }
        self.states_left -= 1;
        if let Some(best) = self.best.as_ref() {
            if edits >= best.edits {
                return;
            }
        }

        while read_index < self.read.len() && self.has_next(node, position) &&
            self.next_base(node, position).eq_ignore_ascii_case(&self.read[read_index]) {
            position = self.advance(position);
            read_index += 1;
        }
        if read_index == self.read.len() {
            self.record(edits, position);
            return;
        }

        if self.has_next(node, position) {
            if edits < self.max_edits {
                let next = self.advance(position);
                // substitution
                self.extend(node, next, read_index + 1, edits + 1);
                // base only in the read
                self.extend(node, position, read_index + 1, edits + 1);
                // base only in the graph
                self.extend(node, next, read_index, edits + 1);
            }
            return;
        }

        let neighbours: Vec<NodeId> = if self.forward {
            self.graph.node(node).out_edges().to_vec()
        } else {
            self.graph.node(node).in_edges().to_vec()
        };
        if neighbours.is_empty() {
            // the rest of the read hangs off the graph and is clipped
            let clipped = edits + (self.read.len() - read_index);
            if clipped <= self.max_edits {
                self.record(clipped, position);
            }
            return;
        }
        for n in neighbours.into_iter() {
            let entry = if self.forward { 0 } else { self.graph.node(n).len() };
            self.path.push(n);
            self.extend(n, entry, read_index, edits);
            self.path.pop();
        }
    }
}

/// Places reads on one graph using its index.
pub struct ReadPlacer<'a> {
    graph: &'a ReferenceGraph,
    index: &'a GraphIndex,
    config: PlacementConfig
}

impl<'a> ReadPlacer<'a> {
    /// Creates a new placer.
    /// # Arguments
    /// * `graph` - the graph to place on
    /// * `index` - the k-mer index built from `graph`
    /// * `config` - seeding and extension options
    pub fn new(graph: &'a ReferenceGraph, index: &'a GraphIndex, config: PlacementConfig) -> ReadPlacer<'a> {
        ReadPlacer {
            graph,
            index,
            config
        }
    }

    /// Read offsets where seeds are taken, always including the last full window
    fn seed_offsets(&self, read_len: usize) -> Vec<usize> {
        let k = self.index.k();
        if read_len < k {
            return vec![];
        }
        let step = if self.config.seed_step == 0 { k } else { self.config.seed_step };
        let mut offsets: Vec<usize> = (0..=(read_len - k)).step_by(step).collect();
        if offsets.last() != Some(&(read_len - k)) {
            offsets.push(read_len - k);
        }
        offsets
    }

    /// Extends from an anchor in one direction, returning the best extension if any.
    fn extend_from(&self, read: Vec<u8>, node: NodeId, position: usize, forward: bool) -> Option<Extension> {
        let mut extender = Extender {
            graph: self.graph,
            read,
            forward,
            max_edits: self.config.max_edits,
            states_left: self.config.max_extension_states,
            path: vec![],
            best: None
        };
        extender.extend(node, position, 0, 0);
        extender.best
    }

    /// Aligns the read around one seed location.
    fn align_at(&self, read: &[u8], read_offset: usize, location: GraphLocation) -> Option<GraphAlignment> {
        let right = self.extend_from(read[read_offset..].to_vec(), location.node, location.offset, true)?;
        let left_read: Vec<u8> = read[..read_offset].iter().rev().cloned().collect();
        let left = self.extend_from(left_read, location.node, location.offset, false)?;

        let edits = left.edits + right.edits;
        if edits > self.config.max_edits {
            return None;
        }

        let mut nodes: Vec<NodeId> = left.path.iter().rev().cloned().collect();
        nodes.push(location.node);
        nodes.extend(right.path.iter());

        let first = self.graph.node(nodes[0]);
        let abs_start = match first.kind() {
            NodeKind::Reference => first.abs_start() + left.position as u64,
            NodeKind::Alternate => first.abs_start()
        };
        let alternate_nodes = nodes.iter()
            .filter(|&&n| self.graph.node(n).kind() == NodeKind::Alternate)
            .count();
        Some(GraphAlignment {
            nodes,
            start_offset: left.position,
            end_offset: right.position,
            edits,
            read_len: read.len(),
            abs_start,
            alternate_nodes
        })
    }

    /// Seeds the read against the index and verifies every seed location by extension.
    /// Returns the distinct alignments that pass the identity floor, best first.
    pub fn place(&self, read: &[u8]) -> Vec<GraphAlignment> {
        let k = self.index.k();
        let mut seen: HashSet<(Vec<NodeId>, usize, usize)> = Default::default();
        let mut alignments: Vec<GraphAlignment> = vec![];
        for read_offset in self.seed_offsets(read.len()) {
            let Some(value) = encode_kmer(&read[read_offset..read_offset + k]) else {
                continue;
            };
            let locations = self.index.lookup_encoded(value);
            if locations.len() > self.config.max_seed_locations {
                trace!("Skipping repetitive seed at read offset {} with {} locations", read_offset, locations.len());
                continue;
            }
            for &location in locations.iter() {
                let Some(alignment) = self.align_at(read, read_offset, location) else {
                    continue;
                };
                if alignment.identity() < self.config.min_identity {
                    continue;
                }
                if seen.insert((alignment.nodes.clone(), alignment.start_offset, alignment.end_offset)) {
                    alignments.push(alignment);
                }
            }
        }
        alignments.sort_by(|a, b| a.preference(b));
        alignments
    }

    /// Places a read and returns only the preferred alignment, or None if the read is unmapped.
    pub fn place_best(&self, read: &[u8]) -> Option<GraphAlignment> {
        best_alignment(self.place(read))
    }
}

/// Picks the highest scoring alignment; ties prefer fewer alternate nodes and then the earliest position.
pub fn best_alignment(candidates: Vec<GraphAlignment>) -> Option<GraphAlignment> {
    candidates.into_iter().min_by(|a, b| a.preference(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::genomic_region::GenomicRegion;
    use crate::data_types::reference_genome::ReferenceGenome;
    use crate::data_types::variant_candidate::VariantCandidate;
    use crate::data_types::variants::CatalogueVariant;
    use crate::graph_index::IndexConfig;
    use crate::reference_graph::GraphConfig;

    const SEQUENCE: &str = "TTGACCATGAGCTAGGCTAACGTTCAGTCCGATGCAATCG";

    fn variant(pos: u64, seqs: &[&str]) -> CatalogueVariant {
        let candidate = VariantCandidate::new(pos, seqs.iter().map(|s| s.as_bytes().to_vec()).collect()).unwrap();
        CatalogueVariant::new(candidate, None, None).unwrap()
    }

    fn build(variants: &[CatalogueVariant], k: usize) -> (ReferenceGraph, GraphIndex) {
        let reference = ReferenceGenome::from_contigs(vec![("chr1".to_string(), SEQUENCE.as_bytes().to_vec())]);
        let region = GenomicRegion::new("chr1", 0, SEQUENCE.len() as u64);
        let graph = ReferenceGraph::build(&reference, variants, &region, &GraphConfig::default()).unwrap();
        let index = GraphIndex::build(&graph, &IndexConfig { k, max_bubble_paths: 64 }).unwrap();
        (graph, index)
    }

    /// Applies substitutions to a slice of the reference
    fn mutate(begin: usize, end: usize, changes: &[(usize, u8)]) -> Vec<u8> {
        let mut read: Vec<u8> = SEQUENCE.as_bytes().to_vec();
        for &(pos, base) in changes.iter() {
            read[pos] = base;
        }
        read[begin..end].to_vec()
    }

    #[test]
    fn test_reference_read() {
        // SNP at 20 (C -> A)
        let (graph, index) = build(&[variant(20, &["C", "A"])], 6);
        let placer = ReadPlacer::new(&graph, &index, PlacementConfig::default());
        let read = mutate(10, 30, &[]);
        let best = placer.place_best(&read).unwrap();
        assert_eq!(best.edits(), 0);
        assert_eq!(best.abs_start(), 10);
        assert_eq!(best.alternate_nodes(), 0);
        assert_eq!(best.identity(), 1.0);
        assert_eq!(best.allele_support(&graph), vec![(0, 0)]);
    }

    #[test]
    fn test_alternate_read() {
        let (graph, index) = build(&[variant(20, &["C", "A"])], 6);
        let placer = ReadPlacer::new(&graph, &index, PlacementConfig::default());
        let read = mutate(10, 30, &[(20, b'A')]);
        let best = placer.place_best(&read).unwrap();
        assert_eq!(best.edits(), 0);
        assert_eq!(best.alternate_nodes(), 1);
        assert_eq!(best.allele_support(&graph), vec![(0, 1)]);
    }

    #[test]
    fn test_mismatch_tolerated() {
        let (graph, index) = build(&[variant(20, &["C", "A"])], 6);
        let placer = ReadPlacer::new(&graph, &index, PlacementConfig::default());
        // sequencing error at 14 in an otherwise ALT read
        let read = mutate(5, 35, &[(14, b'A'), (20, b'A')]);
        let best = placer.place_best(&read).unwrap();
        assert_eq!(best.edits(), 1);
        assert_eq!(best.abs_start(), 5);
        assert_eq!(best.allele_support(&graph), vec![(0, 1)]);

        // too many errors for the identity floor
        let strict = ReadPlacer::new(&graph, &index, PlacementConfig { min_identity: 0.99, ..Default::default() });
        assert!(strict.place_best(&read).is_none());
    }

    #[test]
    fn test_deletion_read() {
        // delete 21..24 (GTT)
        let (graph, index) = build(&[variant(20, &["CGTT", "C"])], 6);
        let placer = ReadPlacer::new(&graph, &index, PlacementConfig::default());
        let mut read: Vec<u8> = SEQUENCE.as_bytes()[8..21].to_vec();
        read.extend_from_slice(&SEQUENCE.as_bytes()[24..36]);
        let best = placer.place_best(&read).unwrap();
        assert_eq!(best.edits(), 0);
        assert_eq!(best.allele_support(&graph), vec![(0, 1)]);

        let reference_read = mutate(8, 36, &[]);
        let best = placer.place_best(&reference_read).unwrap();
        assert_eq!(best.edits(), 0);
        assert_eq!(best.allele_support(&graph), vec![(0, 0)]);
    }

    #[test]
    fn test_partial_allele_not_counted() {
        let (graph, index) = build(&[variant(20, &["CGT", "C"])], 6);
        let placer = ReadPlacer::new(&graph, &index, PlacementConfig::default());
        // ends in the middle of the REF allele GT at 21..23
        let read = mutate(8, 22, &[]);
        let best = placer.place_best(&read).unwrap();
        assert_eq!(best.edits(), 0);
        assert!(best.allele_support(&graph).is_empty());
    }

    #[test]
    fn test_unmapped() {
        let (graph, index) = build(&[variant(20, &["C", "A"])], 6);
        let placer = ReadPlacer::new(&graph, &index, PlacementConfig::default());
        assert!(placer.place(b"GGGGGGGGGGGGGGGGGGGG").is_empty());
        // shorter than k
        assert!(placer.place(b"TTGA").is_empty());
        // only N
        assert!(placer.place(b"NNNNNNNNNNNN").is_empty());
    }

    #[test]
    fn test_read_off_graph_end() {
        let (graph, index) = build(&[], 6);
        let placer = ReadPlacer::new(&graph, &index, PlacementConfig::default());
        let mut read = SEQUENCE.as_bytes()[20..].to_vec();
        read.extend_from_slice(b"A");
        let best = placer.place_best(&read).unwrap();
        assert_eq!(best.edits(), 1);
        assert_eq!(best.abs_start(), 20);
    }

    #[test]
    fn test_best_alignment_ties() {
        let make = |edits: usize, alternate_nodes: usize, abs_start: u64| GraphAlignment {
            nodes: vec![abs_start as usize],
            start_offset: 0,
            end_offset: 10,
            edits,
            read_len: 10,
            abs_start,
            alternate_nodes
        };
        assert_eq!(best_alignment(vec![]), None);
        let best = best_alignment(vec![make(1, 0, 5), make(0, 1, 9), make(0, 1, 3)]).unwrap();
        assert_eq!(best.abs_start(), 3);
        let best = best_alignment(vec![make(0, 1, 3), make(0, 0, 7)]).unwrap();
        assert_eq!(best.abs_start(), 7);
        assert_eq!(best.score(), 10);
    }
}
