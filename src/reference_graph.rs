
use crate::data_types::genomic_region::GenomicRegion;
use crate::data_types::reference_genome::{AbsolutePosition, BaseLookup, ReferenceGenome};
use crate::data_types::variant_candidate::VariantCandidate;
use crate::data_types::variants::{CatalogueVariant, VariantError, VariantType};
use crate::persistence::{GraphFormatError, read_artifact, write_artifact};

use bit_vec::BitVec;
use log::{debug, trace};
use rustc_hash::{FxHashSet as HashSet, FxHasher};
use serde::{Deserialize, Serialize};
use simple_error::bail;
use std::hash::Hasher;
use std::path::Path;

/// Handle for a node in the graph arena
pub type NodeId = usize;

const GRAPH_MAGIC: &[u8; 8] = b"GTGRAPH\0";

/// Whether a node is on the reference backbone or is an alternate allele
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Reference,
    Alternate
}

/// A contiguous run of bases in the graph.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// the bases in this node, may be empty for bubble anchors and deletion alleles
    sequence: Vec<u8>,
    /// absolute position of the first base; alternate nodes use the start of their site
    abs_start: AbsolutePosition,
    /// backbone or alternate
    kind: NodeKind,
    /// (site index, allele index) if this node is one allele of a bubble
    site_allele: Option<(usize, usize)>,
    /// downstream nodes, reference successor first
    out_edges: Vec<NodeId>,
    /// upstream nodes, reference predecessor first
    in_edges: Vec<NodeId>
}

impl GraphNode {
    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn abs_start(&self) -> AbsolutePosition {
        self.abs_start
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_reference(&self) -> bool {
        self.kind == NodeKind::Reference
    }

    pub fn site_allele(&self) -> Option<(usize, usize)> {
        self.site_allele
    }

    pub fn out_edges(&self) -> &[NodeId] {
        &self.out_edges
    }

    pub fn in_edges(&self) -> &[NodeId] {
        &self.in_edges
    }
}

/// One bubble in the graph: the alleles of a variant site and the nodes that carry them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GraphSite {
    /// fully trimmed alleles at the site position, REF first
    candidate: VariantCandidate,
    /// type assigned from the catalogue
    variant_type: VariantType,
    /// one node per allele, index matches the allele index
    allele_nodes: Vec<NodeId>,
    /// backbone node every allele branches from
    fork_node: NodeId,
    /// backbone node every allele rejoins
    join_node: NodeId,
    /// catalogue IDs merged into this site
    ids: Vec<String>,
    /// true if allele combinations were dropped during construction or path enumeration was truncated while indexing
    low_confidence: bool
}

impl GraphSite {
    pub fn candidate(&self) -> &VariantCandidate {
        &self.candidate
    }

    pub fn variant_type(&self) -> VariantType {
        self.variant_type
    }

    pub fn num_alleles(&self) -> usize {
        self.allele_nodes.len()
    }

    pub fn allele_nodes(&self) -> &[NodeId] {
        &self.allele_nodes
    }

    pub fn fork_node(&self) -> NodeId {
        self.fork_node
    }

    pub fn join_node(&self) -> NodeId {
        self.join_node
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_low_confidence(&self) -> bool {
        self.low_confidence
    }
}

/// Reference bases added on each side of a region, should be at least the longest read
pub const DEFAULT_FLANK: u64 = 200;

/// Options controlling how catalogue variants become bubbles
#[derive(Clone, Debug)]
pub struct GraphConfig {
    /// include structural variants from the catalogue
    pub is_sv: bool,
    /// merge overlapping variants into one bubble with every compatible allele combination
    pub add_all_variants: bool,
    /// maximum number of alternate alleles generated for one merged bubble
    pub max_bubble_paths: usize,
    /// reference-only padding around the region so reads crossing its edges still align
    pub flank: u64
}

impl Default for GraphConfig {
    fn default() -> GraphConfig {
        GraphConfig {
            is_sv: false,
            add_all_variants: false,
            max_bubble_paths: 64,
            flank: DEFAULT_FLANK
        }
    }
}

/// Failure while turning grouped variants into graph nodes
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("site at {position} starts before the previous site ends at {previous_end}")]
    OverlappingSite { position: AbsolutePosition, previous_end: AbsolutePosition },
    #[error("site at {position} runs outside the backbone [{begin}, {end})")]
    SiteOutsideBackbone { position: AbsolutePosition, begin: AbsolutePosition, end: AbsolutePosition },
    #[error("site at {position} cannot be represented: {source}")]
    InvalidSite { position: AbsolutePosition, source: VariantError }
}

/// A structural problem found by `ReferenceGraph::check`
#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
pub enum StructuralDefect {
    #[error("graph has no nodes")]
    NoNodes,
    #[error("edge {from} -> {to} points outside the graph")]
    DanglingEdge { from: NodeId, to: NodeId },
    #[error("edge {from} -> {to} does not point downstream")]
    BackwardEdge { from: NodeId, to: NodeId },
    #[error("edge {from} -> {to} is missing its reverse entry")]
    AsymmetricEdge { from: NodeId, to: NodeId },
    #[error("node {node} cannot be reached from the graph start")]
    UnreachableNode { node: NodeId },
    #[error("node {node} never reconnects to the graph end")]
    DeadEndNode { node: NodeId },
    #[error("backbone node {node} starts at {found}, expected {expected}")]
    NonMonotonicBackbone { node: NodeId, expected: AbsolutePosition, found: AbsolutePosition },
    #[error("site {site} is not a well-formed bubble: {message}")]
    MalformedSite { site: usize, message: String }
}

/// Reference backbone plus alternate-allele bubbles for one region, stored as a node arena.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceGraph {
    /// the region this graph was built for
    region: GenomicRegion,
    /// absolute position of base 0 of the region contig
    contig_offset: AbsolutePosition,
    /// all nodes, every edge points from a lower to a higher index
    nodes: Vec<GraphNode>,
    /// non-empty reference nodes in position order, used for position lookups
    backbone: Vec<NodeId>,
    /// every bubble in the graph, in position order
    sites: Vec<GraphSite>,
    /// number of catalogue variants that could not be placed
    rejected_variants: usize,
    /// digest of the graph content, ties a persisted index to this graph
    fingerprint: u64
}

/// A variant site before it is turned into nodes
struct SitePlan {
    candidate: VariantCandidate,
    variant_type: VariantType,
    ids: Vec<String>,
    low_confidence: bool
}

/// One catalogue variant in trimmed form, ready to be grouped into sites
struct SiteMember {
    candidate: VariantCandidate,
    variant_type: VariantType,
    id: Option<String>
}

impl ReferenceGraph {
    /// Builds a graph for `region` from the reference and every catalogue variant starting inside it.
    /// The backbone also covers `config.flank` reference bases on each side, clamped to the contig, but no variant starting in the flank becomes a site.
    /// Variants that cannot be represented (overlapping in default mode, REF mismatch, filtered SVs) are counted, not fatal.
    /// # Arguments
    /// * `reference` - the reference genome
    /// * `catalogue` - variants sorted or unsorted, only those starting inside `region` are used
    /// * `region` - the region to build, clamped to the contig
    /// * `config` - construction options
    /// # Errors
    /// * if the region contig is not in the reference
    /// * if node insertion fails, which indicates a construction bug
    pub fn build(reference: &ReferenceGenome, catalogue: &[CatalogueVariant], region: &GenomicRegion, config: &GraphConfig) -> Result<ReferenceGraph, Box<dyn std::error::Error>> {
        let region = region.clamp(reference)?;
        let (abs_begin, abs_end) = region.absolute_range(reference)?;
        let contig_offset: AbsolutePosition = abs_begin - region.begin();
        let contig_len: u64 = reference.contig_length(region.chrom()).unwrap_or_default();
        let contig_sequence: &[u8] = reference.get_full_chromosome(region.chrom());
        let graph_begin: AbsolutePosition = abs_begin - config.flank.min(region.begin());
        let graph_end: AbsolutePosition = (abs_end + config.flank).min(contig_offset + contig_len);

        // collect everything that starts in the region and fits on the contig
        let mut rejected_variants: usize = 0;
        let mut members: Vec<SiteMember> = vec![];
        for variant in catalogue.iter() {
            let position = variant.position();
            if position < abs_begin || position >= abs_end {
                continue;
            }
            if variant.get_type().is_sv() && !config.is_sv {
                trace!("Skipping SV at {} in a small variant graph", position);
                rejected_variants += 1;
                continue;
            }
            if variant.end() > contig_offset + contig_len {
                debug!("Variant at {} runs past the contig end, skipping", position);
                rejected_variants += 1;
                continue;
            }

            let local_start = (position - contig_offset) as usize;
            let local_end = (variant.end() - contig_offset) as usize;
            if &contig_sequence[local_start..local_end] != variant.candidate().ref_allele() {
                debug!("REF allele does not match the reference at {}, skipping", position);
                rejected_variants += 1;
                continue;
            }

            members.push(SiteMember {
                candidate: variant.candidate().clone().trimmed(),
                variant_type: variant.get_type(),
                id: variant.id().map(|s| s.to_string())
            });
        }
        members.sort_by(|a, b| {
            a.candidate.abs_pos().cmp(&b.candidate.abs_pos())
                .then(a.candidate.ref_end().cmp(&b.candidate.ref_end()))
                .then(a.candidate.cmp(&b.candidate))
        });

        let sites: Vec<SitePlan> = if config.add_all_variants {
            Self::merge_all_sites(members, contig_sequence, contig_offset, config.max_bubble_paths)?
        } else {
            let (sites, rejected) = Self::merge_shared_sites(members)?;
            rejected_variants += rejected;
            sites
        };

        // the backbone extends past the flank if a variant does
        let backbone_end: AbsolutePosition = sites.iter()
            .map(|s| s.candidate.ref_end())
            .max()
            .unwrap_or(graph_end)
            .max(graph_end);

        let mut graph = ReferenceGraph {
            region,
            contig_offset,
            nodes: vec![],
            backbone: vec![],
            sites: vec![],
            rejected_variants,
            fingerprint: 0
        };
        graph.add_bubbles(sites, contig_sequence, graph_begin, backbone_end)?;

        graph.backbone = graph.nodes.iter().enumerate()
            .filter(|(_, n)| n.is_reference() && !n.is_empty())
            .map(|(i, _)| i)
            .collect();
        graph.fingerprint = graph.compute_fingerprint();

        debug!("Built graph for {} with {} nodes, {} sites, {} rejected variants",
            graph.region, graph.nodes.len(), graph.sites.len(), graph.rejected_variants);
        Ok(graph)
    }

    /// Lays out the backbone over `[backbone_begin, backbone_end)` with one bubble per site.
    /// # Arguments
    /// * `sites` - sites sorted by position, none overlapping another
    /// * `contig_sequence` - the full contig the graph is on
    /// * `backbone_begin` - absolute position of the first backbone base
    /// * `backbone_end` - absolute position one past the last backbone base, at or after every site end
    /// # Errors
    /// * `GraphError::OverlappingSite` if a site starts before the previous one ends
    /// * `GraphError::SiteOutsideBackbone` if a site is not inside the backbone
    fn add_bubbles(&mut self, sites: Vec<SitePlan>, contig_sequence: &[u8], backbone_begin: AbsolutePosition, backbone_end: AbsolutePosition) -> Result<(), Box<dyn std::error::Error>> {
        let contig_offset = self.contig_offset;
        let local = |abs: AbsolutePosition| (abs - contig_offset) as usize;
        let mut previous_end: AbsolutePosition = backbone_begin;
        let mut parents: Vec<NodeId> = vec![];
        for plan in sites.into_iter() {
            let site_index = self.sites.len();
            let site_pos = plan.candidate.abs_pos();
            if site_pos < previous_end {
                if site_index == 0 {
                    return Err(GraphError::SiteOutsideBackbone { position: site_pos, begin: backbone_begin, end: backbone_end }.into());
                }
                return Err(GraphError::OverlappingSite { position: site_pos, previous_end }.into());
            }
            if plan.candidate.ref_end() > backbone_end {
                return Err(GraphError::SiteOutsideBackbone { position: site_pos, begin: backbone_begin, end: backbone_end }.into());
            }

            // catch up the reference to this site, this node may be empty but always exists so every bubble has a fork
            let ref_sequence: Vec<u8> = contig_sequence[local(previous_end)..local(site_pos)].to_vec();
            let fork_node = self.add_node(ref_sequence, previous_end, NodeKind::Reference, None, parents)?;
            if let Some(previous_site) = site_index.checked_sub(1) {
                self.sites[previous_site].join_node = fork_node;
            }

            let mut allele_nodes: Vec<NodeId> = Vec::with_capacity(plan.candidate.num_alleles());
            for (allele_index, allele) in plan.candidate.seqs().iter().enumerate() {
                let kind = if allele_index == 0 { NodeKind::Reference } else { NodeKind::Alternate };
                let node = self.add_node(allele.clone(), site_pos, kind, Some((site_index, allele_index)), vec![fork_node])?;
                allele_nodes.push(node);
            }

            previous_end = plan.candidate.ref_end();
            parents = allele_nodes.clone();
            self.sites.push(GraphSite {
                candidate: plan.candidate,
                variant_type: plan.variant_type,
                allele_nodes,
                fork_node,
                join_node: fork_node,
                ids: plan.ids,
                low_confidence: plan.low_confidence
            });
        }

        // now we just have one last reference node to add
        let ref_sequence: Vec<u8> = contig_sequence[local(previous_end)..local(backbone_end)].to_vec();
        let last_node = self.add_node(ref_sequence, previous_end, NodeKind::Reference, None, parents)?;
        if let Some(last_site) = self.sites.last_mut() {
            last_site.join_node = last_node;
        }
        Ok(())
    }

    /// Groups trimmed variants into sites, merging only those with identical position and REF.
    /// Anything else overlapping an existing site is rejected.
    /// Returns the sites and the number of rejected variants.
    fn merge_shared_sites(members: Vec<SiteMember>) -> Result<(Vec<SitePlan>, usize), GraphError> {
        let mut sites: Vec<SitePlan> = vec![];
        let mut rejected: usize = 0;
        for member in members.into_iter() {
            if let Some(site) = sites.last_mut() {
                let same_anchor = site.candidate.abs_pos() == member.candidate.abs_pos() &&
                    site.candidate.ref_allele() == member.candidate.ref_allele();
                if same_anchor {
                    let position = site.candidate.abs_pos();
                    let mut seqs: Vec<Vec<u8>> = site.candidate.seqs().to_vec();
                    for alt in member.candidate.alt_alleles() {
                        if !seqs.contains(alt) {
                            seqs.push(alt.clone());
                        }
                    }
                    site.candidate = VariantCandidate::new(position, seqs)
                        .map_err(|source| GraphError::InvalidSite { position, source })?;
                    site.ids.extend(member.id);
                    continue;
                }

                let overlaps = member.candidate.abs_pos() < site.candidate.ref_end() ||
                    member.candidate.abs_pos() == site.candidate.abs_pos();
                if overlaps {
                    trace!("Rejecting variant at {} that overlaps site at {}", member.candidate.abs_pos(), site.candidate.abs_pos());
                    rejected += 1;
                    continue;
                }
            }
            sites.push(SitePlan {
                candidate: member.candidate,
                variant_type: member.variant_type,
                ids: member.id.into_iter().collect(),
                low_confidence: false
            });
        }
        Ok((sites, rejected))
    }

    /// Groups overlapping trimmed variants into clusters and turns each cluster into one site whose
    /// alternates are every compatible combination of member alleles.
    /// # Arguments
    /// * `members` - trimmed variants sorted by position
    /// * `contig_sequence` - the full contig the variants are on
    /// * `contig_offset` - absolute position of the contig start
    /// * `max_alleles` - combinations beyond this are dropped and the site is flagged low-confidence
    fn merge_all_sites(members: Vec<SiteMember>, contig_sequence: &[u8], contig_offset: AbsolutePosition, max_alleles: usize) -> Result<Vec<SitePlan>, GraphError> {
        // (start, end, members) for each cluster
        let mut clusters: Vec<(AbsolutePosition, AbsolutePosition, Vec<SiteMember>)> = vec![];
        for member in members.into_iter() {
            let pos = member.candidate.abs_pos();
            let member_end = member.candidate.ref_end();
            match clusters.last_mut() {
                Some((cluster_start, cluster_end, cluster)) if pos < *cluster_end || pos == *cluster_start => {
                    *cluster_end = (*cluster_end).max(member_end);
                    cluster.push(member);
                },
                _ => clusters.push((pos, member_end, vec![member]))
            }
        }

        let mut sites: Vec<SitePlan> = Vec::with_capacity(clusters.len());
        for (start, end, cluster) in clusters.into_iter() {
            let ref_span: Vec<u8> = contig_sequence[(start - contig_offset) as usize..(end - contig_offset) as usize].to_vec();

            let mut alternates: Vec<Vec<u8>> = vec![];
            let mut seen: HashSet<Vec<u8>> = Default::default();
            seen.insert(ref_span.clone());
            let mut truncated = false;
            let mut buffer: Vec<u8> = vec![];
            enumerate_combinations(&cluster, 0, start, None, &mut buffer, &ref_span, start,
                &mut alternates, &mut seen, max_alleles, &mut truncated);
            if truncated {
                debug!("Cluster at {} has more than {} allele combinations, extra combinations dropped", start, max_alleles);
            }

            let mut seqs: Vec<Vec<u8>> = Vec::with_capacity(alternates.len() + 1);
            seqs.push(ref_span);
            seqs.extend(alternates);
            let candidate = VariantCandidate::new(start, seqs)
                .map_err(|source| GraphError::InvalidSite { position: start, source })?
                .trimmed();

            let variant_type = if cluster.len() == 1 {
                cluster[0].variant_type
            } else {
                cluster.iter()
                    .map(|m| m.variant_type)
                    .find(|t| t.is_sv())
                    .unwrap_or_else(|| candidate.variant_type())
            };
            sites.push(SitePlan {
                candidate,
                variant_type,
                ids: cluster.into_iter().filter_map(|m| m.id).collect(),
                low_confidence: truncated
            });
        }
        Ok(sites)
    }

    /// Adds a node to the graph and returns its index as a Result.
    /// # Arguments
    /// * `sequence` - the vector of sequence to add with this node
    /// * `abs_start` - absolute position of the node
    /// * `kind` - backbone or alternate
    /// * `site_allele` - the (site, allele) this node carries, if any
    /// * `parent_nodes` - the index of any upstream nodes in the graph
    /// # Errors
    /// * if the first node inserted has parents; first node is assumed root, so this would break that assumption
    /// * if any subsequent node is parent-less; all nodes must stem from the root
    /// * if any parent node has a index >= this node's index; this is a DAG only
    fn add_node(&mut self, sequence: Vec<u8>, abs_start: AbsolutePosition, kind: NodeKind, site_allele: Option<(usize, usize)>, parent_nodes: Vec<NodeId>) -> Result<NodeId, Box<dyn std::error::Error>> {
        let new_index: NodeId = self.nodes.len();

        if new_index == 0 {
            if !parent_nodes.is_empty() {
                bail!("First node must have no parent nodes.");
            }
        } else {
            if parent_nodes.is_empty() {
                bail!("All nodes after the first must have at least one parent node.");
            }
            for &pn in parent_nodes.iter() {
                if new_index <= pn {
                    bail!("All parent nodes must come before this node.");
                }
            }
        }

        // add any new edges from parents
        for &p_index in parent_nodes.iter() {
            self.nodes[p_index].out_edges.push(new_index);
        }

        self.nodes.push(GraphNode {
            sequence,
            abs_start,
            kind,
            site_allele,
            out_edges: vec![],
            in_edges: parent_nodes
        });
        Ok(new_index)
    }

    /// Digest over the region, node content, and edges
    fn compute_fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(self.region.chrom().as_bytes());
        hasher.write_u64(self.region.begin());
        hasher.write_u64(self.region.end());
        for node in self.nodes.iter() {
            hasher.write_u64(node.abs_start);
            hasher.write_u8(node.kind as u8);
            hasher.write_usize(node.sequence.len());
            hasher.write(&node.sequence);
            hasher.write_usize(node.out_edges.len());
            for &e in node.out_edges.iter() {
                hasher.write_usize(e);
            }
        }
        for site in self.sites.iter() {
            hasher.write_u64(site.candidate.candidate_hash());
        }
        hasher.finish()
    }

    /// Validates the structural invariants of the graph.
    /// Nothing is repaired; every problem found is returned.
    pub fn check(&self) -> Result<(), Vec<StructuralDefect>> {
        let mut defects: Vec<StructuralDefect> = vec![];
        let num_nodes = self.nodes.len();
        if num_nodes == 0 {
            return Err(vec![StructuralDefect::NoNodes]);
        }

        // edges must be in range, point downstream, and be mirrored
        for (from, node) in self.nodes.iter().enumerate() {
            for &to in node.out_edges.iter() {
                if to >= num_nodes {
                    defects.push(StructuralDefect::DanglingEdge { from, to });
                    continue;
                }
                if to <= from {
                    defects.push(StructuralDefect::BackwardEdge { from, to });
                }
                if !self.nodes[to].in_edges.contains(&from) {
                    defects.push(StructuralDefect::AsymmetricEdge { from, to });
                }
            }
            for &parent in node.in_edges.iter() {
                if parent >= num_nodes {
                    defects.push(StructuralDefect::DanglingEdge { from: parent, to: from });
                } else if !self.nodes[parent].out_edges.contains(&from) {
                    defects.push(StructuralDefect::AsymmetricEdge { from: parent, to: from });
                }
            }
        }
        if !defects.is_empty() {
            // reachability below assumes edges are in range
            return Err(defects);
        }

        // everything must be reachable from the start and must reach the end
        let mut forward = BitVec::from_elem(num_nodes, false);
        let mut stack: Vec<NodeId> = vec![0];
        while let Some(n) = stack.pop() {
            if forward[n] {
                continue;
            }
            forward.set(n, true);
            stack.extend(self.nodes[n].out_edges.iter().filter(|&&o| !forward[o]));
        }
        let mut backward = BitVec::from_elem(num_nodes, false);
        let mut stack: Vec<NodeId> = vec![num_nodes - 1];
        while let Some(n) = stack.pop() {
            if backward[n] {
                continue;
            }
            backward.set(n, true);
            stack.extend(self.nodes[n].in_edges.iter().filter(|&&i| !backward[i]));
        }
        for n in 0..num_nodes {
            if !forward[n] {
                defects.push(StructuralDefect::UnreachableNode { node: n });
            }
            if !backward[n] {
                defects.push(StructuralDefect::DeadEndNode { node: n });
            }
        }

        // reference nodes must tile the reference in order
        let mut expected_start: Option<AbsolutePosition> = None;
        for (n, node) in self.nodes.iter().enumerate() {
            if !node.is_reference() {
                continue;
            }
            if let Some(expected) = expected_start {
                if node.abs_start != expected {
                    defects.push(StructuralDefect::NonMonotonicBackbone { node: n, expected, found: node.abs_start });
                }
            }
            expected_start = Some(node.abs_start + node.len() as u64);
        }

        // every site is a fork -> alleles -> join bubble
        for (site_index, site) in self.sites.iter().enumerate() {
            let malformed = |message: String| StructuralDefect::MalformedSite { site: site_index, message };
            if site.allele_nodes.len() != site.candidate.num_alleles() {
                defects.push(malformed(format!("{} allele nodes for {} alleles", site.allele_nodes.len(), site.candidate.num_alleles())));
                continue;
            }
            for (allele_index, &allele_node) in site.allele_nodes.iter().enumerate() {
                let node = &self.nodes[allele_node];
                if node.site_allele != Some((site_index, allele_index)) {
                    defects.push(malformed(format!("node {allele_node} is not tagged as allele {allele_index}")));
                }
                if node.sequence != site.candidate.seqs()[allele_index] {
                    defects.push(malformed(format!("node {allele_node} sequence does not match allele {allele_index}")));
                }
                if !self.nodes[site.fork_node].out_edges.contains(&allele_node) {
                    defects.push(malformed(format!("allele node {allele_node} does not branch from fork {}", site.fork_node)));
                }
                if node.out_edges != [site.join_node] {
                    defects.push(malformed(format!("allele node {allele_node} does not rejoin at {}", site.join_node)));
                }
            }
        }

        if defects.is_empty() {
            Ok(())
        } else {
            Err(defects)
        }
    }

    /// Writes the graph to a binary file.
    /// # Errors
    /// * if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<(), GraphFormatError> {
        write_artifact(path, GRAPH_MAGIC, self.fingerprint, self)
    }

    /// Loads a graph written by `save`.
    /// # Errors
    /// * if the file cannot be read, has the wrong magic or version, or its content does not match its stored fingerprint
    pub fn load(path: &Path) -> Result<ReferenceGraph, GraphFormatError> {
        let (stored_fingerprint, graph): (u64, ReferenceGraph) = read_artifact(path, GRAPH_MAGIC, "graph")?;
        let computed = graph.compute_fingerprint();
        if computed != stored_fingerprint || computed != graph.fingerprint {
            return Err(GraphFormatError::Corrupt {
                path: path.to_path_buf(),
                message: "graph content does not match its fingerprint".to_string()
            });
        }
        Ok(graph)
    }

    pub fn region(&self) -> &GenomicRegion {
        &self.region
    }

    pub fn contig_offset(&self) -> AbsolutePosition {
        self.contig_offset
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn rejected_variants(&self) -> usize {
        self.rejected_variants
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// # Panics
    /// * if `node` is out of range
    pub fn node(&self, node: NodeId) -> &GraphNode {
        &self.nodes[node]
    }

    pub fn sites(&self) -> &[GraphSite] {
        &self.sites
    }

    /// Marks sites as low-confidence, used when indexing had to truncate path enumeration.
    pub fn flag_low_confidence(&mut self, site_indices: &[usize]) {
        for &s in site_indices.iter() {
            if let Some(site) = self.sites.get_mut(s) {
                site.low_confidence = true;
            }
        }
    }

    /// Absolute interval covered by the backbone
    pub fn backbone_range(&self) -> (AbsolutePosition, AbsolutePosition) {
        let start = self.nodes.first().map(|n| n.abs_start).unwrap_or_default();
        let end = self.nodes.last().map(|n| n.abs_start + n.len() as u64).unwrap_or_default();
        (start, end)
    }

    /// Finds the reference node and offset covering an absolute position.
    pub fn backbone_node_at(&self, position: AbsolutePosition) -> Option<(NodeId, usize)> {
        let index = self.backbone.partition_point(|&n| self.nodes[n].abs_start <= position);
        let node_id = *self.backbone.get(index.checked_sub(1)?)?;
        let node = &self.nodes[node_id];
        let offset = (position - node.abs_start) as usize;
        if offset < node.len() {
            Some((node_id, offset))
        } else {
            None
        }
    }

    /// Returns the reference sequence in `[begin, end)`, truncated to the backbone.
    pub fn backbone_sequence(&self, begin: AbsolutePosition, end: AbsolutePosition) -> Vec<u8> {
        (begin..end).filter_map(|p| self.base_at(p)).collect()
    }
}

impl BaseLookup for ReferenceGraph {
    fn base_at(&self, position: AbsolutePosition) -> Option<u8> {
        let (node, offset) = self.backbone_node_at(position)?;
        Some(self.nodes[node].sequence[offset])
    }
}

/// Recursive helper that emits every haplotype of a cluster where at least one member carries an ALT allele.
/// Members chosen together must not overlap and must not start at the same position.
#[allow(clippy::too_many_arguments)]
fn enumerate_combinations(
    members: &[SiteMember], index: usize, cursor: AbsolutePosition, last_start: Option<AbsolutePosition>,
    buffer: &mut Vec<u8>, ref_span: &[u8], span_start: AbsolutePosition,
    alternates: &mut Vec<Vec<u8>>, seen: &mut HashSet<Vec<u8>>, max_alleles: usize, truncated: &mut bool
) {
    if alternates.len() >= max_alleles {
        *truncated = true;
        return;
    }
    if index == members.len() {
        if last_start.is_some() {
            let mut haplotype = buffer.clone();
            haplotype.extend_from_slice(&ref_span[(cursor - span_start) as usize..]);
            if seen.insert(haplotype.clone()) {
                alternates.push(haplotype);
            }
        }
        return;
    }

    // this member stays reference
    enumerate_combinations(members, index + 1, cursor, last_start, buffer, ref_span, span_start,
        alternates, seen, max_alleles, truncated);

    // this member carries one of its alternates, if compatible with what was already chosen
    let member = &members[index].candidate;
    if member.abs_pos() < cursor || last_start == Some(member.abs_pos()) {
        return;
    }
    for alt in member.alt_alleles() {
        let restore_len = buffer.len();
        buffer.extend_from_slice(&ref_span[(cursor - span_start) as usize..(member.abs_pos() - span_start) as usize]);
        buffer.extend_from_slice(alt);
        enumerate_combinations(members, index + 1, member.ref_end(), Some(member.abs_pos()), buffer, ref_span, span_start,
            alternates, seen, max_alleles, truncated);
        buffer.truncate(restore_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> ReferenceGenome {
        ReferenceGenome::from_contigs(vec![
            ("chr0".to_string(), b"TTTT".to_vec()),
            ("chr1".to_string(), b"ACGTACGTACGTACGT".to_vec())
        ])
    }

    /// Builds a catalogue variant on chr1 using local coordinates
    fn variant(local_pos: u64, seqs: &[&str]) -> CatalogueVariant {
        let candidate = VariantCandidate::new(4 + local_pos, seqs.iter().map(|s| s.as_bytes().to_vec()).collect()).unwrap();
        CatalogueVariant::new(candidate, None, None).unwrap()
    }

    fn build(variants: &[CatalogueVariant], config: &GraphConfig) -> ReferenceGraph {
        let reference = reference();
        let region = GenomicRegion::new("chr1", 0, 16);
        ReferenceGraph::build(&reference, variants, &region, config).unwrap()
    }

    /// Enumerates every start-to-end sequence in the graph
    fn all_paths(graph: &ReferenceGraph) -> Vec<Vec<u8>> {
        let mut results = vec![];
        let mut stack: Vec<(NodeId, Vec<u8>)> = vec![(0, graph.node(0).sequence().to_vec())];
        while let Some((node, sequence)) = stack.pop() {
            let successors = graph.node(node).out_edges();
            if successors.is_empty() {
                results.push(sequence);
                continue;
            }
            for &s in successors.iter() {
                let mut next = sequence.clone();
                next.extend_from_slice(graph.node(s).sequence());
                stack.push((s, next));
            }
        }
        results.sort();
        results
    }

    #[test]
    fn test_no_variants() {
        let graph = build(&[], &GraphConfig::default());
        assert_eq!(graph.num_nodes(), 1);
        assert_eq!(graph.node(0).sequence(), b"ACGTACGTACGTACGT");
        assert_eq!(graph.node(0).abs_start(), 4);
        assert!(graph.check().is_ok());
        assert_eq!(all_paths(&graph), vec![b"ACGTACGTACGTACGT".to_vec()]);
    }

    #[test]
    fn test_simple_snv() {
        let graph = build(&[variant(1, &["C", "T"])], &GraphConfig::default());
        assert_eq!(graph.num_nodes(), 4);
        assert_eq!(graph.node(0).sequence(), b"A");
        assert_eq!(graph.node(1).sequence(), b"C");
        assert_eq!(graph.node(2).sequence(), b"T");
        assert_eq!(graph.node(3).sequence(), b"GTACGTACGTACGT");
        assert_eq!(graph.node(0).out_edges(), &[1, 2]);
        assert_eq!(graph.node(3).in_edges(), &[1, 2]);
        assert_eq!(graph.node(2).kind(), NodeKind::Alternate);
        assert_eq!(graph.node(2).abs_start(), 5);
        assert_eq!(graph.node(3).abs_start(), 6);

        let site = &graph.sites()[0];
        assert_eq!(site.allele_nodes(), &[1, 2]);
        assert_eq!(site.fork_node(), 0);
        assert_eq!(site.join_node(), 3);
        assert_eq!(site.variant_type(), VariantType::Snv);
        assert!(graph.check().is_ok());

        assert_eq!(all_paths(&graph), vec![
            b"ACGTACGTACGTACGT".to_vec(),
            b"ATGTACGTACGTACGT".to_vec()
        ]);
    }

    #[test]
    fn test_indels() {
        // deletion of GT at local 2..4 and insertion of AA after local 9
        let graph = build(&[variant(1, &["CGT", "C"]), variant(9, &["C", "CAA"])], &GraphConfig::default());
        assert!(graph.check().is_ok());
        assert_eq!(graph.sites().len(), 2);
        assert_eq!(graph.sites()[0].candidate().seqs(), &[b"GT".to_vec(), vec![]]);
        assert_eq!(graph.sites()[1].candidate().seqs(), &[vec![], b"AA".to_vec()]);
        assert_eq!(all_paths(&graph), vec![
            b"ACACGTACAAGTACGT".to_vec(),
            b"ACACGTACGTACGT".to_vec(),
            b"ACGTACGTACAAGTACGT".to_vec(),
            b"ACGTACGTACGTACGT".to_vec()
        ]);
    }

    #[test]
    fn test_variant_at_start_and_end() {
        let graph = build(&[variant(0, &["A", "G"]), variant(15, &["T", "C"])], &GraphConfig::default());
        assert!(graph.check().is_ok());
        // dummy empty start node
        assert!(graph.node(0).is_empty());
        assert_eq!(graph.node(0).out_edges(), &[1, 2]);
        // dummy empty end node
        let last = graph.num_nodes() - 1;
        assert!(graph.node(last).is_empty());
        assert_eq!(graph.node(last).abs_start(), 20);
        assert_eq!(all_paths(&graph).len(), 4);
    }

    #[test]
    fn test_adjacent_variants() {
        let graph = build(&[variant(1, &["C", "T"]), variant(2, &["G", "A"])], &GraphConfig::default());
        assert!(graph.check().is_ok());
        // empty join/fork between the two sites
        let join = graph.sites()[0].join_node();
        assert_eq!(join, graph.sites()[1].fork_node());
        assert!(graph.node(join).is_empty());
        assert_eq!(all_paths(&graph).len(), 4);
    }

    #[test]
    fn test_shared_anchor_merge() {
        let graph = build(&[variant(1, &["C", "T"]), variant(1, &["C", "G"]), variant(1, &["C", "T"])], &GraphConfig::default());
        assert_eq!(graph.sites().len(), 1);
        assert_eq!(graph.sites()[0].candidate().seqs(), &[b"C".to_vec(), b"G".to_vec(), b"T".to_vec()]);
        assert_eq!(graph.rejected_variants(), 0);
        assert!(graph.check().is_ok());
    }

    #[test]
    fn test_overlap_rejected() {
        // deletion of local 2..4, then a SNP inside it
        let graph = build(&[variant(1, &["CGT", "C"]), variant(3, &["T", "A"])], &GraphConfig::default());
        assert_eq!(graph.sites().len(), 1);
        assert_eq!(graph.rejected_variants(), 1);
        assert!(graph.check().is_ok());
    }

    #[test]
    fn test_add_all_variants() {
        let config = GraphConfig { add_all_variants: true, ..Default::default() };
        // deletion of local 2..4 (GT), SNP at local 3 (T->A), SNP at local 5 (C->G) that does not overlap
        let graph = build(&[variant(1, &["CGT", "C"]), variant(3, &["T", "A"]), variant(5, &["C", "G"])], &config);
        assert!(graph.check().is_ok());
        assert_eq!(graph.rejected_variants(), 0);
        assert_eq!(graph.sites().len(), 2);

        // merged site covers local 2..4 with the deletion and the SNP as alternates
        let merged = &graph.sites()[0];
        assert_eq!(merged.num_alleles(), 3);
        let paths = all_paths(&graph);
        assert_eq!(paths.len(), 6);
        assert!(paths.contains(&b"ACGAACGTACGTACGT".to_vec()));
        assert!(paths.contains(&b"ACAGGTACGTACGT".to_vec()));
    }

    #[test]
    fn test_add_all_variants_limit() {
        let config = GraphConfig { add_all_variants: true, max_bubble_paths: 2, ..Default::default() };
        let graph = build(&[variant(1, &["CGTA", "C"]), variant(2, &["G", "A"]), variant(3, &["T", "C"]), variant(4, &["A", "G"])], &config);
        assert!(graph.check().is_ok());
        assert_eq!(graph.sites().len(), 1);
        assert_eq!(graph.sites()[0].num_alleles(), 3);
        assert!(graph.sites()[0].is_low_confidence());
    }

    #[test]
    fn test_sv_filter_and_mismatch() {
        let sv = CatalogueVariant::new(
            VariantCandidate::new(5, vec![b"CGT".to_vec(), b"C".to_vec()]).unwrap(),
            Some(VariantType::SvDeletion), None
        ).unwrap();
        let mismatch = variant(2, &["A", "C"]);

        let graph = build(&[sv.clone(), mismatch.clone()], &GraphConfig::default());
        assert_eq!(graph.sites().len(), 0);
        assert_eq!(graph.rejected_variants(), 2);

        let sv_config = GraphConfig { is_sv: true, ..Default::default() };
        let graph = build(&[sv, mismatch], &sv_config);
        assert_eq!(graph.sites().len(), 1);
        assert_eq!(graph.sites()[0].variant_type(), VariantType::SvDeletion);
        assert_eq!(graph.rejected_variants(), 1);
    }

    #[test]
    fn test_variant_outside_region() {
        let reference = reference();
        let region = GenomicRegion::new("chr1", 4, 8);
        let config = GraphConfig { flank: 0, ..Default::default() };
        let graph = ReferenceGraph::build(&reference, &[variant(1, &["C", "T"]), variant(5, &["C", "T"])], &region, &config).unwrap();
        assert_eq!(graph.sites().len(), 1);
        assert_eq!(graph.backbone_range(), (8, 12));
    }

    #[test]
    fn test_variant_spanning_region_end() {
        let reference = reference();
        let region = GenomicRegion::new("chr1", 0, 4);
        let config = GraphConfig { flank: 0, ..Default::default() };
        let graph = ReferenceGraph::build(&reference, &[variant(3, &["TACG", "T"])], &region, &config).unwrap();
        assert!(graph.check().is_ok());
        // the backbone is extended to the end of the deletion
        assert_eq!(graph.backbone_range(), (4, 11));
    }

    #[test]
    fn test_flank_padding() {
        let reference = reference();
        let region = GenomicRegion::new("chr1", 4, 8);
        let config = GraphConfig { flank: 3, ..Default::default() };
        // local 2 is in the left flank, local 9 in the right flank, local 5 inside
        let variants = [variant(2, &["G", "A"]), variant(5, &["C", "T"]), variant(9, &["C", "G"])];
        let graph = ReferenceGraph::build(&reference, &variants, &region, &config).unwrap();
        assert!(graph.check().is_ok());
        assert_eq!(graph.region(), &region);
        assert_eq!(graph.backbone_range(), (5, 15));
        assert_eq!(graph.sites().len(), 1);
        assert_eq!(graph.sites()[0].candidate().abs_pos(), 9);
        assert_eq!(graph.backbone_sequence(5, 15), b"CGTACGTACG".to_vec());

        // the flank stops at the contig edges
        let config = GraphConfig { flank: 100, ..Default::default() };
        let graph = ReferenceGraph::build(&reference, &[], &region, &config).unwrap();
        assert_eq!(graph.backbone_range(), (4, 20));
    }

    #[test]
    fn test_bubble_layout_errors() {
        let contig = b"ACGTACGTACGTACGT";
        let plan = |pos: u64, seqs: &[&str]| SitePlan {
            candidate: VariantCandidate::new(pos, seqs.iter().map(|s| s.as_bytes().to_vec()).collect()).unwrap(),
            variant_type: VariantType::Snv,
            ids: vec![],
            low_confidence: false
        };
        let empty = || ReferenceGraph {
            region: GenomicRegion::new("chr1", 0, 16),
            contig_offset: 0,
            nodes: vec![],
            backbone: vec![],
            sites: vec![],
            rejected_variants: 0,
            fingerprint: 0
        };

        // out of order sites
        let mut graph = empty();
        let err = graph.add_bubbles(vec![plan(5, &["C", "T"]), plan(2, &["G", "A"])], contig, 0, 16).unwrap_err();
        assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::OverlappingSite { position: 2, previous_end: 6 })));

        // site before the backbone
        let mut graph = empty();
        let err = graph.add_bubbles(vec![plan(1, &["C", "T"])], contig, 4, 16).unwrap_err();
        assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::SiteOutsideBackbone { position: 1, .. })));

        // site past the backbone
        let mut graph = empty();
        let err = graph.add_bubbles(vec![plan(9, &["CGT", "C"])], contig, 0, 10).unwrap_err();
        assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::SiteOutsideBackbone { position: 9, .. })));

        let mut graph = empty();
        graph.add_bubbles(vec![plan(1, &["C", "T"]), plan(5, &["C", "T"])], contig, 0, 16).unwrap();
        assert!(graph.check().is_ok());
    }

    #[test]
    fn test_position_lookup() {
        let graph = build(&[variant(1, &["CGT", "C"])], &GraphConfig::default());
        assert_eq!(graph.backbone_node_at(4), Some((0, 0)));
        assert_eq!(graph.backbone_node_at(5), Some((0, 1)));
        assert_eq!(graph.backbone_node_at(6), Some((1, 0)));
        assert_eq!(graph.backbone_node_at(7), Some((1, 1)));
        assert_eq!(graph.backbone_node_at(8), Some((3, 0)));
        assert_eq!(graph.backbone_node_at(3), None);
        assert_eq!(graph.backbone_node_at(20), None);
        assert_eq!(graph.base_at(7), Some(b'T'));
        assert_eq!(graph.backbone_sequence(4, 9), b"ACGTA".to_vec());
    }

    #[test]
    fn test_check_defects() {
        let graph = build(&[variant(1, &["C", "T"])], &GraphConfig::default());

        let mut dangling = graph.clone();
        dangling.nodes[0].out_edges.push(10);
        assert!(dangling.check().unwrap_err().contains(&StructuralDefect::DanglingEdge { from: 0, to: 10 }));

        let mut dead_end = graph.clone();
        // alt node no longer rejoins the backbone
        dead_end.nodes[2].out_edges.clear();
        dead_end.nodes[3].in_edges.retain(|&p| p != 2);
        let defects = dead_end.check().unwrap_err();
        assert!(defects.contains(&StructuralDefect::DeadEndNode { node: 2 }));
        assert!(defects.iter().any(|d| matches!(d, StructuralDefect::MalformedSite { site: 0, .. })));

        let mut asymmetric = graph.clone();
        asymmetric.nodes[3].in_edges.retain(|&p| p != 2);
        assert!(asymmetric.check().unwrap_err().contains(&StructuralDefect::AsymmetricEdge { from: 2, to: 3 }));

        let mut shifted = graph.clone();
        shifted.nodes[3].abs_start += 1;
        assert!(shifted.check().unwrap_err().contains(&StructuralDefect::NonMonotonicBackbone { node: 3, expected: 6, found: 7 }));

        let empty = ReferenceGraph { nodes: vec![], ..graph };
        assert_eq!(empty.check().unwrap_err(), vec![StructuralDefect::NoNodes]);
    }

    #[test]
    fn test_save_load() {
        let graph = build(&[variant(1, &["C", "T"]), variant(9, &["C", "CAA"])], &GraphConfig::default());
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("graph.gtg");
        graph.save(&path).unwrap();
        let loaded = ReferenceGraph::load(&path).unwrap();
        assert_eq!(loaded.fingerprint(), graph.fingerprint());
        assert_eq!(loaded.nodes(), graph.nodes());
        assert_eq!(loaded.sites(), graph.sites());
        assert_eq!(loaded.region(), graph.region());
        assert!(loaded.check().is_ok());

        // an index file is not a graph file
        std::fs::write(&path, b"GTINDEX\0garbage").unwrap();
        assert!(matches!(ReferenceGraph::load(&path), Err(GraphFormatError::BadMagic { .. })));
    }
}
