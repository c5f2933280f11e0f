
/// CLI functionality and checks
pub mod cli;
/// Contains the core data types: reference, regions, variants, and read support
pub mod data_types;
/// k-mer index over the paths of a reference graph
pub mod graph_index;
/// Versioned binary save/load for graphs and indices
pub mod persistence;
/// Organizes the per-region workflow: graph, index, reads, calls, and the worker pool that runs it
pub mod pipeline;
/// Seeds and extends reads against the graph to find their best path
pub mod read_placer;
/// Loading reads from BAM/CRAM files, and the shared cap on open files
pub mod read_source;
/// Variation graph built from a reference region and a catalogue of variants
pub mod reference_graph;
/// Loads and normalizes the variant catalogue from VCF
pub mod variant_catalogue;
/// Per-sample allele support, genotype calling, and record decomposition
pub mod variant_map;
/// Contains all the various output writer functionality
pub mod writers;
