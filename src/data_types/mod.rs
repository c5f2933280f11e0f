
/// Per-sample allele support tallies and the per-read records that feed them
pub mod allele_support;
/// Half-open regions on a contig and region splitting
pub mod genomic_region;
/// Wrapper for an in-memory reference genome with absolute coordinates
pub mod reference_genome;
/// Canonical variant alleles at an absolute position, with normalization and classification
pub mod variant_candidate;
/// Contains variant type definitions and the catalogue variant type
pub mod variants;
