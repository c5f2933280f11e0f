
/// Reads genotyped VCFs back into calls
pub mod call_reader;
/// Contains writer for VCF files
pub mod ordered_vcf_writer;
/// Contains writer for per-region statistics
pub mod region_stats;
/// Splits multi-allelic records of a genotyped VCF
pub mod vcf_break_down;
/// Contains the ordered merge of sorted VCF files
pub mod vcf_concatenate;
/// Joins the samples of several genotyped VCFs
pub mod vcf_merge;
/// Contains additional VCF utilities
pub mod vcf_util;
