
use crate::data_types::genomic_region::GenomicRegion;
use crate::data_types::reference_genome::ReferenceGenome;
use crate::variant_map::{DecomposeOptions, decompose};
use crate::writers::call_reader::read_calls;
use crate::writers::ordered_vcf_writer::OrderedVcfWriter;

use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

/// Splits every multi-allelic record of a genotyped VCF into records whose alternate alleles do not overlap.
/// Genotypes and allele depths follow their alleles into the new records, and the output is position-sorted.
/// Records with symbolic alleles cannot be split and are left out.
/// # Arguments
/// * `input` - a VCF written by the genotyper, or any VCF with GT and AD
/// * `output` - the output path, format chosen by extension
/// * `reference` - the reference the calls were made against, used for padding bases
/// * `region` - if set, only records starting inside it are broken down
/// # Returns
/// the number of records written
/// # Errors
/// * if the input cannot be read or uses a contig the reference lacks
/// * if the output cannot be written
pub fn break_down_vcf(input: &Path, output: &Path, reference: Arc<ReferenceGenome>, region: Option<&GenomicRegion>) -> Result<u64, Box<dyn std::error::Error>> {
    let call_file = read_calls(input, &reference, region)?;
    if call_file.skipped > 0 {
        warn!("Left out {} records with symbolic alleles from {:?}", call_file.skipped, input);
    }
    let num_input = call_file.calls.len();
    let records = decompose(call_file.calls, reference.as_ref(), &DecomposeOptions::default());

    let mut vcf_writer = OrderedVcfWriter::new(output, reference.clone(), &call_file.sample_names)?;
    vcf_writer.write_calls(&records)?;
    info!("Broke {} records from {:?} into {} records", num_input, input, vcf_writer.records_written());
    Ok(vcf_writer.records_written())
}
