
use crate::data_types::reference_genome::{AbsolutePosition, ReferenceGenome};
use crate::pipeline::RegionOutput;
use crate::variant_map::GenotypeCall;
use crate::writers::vcf_util::output_format;

use log::trace;
use rust_htslib::bcf;
use rust_htslib::bcf::record::GenotypeAllele;
use rustc_hash::FxHashMap as HashMap;
use simple_error::bail;
use std::path::Path;
use std::sync::Arc;

/// htslib's missing value for integer FORMAT fields
const MISSING_INTEGER: i32 = i32::MIN;

/// Builds the output header: contigs, INFO and FORMAT definitions, version lines, and samples.
fn build_header(reference: &ReferenceGenome, sample_names: &[String]) -> bcf::Header {
    let mut header = bcf::Header::new();
    let cli_string: String = std::env::args().collect::<Vec<String>>().join(" ");
    let cli_version: &str = &crate::cli::FULL_VERSION;
    header.push_record(format!(r#"##graphtyper_version="{cli_version}""#).as_bytes());
    header.push_record(format!(r#"##graphtyper_command="{cli_string}""#).as_bytes());
    for contig in reference.contig_keys().iter() {
        let length = reference.contig_length(contig).unwrap_or_default();
        header.push_record(format!("##contig=<ID={contig},length={length}>").as_bytes());
    }
    header.push_record(r#"##INFO=<ID=SVTYPE,Number=1,Type=String,Description="Type of structural variant">"#.as_bytes());
    header.push_record(r#"##INFO=<ID=LC,Number=0,Type=Flag,Description="Variant is in a bubble whose paths were not all indexed">"#.as_bytes());
    header.push_record(r#"##FORMAT=<ID=GT,Number=1,Type=String,Description="Genotype">"#.as_bytes());
    header.push_record(r#"##FORMAT=<ID=AD,Number=R,Type=Integer,Description="Read depth per allele">"#.as_bytes());
    header.push_record(r#"##FORMAT=<ID=DP,Number=1,Type=Integer,Description="Read depth">"#.as_bytes());
    header.push_record(r#"##FORMAT=<ID=GQ,Number=1,Type=Integer,Description="Genotype quality">"#.as_bytes());
    for sample_name in sample_names.iter() {
        header.push_sample(sample_name.as_bytes());
    }
    header
}

/// Writes genotype calls in ascending position order, holding back regions that finish early.
pub struct OrderedVcfWriter {
    /// the VCF we are writing to
    vcf_writer: bcf::Writer,
    /// converts absolute positions back to contig coordinates
    reference: Arc<ReferenceGenome>,
    /// regions that arrived before the one we are waiting on
    map_store: HashMap<usize, RegionOutput>,
    /// the index of the region we are waiting for
    current_index: usize,
    /// position of the last written record
    last_position: Option<AbsolutePosition>,
    /// number of records written so far
    records_written: u64
}

impl OrderedVcfWriter {
    /// Creates a new `OrderedVcfWriter`.
    /// # Arguments
    /// * `output_vcf` - the output path, format chosen by extension
    /// * `reference` - the reference the calls were made against
    /// * `sample_names` - one genotype column per sample, in this order
    /// # Errors
    /// * if the output file cannot be created
    pub fn new(output_vcf: &Path, reference: Arc<ReferenceGenome>, sample_names: &[String]) -> Result<OrderedVcfWriter, Box<dyn std::error::Error>> {
        let header = build_header(&reference, sample_names);
        let (uncompressed, format) = output_format(output_vcf);
        let vcf_writer: bcf::Writer = bcf::Writer::from_path(output_vcf, &header, uncompressed, format)?;
        Ok(OrderedVcfWriter {
            vcf_writer,
            reference,
            map_store: Default::default(),
            current_index: 0,
            last_position: None,
            records_written: 0
        })
    }

    /// Returns the region index that the writer is currently waiting to receive.
    pub fn get_wait_region(&self) -> usize {
        self.current_index
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Adds a region result to our queue for writing.
    /// # Arguments
    /// * `output` - a finished region that will be written in the correct order with the others
    /// # Errors
    /// * if the region index was already written or is already queued
    /// * if writing fails
    pub fn write_region(&mut self, output: RegionOutput) -> Result<(), Box<dyn std::error::Error>> {
        let region_index = output.region_index;
        if region_index < self.current_index {
            bail!("Region index {} is smaller than next expected index {}", region_index, self.current_index);
        }
        if self.map_store.insert(region_index, output).is_some() {
            bail!("Region index {} was already present in the map_store", region_index);
        }
        self.drain_map_store()
    }

    /// Writes stored regions in order until the next expected one is missing.
    fn drain_map_store(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        while let Some(output) = self.map_store.remove(&self.current_index) {
            trace!("Draining region {} ({})", self.current_index, output.region);
            self.write_calls(&output.calls)?;
            self.current_index += 1;
        }
        Ok(())
    }

    /// Returns true if every region handed over so far has been written.
    pub fn is_drained(&self) -> bool {
        self.map_store.is_empty()
    }

    /// Writes calls immediately, bypassing region ordering.
    /// # Errors
    /// * if a call is before an already written record
    /// * if a call position is outside the reference
    /// * if htslib rejects the record
    pub fn write_calls(&mut self, calls: &[GenotypeCall]) -> Result<(), Box<dyn std::error::Error>> {
        for call in calls.iter() {
            let abs_pos = call.candidate().abs_pos();
            if self.last_position.is_some_and(|p| abs_pos < p) {
                bail!("Record at {} arrived after a record at {:?}", abs_pos, self.last_position);
            }
            self.write_call(call)?;
            self.last_position = Some(abs_pos);
            self.records_written += 1;
        }
        Ok(())
    }

    fn write_call(&mut self, call: &GenotypeCall) -> Result<(), Box<dyn std::error::Error>> {
        let abs_pos = call.candidate().abs_pos();
        let Some((chrom, pos)) = self.reference.contig_position(abs_pos) else {
            bail!("Record position {} is outside the reference", abs_pos);
        };

        let mut record = self.vcf_writer.empty_record();
        let rid = self.vcf_writer.header().name2rid(chrom.as_bytes())?;
        record.set_rid(Some(rid));
        record.set_pos(pos as i64);
        if !call.ids().is_empty() {
            record.set_id(call.ids().join(";").as_bytes())?;
        }
        let alleles: Vec<&[u8]> = call.candidate().seqs().iter().map(|s| s.as_slice()).collect();
        record.set_alleles(&alleles)?;
        record.set_qual(call.qual() as f32);

        if let Some(tag) = call.variant_type().svtype_tag() {
            record.push_info_string(b"SVTYPE", &[tag.as_bytes()])?;
        }
        if call.is_low_confidence() {
            record.push_info_flag(b"LC")?;
        }

        let num_alleles = call.candidate().num_alleles();
        let mut genotypes: Vec<GenotypeAllele> = Vec::with_capacity(2 * call.genotypes().len());
        let mut allele_depths: Vec<i32> = Vec::with_capacity(num_alleles * call.genotypes().len());
        let mut depths: Vec<i32> = Vec::with_capacity(call.genotypes().len());
        let mut qualities: Vec<i32> = Vec::with_capacity(call.genotypes().len());
        for genotype in call.genotypes().iter() {
            match genotype.alleles() {
                Some((a, b)) => {
                    genotypes.push(GenotypeAllele::Unphased(a as i32));
                    genotypes.push(GenotypeAllele::Unphased(b as i32));
                    qualities.push(genotype.gq() as i32);
                },
                None => {
                    genotypes.push(GenotypeAllele::UnphasedMissing);
                    genotypes.push(GenotypeAllele::UnphasedMissing);
                    qualities.push(MISSING_INTEGER);
                }
            };
            allele_depths.extend(genotype.allele_depths().iter().map(|&d| d as i32));
            depths.push(genotype.depth() as i32);
        }
        record.push_genotypes(&genotypes)?;
        record.push_format_integer(b"AD", &allele_depths)?;
        record.push_format_integer(b"DP", &depths)?;
        record.push_format_integer(b"GQ", &qualities)?;

        self.vcf_writer.write(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::genomic_region::GenomicRegion;
    use crate::data_types::variant_candidate::VariantCandidate;
    use crate::data_types::variants::VariantType;
    use crate::pipeline::RegionStats;
    use crate::variant_map::SampleGenotype;
    use rust_htslib::bcf::Read;

    fn reference() -> Arc<ReferenceGenome> {
        Arc::new(ReferenceGenome::from_contigs(vec![
            ("chr1".to_string(), b"ACGTACGT".to_vec()),
            ("chr2".to_string(), b"ACCATGTA".to_vec())
        ]))
    }

    fn call(abs_pos: u64, seqs: &[&str], genotype: Option<(usize, usize)>) -> GenotypeCall {
        let candidate = VariantCandidate::new(abs_pos, seqs.iter().map(|s| s.as_bytes().to_vec()).collect()).unwrap();
        let depths = vec![3; seqs.len()];
        GenotypeCall::new(candidate, VariantType::Snv, vec![], vec![SampleGenotype::new(genotype, depths, 30)], 40.0)
    }

    fn output(region_index: usize, calls: Vec<GenotypeCall>) -> RegionOutput {
        RegionOutput {
            region_index,
            region: GenomicRegion::new("chr1", 0, 8),
            calls,
            stats: RegionStats::default()
        }
    }

    #[test]
    fn test_ordered_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ordered.vcf");
        {
            let mut writer = OrderedVcfWriter::new(&path, reference(), &["sample1".to_string()]).unwrap();
            // region 1 arrives first and must wait
            writer.write_region(output(1, vec![call(9, &["C", "A"], None)])).unwrap();
            assert_eq!(writer.records_written(), 0);
            assert_eq!(writer.get_wait_region(), 0);
            writer.write_region(output(0, vec![call(1, &["C", "T"], Some((1, 1))), call(5, &["C", "CG"], Some((0, 1)))])).unwrap();
            assert_eq!(writer.records_written(), 3);
            assert!(writer.is_drained());
            assert!(writer.write_region(output(1, vec![])).is_err());
        }

        let mut reader = bcf::Reader::from_path(&path).unwrap();
        let records: Vec<bcf::Record> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        let header = reader.header();
        let positions: Vec<(String, i64)> = records.iter()
            .map(|r| (String::from_utf8(header.rid2name(r.rid().unwrap()).unwrap().to_vec()).unwrap(), r.pos()))
            .collect();
        assert_eq!(positions, vec![("chr1".to_string(), 1), ("chr1".to_string(), 5), ("chr2".to_string(), 1)]);
        assert_eq!(records[0].alleles(), vec![b"C" as &[u8], b"T"]);

        let genotypes = records[0].genotypes().unwrap();
        assert_eq!(genotypes.get(0).to_string(), "1/1");
        let genotypes = records[2].genotypes().unwrap();
        assert_eq!(genotypes.get(0).to_string(), "./.");
        let depths = records[1].format(b"AD").integer().unwrap();
        assert_eq!(depths[0], &[3, 3]);
    }

    #[test]
    fn test_out_of_order_calls() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("unordered.vcf");
        let mut writer = OrderedVcfWriter::new(&path, reference(), &["sample1".to_string()]).unwrap();
        writer.write_calls(&[call(5, &["C", "T"], Some((0, 1)))]).unwrap();
        assert!(writer.write_calls(&[call(1, &["C", "T"], Some((0, 1)))]).is_err());
        // past the reference end
        assert!(writer.write_calls(&[call(100, &["C", "T"], Some((0, 1)))]).is_err());
    }
}
