
use crate::data_types::reference_genome::ReferenceGenome;
use crate::data_types::variant_candidate::VariantCandidate;
use crate::data_types::variants::VariantType;
use crate::variant_map::{GenotypeCall, SampleGenotype};
use crate::writers::call_reader::read_calls;
use crate::writers::ordered_vcf_writer::OrderedVcfWriter;

use log::{debug, info, warn};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use simple_error::bail;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One output record while the inputs are being merged
struct MergedSite {
    candidate: VariantCandidate,
    /// from the first input with this site
    variant_type: VariantType,
    /// from the first input with this site
    ids: Vec<String>,
    /// one entry per output sample, missing until an input fills it
    genotypes: Vec<SampleGenotype>,
    /// highest QUAL over the inputs
    qual: f64,
    low_confidence: bool
}

/// Merges genotyped VCFs of different samples into one multi-sample VCF.
/// Records are matched on position and alleles; a sample without a record at a site gets a missing genotype.
/// Output samples are the input samples in input order, and the output is position-sorted.
/// # Arguments
/// * `inputs` - VCFs with disjoint samples
/// * `output` - the output path, format chosen by extension
/// * `reference` - the reference the calls were made against
/// # Returns
/// the number of records written
/// # Errors
/// * if an input cannot be read or uses a contig the reference lacks
/// * if a sample name appears in more than one input
pub fn merge_vcfs(inputs: &[PathBuf], output: &Path, reference: Arc<ReferenceGenome>) -> Result<u64, Box<dyn std::error::Error>> {
    if inputs.is_empty() {
        bail!("No VCF files to merge");
    }

    let mut call_files = Vec::with_capacity(inputs.len());
    let mut sample_names: Vec<String> = vec![];
    let mut seen_samples: HashSet<String> = Default::default();
    for input in inputs.iter() {
        let call_file = read_calls(input, &reference, None)?;
        if call_file.skipped > 0 {
            warn!("Left out {} records with symbolic alleles from {:?}", call_file.skipped, input);
        }
        for sample_name in call_file.sample_names.iter() {
            if !seen_samples.insert(sample_name.clone()) {
                bail!("Sample {:?} in {:?} is already in an earlier input", sample_name, input);
            }
            sample_names.push(sample_name.clone());
        }
        call_files.push(call_file);
    }
    let num_samples = sample_names.len();

    let mut site_lookup: HashMap<VariantCandidate, usize> = Default::default();
    let mut sites: Vec<MergedSite> = vec![];
    let mut sample_offset: usize = 0;
    for (call_file, input) in call_files.into_iter().zip(inputs.iter()) {
        let mut filled: HashSet<usize> = Default::default();
        for call in call_file.calls.iter() {
            let site_index = match site_lookup.get(call.candidate()) {
                Some(&index) => index,
                None => {
                    let num_alleles = call.candidate().num_alleles();
                    site_lookup.insert(call.candidate().clone(), sites.len());
                    sites.push(MergedSite {
                        candidate: call.candidate().clone(),
                        variant_type: call.variant_type(),
                        ids: call.ids().to_vec(),
                        genotypes: vec![SampleGenotype::new(None, vec![0; num_alleles], 0); num_samples],
                        qual: 0.0,
                        low_confidence: false
                    });
                    sites.len() - 1
                }
            };
            if !filled.insert(site_index) {
                debug!("Duplicate record at {} in {:?}, keeping the first", call.candidate().abs_pos(), input);
                continue;
            }

            let site = &mut sites[site_index];
            site.qual = site.qual.max(call.qual());
            site.low_confidence |= call.is_low_confidence();
            for (i, genotype) in call.genotypes().iter().enumerate() {
                site.genotypes[sample_offset + i] = genotype.clone();
            }
        }
        sample_offset += call_file.sample_names.len();
    }

    let mut records: Vec<GenotypeCall> = sites.into_iter()
        .map(|site| {
            let mut record = GenotypeCall::new(site.candidate, site.variant_type, site.ids, site.genotypes, site.qual);
            record.set_low_confidence(site.low_confidence);
            record
        })
        .collect();
    records.sort_by(|a, b| a.candidate().cmp(b.candidate()));

    let mut vcf_writer = OrderedVcfWriter::new(output, reference.clone(), &sample_names)?;
    vcf_writer.write_calls(&records)?;
    info!("Merged {} samples from {} files into {} records", num_samples, inputs.len(), vcf_writer.records_written());
    Ok(vcf_writer.records_written())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bcf;
    use rust_htslib::bcf::Read;

    fn reference() -> Arc<ReferenceGenome> {
        Arc::new(ReferenceGenome::from_contigs(vec![
            ("chr1".to_string(), b"ACGTACGTACGTACGTACGT".to_vec())
        ]))
    }

    fn write_vcf(dir: &Path, name: &str, samples: &[&str], lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut content = String::from("##fileformat=VCFv4.2
##contig=<ID=chr1,length=20>
##INFO=<ID=LC,Number=0,Type=Flag,Description=\"Low confidence\">
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">
##FORMAT=<ID=AD,Number=R,Type=Integer,Description=\"Read depth per allele\">
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT");
        for sample in samples.iter() {
            content.push('\t');
            content.push_str(sample);
        }
        content.push('\n');
        for line in lines.iter() {
            content.push_str(&line.replace(' ', "\t"));
            content.push('\n');
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_merge() {
        let temp_dir = tempfile::tempdir().unwrap();
        let a = write_vcf(temp_dir.path(), "a.vcf", &["s1"], &[
            "chr1 2 rs1 C A 40 . . GT:AD 0/1:3,3",
            "chr1 5 . A G 60 . . GT:AD 1/1:0,5"
        ]);
        let b = write_vcf(temp_dir.path(), "b.vcf", &["s2", "s3"], &[
            "chr1 5 . A G 30 . LC GT:AD 0/1:2,2 0/0:4,0",
            "chr1 5 . A T 30 . . GT:AD 0/1:2,2 0/0:4,0",
            "chr1 9 . A T 50 . . GT:AD 1/1:0,6 ./.:0,0"
        ]);
        let output = temp_dir.path().join("merged.vcf");
        assert_eq!(merge_vcfs(&[a, b], &output, reference()).unwrap(), 4);

        let mut reader = bcf::Reader::from_path(&output).unwrap();
        let samples: Vec<Vec<u8>> = reader.header().samples().iter().map(|s| s.to_vec()).collect();
        assert_eq!(samples, vec![b"s1".to_vec(), b"s2".to_vec(), b"s3".to_vec()]);

        let records: Vec<bcf::Record> = reader.records().map(|r| r.unwrap()).collect();
        let sites: Vec<(i64, Vec<u8>)> = records.iter().map(|r| (r.pos(), r.alleles()[1].to_vec())).collect();
        assert_eq!(sites, vec![(1, b"A".to_vec()), (4, b"G".to_vec()), (4, b"T".to_vec()), (8, b"T".to_vec())]);

        let genotypes = records[0].genotypes().unwrap();
        assert_eq!(genotypes.get(0).to_string(), "0/1");
        assert_eq!(genotypes.get(1).to_string(), "./.");
        assert_eq!(records[0].id(), b"rs1".to_vec());

        // a site shared by both inputs
        let genotypes = records[1].genotypes().unwrap();
        assert_eq!(genotypes.get(0).to_string(), "1/1");
        assert_eq!(genotypes.get(1).to_string(), "0/1");
        assert_eq!(genotypes.get(2).to_string(), "0/0");
        assert_eq!(records[1].qual(), 60.0);
        assert!(records[1].info(b"LC").flag().unwrap());

        let genotypes = records[3].genotypes().unwrap();
        assert_eq!(genotypes.get(0).to_string(), "./.");
        assert_eq!(genotypes.get(1).to_string(), "1/1");
    }

    #[test]
    fn test_merge_errors() {
        let temp_dir = tempfile::tempdir().unwrap();
        let a = write_vcf(temp_dir.path(), "a.vcf", &["s1"], &["chr1 2 . C A 40 . . GT:AD 0/1:3,3"]);
        let output = temp_dir.path().join("merged.vcf");
        assert!(merge_vcfs(&[], &output, reference()).is_err());
        // the same sample twice
        assert!(merge_vcfs(&[a.clone(), a], &output, reference()).is_err());
    }
}
