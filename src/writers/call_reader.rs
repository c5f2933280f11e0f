
use crate::data_types::genomic_region::GenomicRegion;
use crate::data_types::reference_genome::{AbsolutePosition, InputError, ReferenceGenome};
use crate::data_types::variant_candidate::VariantCandidate;
use crate::data_types::variants::VariantType;
use crate::variant_map::{GenotypeCall, SampleGenotype};

use log::{debug, trace};
use rust_htslib::bcf;
use rust_htslib::bcf::Read;
use rust_htslib::bcf::record::GenotypeAllele;
use std::path::Path;

/// Cap on GQ read back from a file
const MAX_GQ: i32 = 99;

/// Everything read back from a genotyped VCF
#[derive(Debug)]
pub struct CallFile {
    /// sample columns, in file order
    pub sample_names: Vec<String>,
    /// one call per record kept, in file order
    pub calls: Vec<GenotypeCall>,
    /// records with symbolic or spanning-deletion alleles that were left out
    pub skipped: usize
}

/// Converts one GT field into a diploid pair, haploid calls are doubled.
fn parse_genotype(alleles: &[GenotypeAllele]) -> Option<(usize, usize)> {
    let indices: Vec<Option<usize>> = alleles.iter()
        .map(|allele| match allele {
            GenotypeAllele::Unphased(at) | GenotypeAllele::Phased(at) => usize::try_from(*at).ok(),
            GenotypeAllele::UnphasedMissing | GenotypeAllele::PhasedMissing => None
        })
        .collect();
    match indices.as_slice() {
        [Some(a)] => Some((*a, *a)),
        [Some(a), Some(b), ..] => Some((*a, *b)),
        _ => None
    }
}

/// Reads the per-sample genotypes, depths, and qualities of one record.
/// Missing values become a missing genotype, zero depth, and zero GQ.
fn read_genotypes(record: &bcf::Record, num_samples: usize, num_alleles: usize) -> Vec<SampleGenotype> {
    if num_samples == 0 {
        return vec![];
    }
    let genotypes: Vec<Option<(usize, usize)>> = match record.genotypes() {
        Ok(g) => (0..num_samples).map(|i| parse_genotype(&g.get(i))).collect(),
        Err(_) => vec![None; num_samples]
    };
    let depths: Vec<Vec<u32>> = match record.format(b"AD").integer() {
        Ok(values) => values.iter()
            .map(|sample| {
                let mut depths: Vec<u32> = sample.iter().take(num_alleles).map(|&d| d.max(0) as u32).collect();
                depths.resize(num_alleles, 0);
                depths
            })
            .collect(),
        Err(_) => vec![vec![0; num_alleles]; num_samples]
    };
    let qualities: Vec<u8> = match record.format(b"GQ").integer() {
        Ok(values) => values.iter()
            .map(|sample| sample.first().map(|&q| q.clamp(0, MAX_GQ) as u8).unwrap_or_default())
            .collect(),
        Err(_) => vec![0; num_samples]
    };

    genotypes.into_iter().zip(depths).zip(qualities)
        .map(|((alleles, allele_depths), gq)| {
            // a genotype pointing past the alleles is unusable
            let alleles = alleles.filter(|&(a, b)| a < num_alleles && b < num_alleles);
            SampleGenotype::new(alleles, allele_depths, gq)
        })
        .collect()
}

/// Returns true if an allele is not spelled out in bases
fn is_symbolic(allele: &[u8]) -> bool {
    allele.first() == Some(&b'<') || allele.contains(&b'[') || allele.contains(&b']') || allele == b"*"
}

/// Reads the genotype calls of a VCF/BCF file back into memory.
/// # Arguments
/// * `filename` - the VCF to read
/// * `reference` - gives every record an absolute position
/// * `region` - if set, only records starting inside it are kept
/// # Errors
/// * if the file cannot be opened or parsed
/// * if a record is on a contig that is not in the reference
pub fn read_calls(filename: &Path, reference: &ReferenceGenome, region: Option<&GenomicRegion>) -> Result<CallFile, Box<dyn std::error::Error>> {
    let mut vcf_reader = bcf::Reader::from_path(filename).map_err(|e| InputError::Unreadable {
        path: filename.to_path_buf(),
        message: e.to_string()
    })?;
    let vcf_header: bcf::header::HeaderView = vcf_reader.header().clone();
    let sample_names: Vec<String> = vcf_header.samples().iter()
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect();
    let num_samples = sample_names.len();

    let mut calls: Vec<GenotypeCall> = vec![];
    let mut skipped: usize = 0;
    for record_result in vcf_reader.records() {
        let record = record_result?;
        let Some(rid) = record.rid() else {
            return Err(Box::new(InputError::BadRegion {
                region: format!("{}", record.pos() + 1),
                message: "record has no contig".to_string()
            }));
        };
        let chromosome: &str = std::str::from_utf8(vcf_header.rid2name(rid)?)?;
        let position: u64 = record.pos() as u64;
        if let Some(r) = region {
            if r.chrom() != chromosome || position < r.begin() || position >= r.end() {
                continue;
            }
        }

        let alleles: Vec<Vec<u8>> = record.alleles().iter().map(|a| a.to_ascii_uppercase()).collect();
        if alleles.len() < 2 || alleles[1..].iter().any(|a| is_symbolic(a)) {
            debug!("Skipping {}:{}, alleles are not all sequences", chromosome, position + 1);
            skipped += 1;
            continue;
        }

        let abs_pos: AbsolutePosition = reference.absolute_position(chromosome, position)?;
        let num_alleles = alleles.len();
        let candidate = VariantCandidate::new(abs_pos, alleles)?;
        let variant_type = match record.info(b"SVTYPE").string() {
            Ok(Some(values)) => match values.first() {
                Some(tag) => VariantType::from_svtype_tag(&String::from_utf8_lossy(tag))?,
                None => candidate.variant_type()
            },
            _ => candidate.variant_type()
        };
        let ids: Vec<String> = {
            let raw = record.id();
            if raw == b"." {
                vec![]
            } else {
                String::from_utf8_lossy(&raw).split(';').map(|s| s.to_string()).collect()
            }
        };
        let qual: f64 = if record.qual().is_nan() { 0.0 } else { record.qual() as f64 };
        let low_confidence: bool = record.info(b"LC").flag().unwrap_or(false);

        let genotypes = read_genotypes(&record, num_samples, num_alleles);
        let mut call = GenotypeCall::new(candidate, variant_type, ids, genotypes, qual);
        call.set_low_confidence(low_confidence);
        trace!("Read {}:{} with {} alleles", chromosome, position + 1, num_alleles);
        calls.push(call);
    }

    Ok(CallFile {
        sample_names,
        calls,
        skipped
    })
}
