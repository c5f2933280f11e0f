
use crate::data_types::reference_genome::{AbsolutePosition, InputError, ReferenceGenome};
use crate::data_types::variant_candidate::VariantCandidate;
use crate::data_types::variants::{CatalogueVariant, VariantError, VariantType};

use bio::alphabets::dna::revcomp;
use log::{debug, info, trace};
use rust_htslib::bcf;
use std::path::Path;

/// The known variants to genotype, sorted by absolute position.
#[derive(Clone, Debug, Default)]
pub struct VariantCatalogue {
    variants: Vec<CatalogueVariant>,
    /// records that could not be represented
    rejected: usize,
    /// structural variants left out because SVs were not requested
    skipped_sv: usize
}

/// Looks up the first value of a string INFO field, None if absent.
fn info_string(record: &bcf::Record, tag: &[u8]) -> Option<String> {
    match record.info(tag).string() {
        Ok(Some(values)) => values.first().map(|v| String::from_utf8_lossy(v).to_string()),
        _ => None
    }
}

/// Looks up the first value of an integer INFO field, None if absent.
fn info_integer(record: &bcf::Record, tag: &[u8]) -> Option<i64> {
    match record.info(tag).integer() {
        Ok(Some(values)) => values.first().map(|&v| v as i64),
        _ => None
    }
}

/// Gets the variant type from the SVTYPE tag or, failing that, a symbolic ALT like `<DEL>`.
/// # Errors
/// * if the tag is present but not one we handle
fn get_sv_type(record: &bcf::Record, alleles: &[Vec<u8>]) -> Result<Option<VariantType>, VariantError> {
    if let Some(svtype) = info_string(record, b"SVTYPE") {
        return Ok(Some(VariantType::from_svtype_tag(&svtype)?));
    }
    for allele in alleles.iter().skip(1) {
        if allele.first() == Some(&b'<') && allele.last() == Some(&b'>') {
            let tag = String::from_utf8_lossy(&allele[1..allele.len() - 1]).to_string();
            return Ok(Some(VariantType::from_svtype_tag(&tag)?));
        }
    }
    Ok(None)
}

/// Returns true if an ALT allele cannot be spelled out directly
fn is_symbolic(allele: &[u8]) -> bool {
    allele.first() == Some(&b'<') || allele.contains(&b'[') || allele.contains(&b']') || allele == b"*"
}

/// Converts one symbolic SV record into explicit REF and ALT sequences.
/// # Arguments
/// * `record` - the VCF record, used for END, SVLEN, and SEQ
/// * `variant_type` - the SV type
/// * `contig` - the full contig sequence
/// * `position` - 0-based position of the padding base
/// * `symbolic` - the symbolic allele, for error messages
/// # Errors
/// * if the SV is a breakend or lacks the fields needed to resolve it
/// * if the SV runs past the end of the contig
fn resolve_symbolic(record: &bcf::Record, variant_type: VariantType, contig: &[u8], position: usize, symbolic: &[u8]) -> Result<Vec<Vec<u8>>, VariantError> {
    let unresolved = || VariantError::UnresolvedSymbolic { allele: String::from_utf8_lossy(symbolic).to_string() };
    if position >= contig.len() {
        return Err(VariantError::PastContigEnd);
    }
    let padding: u8 = contig[position].to_ascii_uppercase();

    if variant_type == VariantType::SvInsertion {
        let inserted = info_string(record, b"SEQ").ok_or_else(unresolved)?;
        let mut alt: Vec<u8> = vec![padding];
        alt.extend(inserted.to_ascii_uppercase().bytes());
        return Ok(vec![vec![padding], alt]);
    }

    // everything else spans [position, end) on the reference
    let end: usize = match info_integer(record, b"END") {
        Some(end) if end > position as i64 => end as usize,
        _ => match info_integer(record, b"SVLEN") {
            Some(svlen) if svlen != 0 => position + 1 + svlen.unsigned_abs() as usize,
            _ => return Err(unresolved())
        }
    };
    if end > contig.len() {
        return Err(VariantError::PastContigEnd);
    }
    let span: Vec<u8> = contig[position..end].to_ascii_uppercase();

    let alt: Vec<u8> = match variant_type {
        VariantType::SvDeletion => vec![padding],
        VariantType::SvDuplication => {
            let mut alt = span.clone();
            alt.extend_from_slice(&span[1..]);
            alt
        },
        VariantType::SvInversion => {
            let mut alt = vec![padding];
            alt.extend(revcomp(&span[1..]));
            alt
        },
        _ => return Err(unresolved())
    };
    Ok(vec![span, alt])
}

impl VariantCatalogue {
    /// Wraps a list of variants, sorting them by position.
    pub fn new(mut variants: Vec<CatalogueVariant>) -> VariantCatalogue {
        variants.sort_by(|a, b| a.candidate().cmp(b.candidate()));
        VariantCatalogue {
            variants,
            rejected: 0,
            skipped_sv: 0
        }
    }

    /// Loads every record from a VCF/BCF file.
    /// An empty path means there are no prior variants.
    /// # Arguments
    /// * `filename` - the variant file, may be empty
    /// * `reference` - the reference genome, used for absolute coordinates and to resolve symbolic alleles
    /// * `is_sv` - if false, structural variants are skipped
    /// # Errors
    /// * if the file is missing or cannot be parsed
    /// * if a record is on a contig that is not in the reference
    pub fn from_vcf(filename: &Path, reference: &ReferenceGenome, is_sv: bool) -> Result<VariantCatalogue, Box<dyn std::error::Error>> {
        use rust_htslib::bcf::Read;

        if filename.as_os_str().is_empty() {
            debug!("No variant catalogue provided, starting from an empty catalogue");
            return Ok(Default::default());
        }

        let mut vcf_reader = bcf::Reader::from_path(filename).map_err(|e| InputError::Unreadable {
            path: filename.to_path_buf(),
            message: e.to_string()
        })?;
        let vcf_header: bcf::header::HeaderView = vcf_reader.header().clone();

        let mut variants: Vec<CatalogueVariant> = vec![];
        let mut rejected: usize = 0;
        let mut skipped_sv: usize = 0;
        for record_result in vcf_reader.records() {
            let record = record_result?;
            let chromosome: String = match record.rid() {
                Some(rid) => std::str::from_utf8(vcf_header.rid2name(rid)?)?.to_string(),
                None => {
                    return Err(Box::new(InputError::BadRegion {
                        region: format!("{}", record.pos() + 1),
                        message: "record has no contig".to_string()
                    }));
                }
            };
            let position: u64 = record.pos() as u64;
            let abs_pos: AbsolutePosition = reference.absolute_position(&chromosome, position)?;
            let alleles: Vec<Vec<u8>> = record.alleles().iter().map(|a| a.to_vec()).collect();

            let sv_type = match get_sv_type(&record, &alleles) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Rejecting {}:{}: {}", chromosome, position + 1, e);
                    rejected += 1;
                    continue;
                }
            };
            if !is_sv && sv_type.is_some() {
                skipped_sv += 1;
                continue;
            }

            let id: Option<String> = {
                let raw = record.id();
                if raw == b"." { None } else { Some(String::from_utf8_lossy(&raw).to_string()) }
            };

            let converted = Self::convert_record(&record, &alleles, sv_type, reference.get_full_chromosome(&chromosome), position as usize)
                .and_then(|seqs| VariantCandidate::new(abs_pos, seqs))
                .and_then(|candidate| CatalogueVariant::new(candidate, sv_type, id));
            match converted {
                Ok(variant) => {
                    if !is_sv && variant.get_type().is_sv() {
                        skipped_sv += 1;
                    } else {
                        variants.push(variant);
                    }
                },
                Err(e) => {
                    debug!("Rejecting {}:{}: {}", chromosome, position + 1, e);
                    rejected += 1;
                }
            };
        }

        info!("Loaded {} variants from {:?}, rejected {}, skipped {} structural variants", variants.len(), filename, rejected, skipped_sv);
        let mut catalogue = VariantCatalogue::new(variants);
        catalogue.rejected = rejected;
        catalogue.skipped_sv = skipped_sv;
        Ok(catalogue)
    }

    /// Turns the record alleles into explicit uppercase sequences, dropping spanning-deletion `*` alleles.
    fn convert_record(record: &bcf::Record, alleles: &[Vec<u8>], sv_type: Option<VariantType>, contig: &[u8], position: usize) -> Result<Vec<Vec<u8>>, VariantError> {
        if alleles.len() < 2 {
            return Err(VariantError::NoAlleles);
        }
        if sv_type == Some(VariantType::SvBreakend) {
            return Err(VariantError::UnresolvedSymbolic { allele: String::from_utf8_lossy(&alleles[1]).to_string() });
        }

        let symbolic: Vec<&Vec<u8>> = alleles[1..].iter().filter(|a| is_symbolic(a) && a.as_slice() != b"*").collect();
        if let Some(&allele) = symbolic.first() {
            if alleles.len() > 2 {
                return Err(VariantError::UnresolvedSymbolic { allele: String::from_utf8_lossy(allele).to_string() });
            }
            let variant_type = sv_type.ok_or_else(|| VariantError::UnresolvedSymbolic { allele: String::from_utf8_lossy(allele).to_string() })?;
            trace!("Resolving symbolic allele {:?}", String::from_utf8_lossy(allele));
            return resolve_symbolic(record, variant_type, contig, position, allele);
        }

        let mut seqs: Vec<Vec<u8>> = Vec::with_capacity(alleles.len());
        seqs.push(alleles[0].to_ascii_uppercase());
        seqs.extend(alleles[1..].iter()
            .filter(|a| a.as_slice() != b"*")
            .map(|a| a.to_ascii_uppercase()));
        if seqs.len() < 2 {
            return Err(VariantError::NoAlleles);
        }
        Ok(seqs)
    }

    pub fn variants(&self) -> &[CatalogueVariant] {
        &self.variants
    }

    /// Variants whose first reference base is in `[begin, end)`
    pub fn in_range(&self, begin: AbsolutePosition, end: AbsolutePosition) -> &[CatalogueVariant] {
        let start = self.variants.partition_point(|v| v.position() < begin);
        let stop = self.variants.partition_point(|v| v.position() < end);
        &self.variants[start..stop.max(start)]
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn skipped_sv(&self) -> usize {
        self.skipped_sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn reference() -> ReferenceGenome {
        ReferenceGenome::from_fasta(&PathBuf::from("./test_data/test_reference.fa")).unwrap()
    }

    fn seqs(variant: &CatalogueVariant) -> Vec<String> {
        variant.candidate().seqs().iter().map(|s| String::from_utf8(s.clone()).unwrap()).collect()
    }

    #[test]
    fn test_empty_path() {
        let catalogue = VariantCatalogue::from_vcf(Path::new(""), &reference(), true).unwrap();
        assert!(catalogue.is_empty());
        assert_eq!(catalogue.rejected(), 0);
    }

    #[test]
    fn test_missing_file() {
        let result = VariantCatalogue::from_vcf(Path::new("./test_data/does_not_exist.vcf"), &reference(), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_small_variants_only() {
        let catalogue = VariantCatalogue::from_vcf(Path::new("./test_data/test_catalogue.vcf"), &reference(), false).unwrap();
        assert_eq!(catalogue.len(), 2);
        assert_eq!(catalogue.skipped_sv(), 5);
        assert_eq!(catalogue.rejected(), 0);

        let snp = &catalogue.variants()[0];
        assert_eq!(snp.position(), 1);
        assert_eq!(snp.id(), Some("snp1"));
        assert_eq!(snp.get_type(), VariantType::Snv);
        assert_eq!(seqs(snp), vec!["C", "T"]);

        let multi = &catalogue.variants()[1];
        assert_eq!(multi.position(), 2);
        assert_eq!(multi.id(), None);
        assert_eq!(seqs(multi), vec!["G", "A", "GTT"]);
    }

    #[test]
    fn test_structural_variants() {
        let catalogue = VariantCatalogue::from_vcf(Path::new("./test_data/test_catalogue.vcf"), &reference(), true).unwrap();
        assert_eq!(catalogue.len(), 5);
        // breakend and insertion without SEQ
        assert_eq!(catalogue.rejected(), 2);
        assert_eq!(catalogue.skipped_sv(), 0);

        // chr2 starts at absolute 8, ACCATGTA
        let sv: Vec<&CatalogueVariant> = catalogue.in_range(8, 16).iter().collect();
        assert_eq!(sv.len(), 3);

        assert_eq!(sv[0].id(), Some("del1"));
        assert_eq!(sv[0].position(), 9);
        assert_eq!(sv[0].get_type(), VariantType::SvDeletion);
        assert_eq!(seqs(sv[0]), vec!["CCAT", "C"]);

        assert_eq!(sv[1].id(), Some("ins1"));
        assert_eq!(sv[1].get_type(), VariantType::SvInsertion);
        assert_eq!(seqs(sv[1]), vec!["C", "CAAAA"]);

        assert_eq!(sv[2].id(), Some("inv1"));
        assert_eq!(sv[2].get_type(), VariantType::SvInversion);
        assert_eq!(seqs(sv[2]), vec!["ATGT", "AACA"]);
    }

    #[test]
    fn test_unknown_contig() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("catalogue.vcf");
        std::fs::write(&path, "##fileformat=VCFv4.2\n##contig=<ID=chrX,length=10>\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\nchrX\t2\t.\tA\tC\t.\tPASS\t.\n").unwrap();
        let result = VariantCatalogue::from_vcf(&path, &reference(), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_in_range() {
        let make = |pos: u64| CatalogueVariant::new(VariantCandidate::new(pos, vec![b"A".to_vec(), b"C".to_vec()]).unwrap(), None, None).unwrap();
        let catalogue = VariantCatalogue::new(vec![make(10), make(2), make(5), make(5)]);
        assert_eq!(catalogue.variants()[0].position(), 2);
        assert_eq!(catalogue.in_range(0, 5).len(), 1);
        assert_eq!(catalogue.in_range(5, 6).len(), 2);
        assert_eq!(catalogue.in_range(6, 10).len(), 0);
        assert_eq!(catalogue.in_range(0, 100).len(), 4);
        assert_eq!(catalogue.in_range(20, 10).len(), 0);
    }
}
