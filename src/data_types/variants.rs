
use crate::data_types::variant_candidate::VariantCandidate;

use serde::{Deserialize, Serialize};

/// All the variant types we are currently allowing
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize, strum_macros::AsRefStr, strum_macros::EnumCount)]
pub enum VariantType {
    /// REF and ALT are all length = 1
    Snv=0,
    /// REF and ALT are all the same length > 1
    Mnp,
    /// REF length = 1, ALT length > 1
    Insertion,
    /// REF length > 1, ALT length = 1
    Deletion,
    /// Mixed REF and ALT lengths
    Indel,
    /// Tagged with SVTYPE=INS or an insertion of at least the SV length
    SvInsertion,
    /// Tagged with SVTYPE=DEL or a deletion of at least the SV length
    SvDeletion,
    /// Tagged with SVTYPE=DUP
    SvDuplication,
    /// Tagged with SVTYPE=INV
    SvInversion,
    /// Tagged with SVTYPE=BND, these cannot be represented in a linear graph
    SvBreakend,
    /// Tagged with TRID=####
    TandemRepeat,
    /// Something that doesn't match the above criteria
    Unknown // make sure Unknown is always the last one in the list
}

impl VariantType {
    /// Returns true if this is one of the structural variant types
    pub fn is_sv(&self) -> bool {
        matches!(self,
            VariantType::SvInsertion | VariantType::SvDeletion | VariantType::SvDuplication |
            VariantType::SvInversion | VariantType::SvBreakend
        )
    }

    /// Returns the VCF SVTYPE tag for structural types
    pub fn svtype_tag(&self) -> Option<&'static str> {
        match self {
            VariantType::SvInsertion => Some("INS"),
            VariantType::SvDeletion => Some("DEL"),
            VariantType::SvDuplication => Some("DUP"),
            VariantType::SvInversion => Some("INV"),
            VariantType::SvBreakend => Some("BND"),
            _ => None
        }
    }

    /// Parses an SVTYPE tag from a VCF record
    /// # Errors
    /// * if the tag is not one we recognize
    pub fn from_svtype_tag(tag: &str) -> Result<VariantType, VariantError> {
        Ok(match tag {
            "DEL" => VariantType::SvDeletion,
            "INS" => VariantType::SvInsertion,
            "DUP" | "DUP:TANDEM" => VariantType::SvDuplication,
            "INV" => VariantType::SvInversion,
            "BND" => VariantType::SvBreakend,
            _ => {
                return Err(VariantError::UnhandledSvType { tag: tag.to_string() });
            }
        })
    }
}

/// Zygosity definitions, mostly used for call statistics
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Zygosity {
    HomozygousReference=0,
    Heterozygous,
    HomozygousAlternate,
    Unknown // make sure Unknown is always the last one in the list
}

#[derive(thiserror::Error, Debug)]
pub enum VariantError {
    #[error("a variant must have at least one allele")]
    NoAlleles,
    #[error("allele{index} is empty (length = 0)")]
    EmptyAllele{ index: usize },
    #[error("allele{index} is identical to the reference allele")]
    AlleleMatchesReference{ index: usize },
    #[error("reference allele does not match the reference genome at {position}")]
    ReferenceMismatch{ position: u64 },
    #[error("unhandled SVTYPE tag: {tag:?}")]
    UnhandledSvType{ tag: String },
    #[error("symbolic allele {allele:?} cannot be resolved")]
    UnresolvedSymbolic{ allele: String },
    #[error("variant runs past the end of its contig")]
    PastContigEnd
}

/// A variant from the input catalogue, already converted to absolute coordinates and explicit sequences.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CatalogueVariant {
    /// the alleles at their absolute position, REF first
    candidate: VariantCandidate,
    /// the type assigned while loading
    variant_type: VariantType,
    /// the ID column from the catalogue, if any
    id: Option<String>
}

impl CatalogueVariant {
    /// Creates a new catalogue entry.
    /// # Arguments
    /// * `candidate` - the alleles, REF first
    /// * `variant_type` - if None, this is derived from the allele sequences
    /// * `id` - optional identifier that will be carried to the output
    /// # Errors
    /// * if there are no ALT alleles, an ALT is empty, or an ALT matches REF
    pub fn new(candidate: VariantCandidate, variant_type: Option<VariantType>, id: Option<String>) -> Result<CatalogueVariant, VariantError> {
        let seqs = candidate.seqs();
        if seqs.len() < 2 {
            return Err(VariantError::NoAlleles);
        }
        for (index, allele) in seqs.iter().enumerate() {
            if allele.is_empty() {
                return Err(VariantError::EmptyAllele { index });
            }
            if index > 0 && allele == &seqs[0] {
                return Err(VariantError::AlleleMatchesReference { index });
            }
        }
        let variant_type = variant_type.unwrap_or_else(|| candidate.variant_type());
        Ok(CatalogueVariant {
            candidate,
            variant_type,
            id
        })
    }

    pub fn candidate(&self) -> &VariantCandidate {
        &self.candidate
    }

    pub fn get_type(&self) -> VariantType {
        self.variant_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn position(&self) -> u64 {
        self.candidate.abs_pos()
    }

    /// Absolute position one past the last reference base
    pub fn end(&self) -> u64 {
        self.candidate.ref_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::EnumCount;

    #[test]
    fn test_catalogue_variant() {
        let snv = CatalogueVariant::new(
            VariantCandidate::new(10, vec![b"A".to_vec(), b"C".to_vec()]).unwrap(),
            None, Some("rs1".to_string())
        ).unwrap();
        assert_eq!(snv.get_type(), VariantType::Snv);
        assert_eq!(snv.position(), 10);
        assert_eq!(snv.end(), 11);
        assert_eq!(snv.id(), Some("rs1"));

        let deletion = CatalogueVariant::new(
            VariantCandidate::new(10, vec![b"ACG".to_vec(), b"A".to_vec()]).unwrap(),
            None, None
        ).unwrap();
        assert_eq!(deletion.get_type(), VariantType::Deletion);
        assert_eq!(deletion.end(), 13);

        let forced = CatalogueVariant::new(
            VariantCandidate::new(10, vec![b"ACG".to_vec(), b"AGC".to_vec()]).unwrap(),
            Some(VariantType::SvInversion), None
        ).unwrap();
        assert_eq!(forced.get_type(), VariantType::SvInversion);
    }

    #[test]
    fn test_bad_catalogue_variants() {
        let no_alt = VariantCandidate::new(10, vec![b"A".to_vec()]).unwrap();
        assert!(matches!(CatalogueVariant::new(no_alt, None, None), Err(VariantError::NoAlleles)));

        let empty_alt = VariantCandidate::new(10, vec![b"A".to_vec(), vec![]]).unwrap();
        assert!(matches!(CatalogueVariant::new(empty_alt, None, None), Err(VariantError::EmptyAllele { index: 1 })));

        let same_alt = VariantCandidate::new(10, vec![b"A".to_vec(), b"A".to_vec()]).unwrap();
        assert!(matches!(CatalogueVariant::new(same_alt, None, None), Err(VariantError::AlleleMatchesReference { index: 1 })));
    }

    #[test]
    fn test_svtype_tags() {
        for tag in ["DEL", "INS", "DUP", "INV", "BND"] {
            let variant_type = VariantType::from_svtype_tag(tag).unwrap();
            assert!(variant_type.is_sv());
            assert_eq!(variant_type.svtype_tag(), Some(tag));
        }
        assert_eq!(VariantType::from_svtype_tag("DUP:TANDEM").unwrap(), VariantType::SvDuplication);
        assert!(VariantType::from_svtype_tag("CNV").is_err());
        assert!(!VariantType::Snv.is_sv());
        assert_eq!(VariantType::COUNT, VariantType::Unknown as usize + 1);
        assert_eq!(VariantType::SvDeletion.as_ref(), "SvDeletion");
    }
}
