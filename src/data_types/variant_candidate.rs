
use crate::data_types::reference_genome::{AbsolutePosition, BaseLookup};
use crate::data_types::variants::{VariantError, VariantType};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Any length difference at or above this makes a candidate structural
pub const SV_MIN_LENGTH: usize = 50;
/// Placeholder base used when the real flanking base is unknown
pub const PLACEHOLDER_BASE: u8 = b'N';

/// Result of classifying a single-base substitution
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubstitutionClass {
    /// A<->G or C<->T
    Transition,
    /// any other single base change
    Transversion,
    /// not exactly two single-base alleles
    NotApplicable
}

/// The alleles of one variant site at an absolute position; `seqs[0]` is the reference allele.
/// Equality and ordering are by (position, alleles).
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantCandidate {
    abs_pos: AbsolutePosition,
    seqs: Vec<Vec<u8>>
}

impl Hash for VariantCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.candidate_hash());
    }
}

/// Counts the bases shared at the end of every allele, leaving at least `keep` bases in each.
fn shared_suffix_len(seqs: &[Vec<u8>], keep: usize) -> usize {
    let mut shared: usize = 0;
    loop {
        if seqs.iter().any(|s| s.len() <= shared + keep) {
            return shared;
        }
        let base = seqs[0][seqs[0].len() - 1 - shared];
        if seqs.iter().all(|s| s[s.len() - 1 - shared] == base) {
            shared += 1;
        } else {
            return shared;
        }
    }
}

/// Counts the bases shared at the start of every allele, leaving at least `keep` bases in each.
fn shared_prefix_len(seqs: &[Vec<u8>], keep: usize) -> usize {
    let mut shared: usize = 0;
    loop {
        if seqs.iter().any(|s| s.len() <= shared + keep) {
            return shared;
        }
        let base = seqs[0][shared];
        if seqs.iter().all(|s| s[shared] == base) {
            shared += 1;
        } else {
            return shared;
        }
    }
}

/// Hashes a byte string with a seed so the same bytes in different allele slots hash differently.
fn seeded_hash(seed: u64, bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write(bytes);
    hasher.write_usize(bytes.len());
    hasher.finish()
}

impl VariantCandidate {
    /// Creates a new candidate.
    /// # Arguments
    /// * `abs_pos` - absolute position of the first reference base
    /// * `seqs` - the alleles, reference first
    /// # Errors
    /// * if `seqs` is empty
    pub fn new(abs_pos: AbsolutePosition, seqs: Vec<Vec<u8>>) -> Result<VariantCandidate, VariantError> {
        if seqs.is_empty() {
            return Err(VariantError::NoAlleles);
        }
        Ok(VariantCandidate {
            abs_pos,
            seqs
        })
    }

    pub fn abs_pos(&self) -> AbsolutePosition {
        self.abs_pos
    }

    pub fn seqs(&self) -> &[Vec<u8>] {
        &self.seqs
    }

    pub fn ref_allele(&self) -> &[u8] {
        &self.seqs[0]
    }

    pub fn alt_alleles(&self) -> &[Vec<u8>] {
        &self.seqs[1..]
    }

    pub fn num_alleles(&self) -> usize {
        self.seqs.len()
    }

    /// Absolute position one past the last reference base
    pub fn ref_end(&self) -> AbsolutePosition {
        self.abs_pos + self.seqs[0].len() as u64
    }

    /// Trims shared suffix and then shared prefix bases while every allele keeps more than one base.
    /// This is the VCF-style minimal form; calling it on its own output changes nothing.
    pub fn normalize(mut self) -> VariantCandidate {
        if self.seqs.len() < 2 {
            return self;
        }
        self.trim_shared(1);
        self
    }

    /// Returns true if `normalize()` would not change anything.
    pub fn is_normalized(&self) -> bool {
        self.seqs.len() < 2 || (shared_suffix_len(&self.seqs, 1) == 0 && shared_prefix_len(&self.seqs, 1) == 0)
    }

    /// Fully trims shared suffix and prefix bases, allowing alleles to become empty.
    /// This is the form used for graph bubbles.
    pub fn trimmed(mut self) -> VariantCandidate {
        if self.seqs.len() < 2 {
            return self;
        }
        self.trim_shared(0);
        self
    }

    fn trim_shared(&mut self, keep: usize) {
        let suffix = shared_suffix_len(&self.seqs, keep);
        if suffix > 0 {
            for s in self.seqs.iter_mut() {
                s.truncate(s.len() - suffix);
            }
        }
        let prefix = shared_prefix_len(&self.seqs, keep);
        if prefix > 0 {
            for s in self.seqs.iter_mut() {
                s.drain(..prefix);
            }
            self.abs_pos += prefix as u64;
        }
    }

    /// Fully trims the alleles and, if any allele ends up empty, re-adds exactly one flanking base so every allele has length >= 1.
    /// The front flank is preferred; the back flank is used at the very start of the coordinate space.
    /// Unknown flanks are filled with `PLACEHOLDER_BASE`.
    /// # Arguments
    /// * `reference` - source for the real flanking bases
    pub fn expanded_normalized<R: BaseLookup + ?Sized>(self, reference: &R) -> VariantCandidate {
        let mut expanded = self.trimmed();
        if expanded.seqs.iter().any(|s| s.is_empty()) && !expanded.add_base_in_front(reference, true) {
            // only fails at absolute position 0, the back is always available with a placeholder
            expanded.add_base_in_back(reference, true);
        }
        expanded
    }

    /// Adds the base before `abs_pos` to the front of every allele.
    /// # Arguments
    /// * `reference` - source for the real base
    /// * `add_n` - if true, an unknown base is filled with `PLACEHOLDER_BASE`
    /// # Returns
    /// false if the position is 0 or the base is unknown and `add_n` is false, in which case nothing changes
    pub fn add_base_in_front<R: BaseLookup + ?Sized>(&mut self, reference: &R, add_n: bool) -> bool {
        if self.abs_pos == 0 {
            return false;
        }
        let base: u8 = match reference.base_at(self.abs_pos - 1) {
            Some(b) => b,
            None if add_n => PLACEHOLDER_BASE,
            None => return false
        };
        for s in self.seqs.iter_mut() {
            s.insert(0, base);
        }
        self.abs_pos -= 1;
        true
    }

    /// Adds the base after the reference allele to the back of every allele.
    /// # Arguments
    /// * `reference` - source for the real base
    /// * `add_n` - if true, an unknown base is filled with `PLACEHOLDER_BASE`
    /// # Returns
    /// false if the base is unknown and `add_n` is false, in which case nothing changes
    pub fn add_base_in_back<R: BaseLookup + ?Sized>(&mut self, reference: &R, add_n: bool) -> bool {
        let base: u8 = match reference.base_at(self.ref_end()) {
            Some(b) => b,
            None if add_n => PLACEHOLDER_BASE,
            None => return false
        };
        for s in self.seqs.iter_mut() {
            s.push(base);
        }
        true
    }

    /// True if, after normalization, there are at least two alleles and all are a single base.
    pub fn is_snp_or_snps(&self) -> bool {
        let normalized = self.clone().normalize();
        normalized.seqs.len() >= 2 && normalized.seqs.iter().all(|s| s.len() == 1)
    }

    /// Classifies a candidate made of exactly two single-base alleles.
    /// The alleles are taken as written: any pair that is not A<->G or C<->T counts as a transversion.
    pub fn is_transition_or_transversion(&self) -> SubstitutionClass {
        match self.seqs.as_slice() {
            [b1, b2] if b1.len() == 1 && b2.len() == 1 => match (b1[0], b2[0]) {
                (b'A', b'G') | (b'G', b'A') | (b'C', b'T') | (b'T', b'C') => SubstitutionClass::Transition,
                _ => SubstitutionClass::Transversion
            },
            _ => SubstitutionClass::NotApplicable
        }
    }

    /// True if any ALT allele differs in length from the reference by at least `SV_MIN_LENGTH`.
    pub fn is_structural(&self) -> bool {
        let ref_len = self.seqs[0].len();
        self.seqs[1..].iter().any(|s| s.len().abs_diff(ref_len) >= SV_MIN_LENGTH)
    }

    /// Derives a variant type from the allele lengths of the normalized form.
    pub fn variant_type(&self) -> VariantType {
        let normalized = self.clone().normalize();
        if normalized.seqs.len() < 2 {
            return VariantType::Unknown;
        }
        let ref_len = normalized.seqs[0].len();
        let alt_lens: Vec<usize> = normalized.seqs[1..].iter().map(|s| s.len()).collect();

        if normalized.is_structural() {
            if alt_lens.iter().all(|&l| l > ref_len) {
                return VariantType::SvInsertion;
            } else if alt_lens.iter().all(|&l| l < ref_len) {
                return VariantType::SvDeletion;
            }
            return VariantType::Indel;
        }

        if alt_lens.iter().all(|&l| l == ref_len) {
            if ref_len == 1 {
                VariantType::Snv
            } else {
                VariantType::Mnp
            }
        } else if ref_len == 1 && alt_lens.iter().all(|&l| l > 1) {
            VariantType::Insertion
        } else if ref_len > 1 && alt_lens.iter().all(|&l| l == 1) {
            VariantType::Deletion
        } else {
            VariantType::Indel
        }
    }

    /// Position-and-allele hash where each allele slot uses its own seed, so swapping alleles changes the result.
    pub fn candidate_hash(&self) -> u64 {
        let mut combined: u64 = seeded_hash(0, &self.abs_pos.to_le_bytes());
        for (index, allele) in self.seqs.iter().enumerate() {
            let allele_hash = seeded_hash(42 + index as u64, allele);
            combined ^= if index == 0 {
                allele_hash << 1
            } else {
                allele_hash.wrapping_add(0x9e3779b9).rotate_left(index as u32)
            };
        }
        combined
    }
}
