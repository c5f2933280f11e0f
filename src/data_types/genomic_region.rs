
use crate::data_types::reference_genome::{AbsolutePosition, InputError, ReferenceGenome};

use serde::{Deserialize, Serialize};

/// Default size of a genotyping region for small variants
pub const REGION_SIZE: u64 = 50_000;
/// Default size of a genotyping region for structural variants
pub const SV_REGION_SIZE: u64 = 1_000_000;

/// A half-open interval on one contig, 0-based.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct GenomicRegion {
    /// the contig name
    chrom: String,
    /// 0-based inclusive start
    begin: u64,
    /// 0-based exclusive end
    end: u64
}

impl std::fmt::Display for GenomicRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // display is 1-based inclusive, same as what we parse
        write!(f, "{}:{}-{}", self.chrom, self.begin + 1, self.end)
    }
}

impl GenomicRegion {
    /// Creates a new region.
    /// # Panics
    /// * if `begin > end`
    pub fn new(chrom: &str, begin: u64, end: u64) -> GenomicRegion {
        assert!(begin <= end, "begin > end: {begin} > {end}");
        GenomicRegion {
            chrom: chrom.to_string(),
            begin,
            end
        }
    }

    /// Parses a region string of the form `chr`, `chr:begin`, or `chr:begin-end`.
    /// Coordinates in the string are 1-based inclusive and may contain commas.
    /// A missing end is stored as `u64::MAX` and is expected to be clamped later.
    /// # Errors
    /// * if the numbers are not parseable or begin > end
    pub fn parse(region: &str) -> Result<GenomicRegion, InputError> {
        let bad_region = |message: &str| InputError::BadRegion {
            region: region.to_string(),
            message: message.to_string()
        };
        let cleaned: String = region.trim().replace(',', "");
        if cleaned.is_empty() {
            return Err(bad_region("empty region"));
        }

        let (chrom, coordinates) = match cleaned.rfind(':') {
            Some(colon) => (&cleaned[..colon], Some(&cleaned[colon+1..])),
            None => (&cleaned[..], None)
        };
        if chrom.is_empty() {
            return Err(bad_region("empty contig name"));
        }

        let (begin, end) = match coordinates {
            None => (0, u64::MAX),
            Some(coords) => {
                let mut split = coords.splitn(2, '-');
                let begin_str = split.next().unwrap_or_default();
                let begin: u64 = begin_str.parse().map_err(|_| bad_region("begin is not a number"))?;
                if begin == 0 {
                    return Err(bad_region("begin is 1-based and must be > 0"));
                }
                let end: u64 = match split.next() {
                    Some(end_str) if !end_str.is_empty() => end_str.parse().map_err(|_| bad_region("end is not a number"))?,
                    _ => u64::MAX
                };
                if begin > end {
                    return Err(bad_region("begin is after end"));
                }
                (begin - 1, end)
            }
        };

        Ok(GenomicRegion::new(chrom, begin, end))
    }

    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Returns the absolute interval covered by this region.
    /// # Errors
    /// * if the contig is not in the reference
    pub fn absolute_range(&self, reference: &ReferenceGenome) -> Result<(AbsolutePosition, AbsolutePosition), InputError> {
        Ok((
            reference.absolute_position(&self.chrom, self.begin)?,
            reference.absolute_position(&self.chrom, self.end)?
        ))
    }

    /// Clamps the region to the length of its contig.
    /// # Errors
    /// * if the contig is not in the reference
    pub fn clamp(&self, reference: &ReferenceGenome) -> Result<GenomicRegion, InputError> {
        let contig_len = match reference.contig_length(&self.chrom) {
            Some(l) => l,
            None => return Err(InputError::UnknownContig { contig: self.chrom.clone() })
        };
        let end = self.end.min(contig_len);
        let begin = self.begin.min(end);
        Ok(GenomicRegion::new(&self.chrom, begin, end))
    }

    /// Splits this region into contiguous chunks of `region_size`.
    /// A chunk is only split off while the remainder exceeds `region_size` plus 10% slack, so the last chunk may be up to 10% larger than `region_size`.
    /// # Arguments
    /// * `region_size` - the target size of each chunk, must be > 0
    pub fn split(&self, region_size: u64) -> Vec<GenomicRegion> {
        assert!(region_size > 0);
        let slack: u64 = region_size / 10;
        let mut regions: Vec<GenomicRegion> = vec![];
        let mut begin: u64 = self.begin;
        while self.end - begin > region_size + slack {
            regions.push(GenomicRegion::new(&self.chrom, begin, begin + region_size));
            begin += region_size;
        }
        regions.push(GenomicRegion::new(&self.chrom, begin, self.end));
        regions
    }
}

/// Sorts regions by reference order and merges any that overlap or touch so support is never counted twice.
/// # Arguments
/// * `regions` - the requested regions, already clamped
/// * `reference` - provides the contig order
/// # Errors
/// * if any region is on an unknown contig
pub fn merge_overlapping(mut regions: Vec<GenomicRegion>, reference: &ReferenceGenome) -> Result<Vec<GenomicRegion>, InputError> {
    let mut keyed: Vec<(AbsolutePosition, GenomicRegion)> = Vec::with_capacity(regions.len());
    for region in regions.drain(..) {
        let (abs_begin, _) = region.absolute_range(reference)?;
        keyed.push((abs_begin, region));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.end.cmp(&b.1.end)));

    let mut merged: Vec<GenomicRegion> = vec![];
    for (_, region) in keyed.into_iter() {
        if region.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some(previous) if previous.chrom == region.chrom && region.begin <= previous.end => {
                previous.end = previous.end.max(region.end);
            },
            _ => merged.push(region)
        }
    }
    Ok(merged)
}
