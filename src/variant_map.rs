
use crate::data_types::allele_support::{AlleleSupport, SupportRecord};
use crate::data_types::reference_genome::BaseLookup;
use crate::data_types::variant_candidate::VariantCandidate;
use crate::data_types::variants::{VariantType, Zygosity};
use crate::reference_graph::ReferenceGraph;

use log::trace;
use rustc_hash::FxHashMap as HashMap;

/// Per-read error rate used by the genotype likelihoods
const ERROR_RATE: f64 = 0.01;
/// Cap on per-sample GQ
const MAX_GQ: f64 = 99.0;
/// Cap on site QUAL
const MAX_QUAL: f64 = 999.0;

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum CallerError {
    #[error("support record from read {read_name:?} is inconsistent: {message}")]
    InternalConsistency { read_name: String, message: String }
}

/// Support floors applied per sample and allele
#[derive(Clone, Debug)]
pub struct CallThresholds {
    /// minimum reads supporting an allele
    pub min_support_count: u32,
    /// minimum fraction of the sample's reads at the site supporting an allele
    pub min_support_ratio: f64,
    /// keep sites where no sample passes, as missing genotypes
    pub emit_no_calls: bool
}

impl Default for CallThresholds {
    fn default() -> CallThresholds {
        CallThresholds {
            min_support_count: 5,
            min_support_ratio: 0.25,
            emit_no_calls: false
        }
    }
}

/// Controls how calls are split into output records
#[derive(Clone, Debug, Default)]
pub struct DecomposeOptions {
    /// keep every site as a single record
    pub no_decompose: bool,
    /// keep overlapping alleles in one record instead of splitting them
    pub no_variant_overlapping: bool
}

/// One site as the caller sees it
#[derive(Clone, Debug)]
pub struct MapSite {
    /// trimmed alleles, REF first
    pub candidate: VariantCandidate,
    pub variant_type: VariantType,
    pub ids: Vec<String>,
    pub low_confidence: bool
}

/// Genotype for one sample at one record
#[derive(Clone, Debug, PartialEq)]
pub struct SampleGenotype {
    /// the two called alleles, None for a missing genotype
    alleles: Option<(usize, usize)>,
    /// reads supporting each allele
    allele_depths: Vec<u32>,
    /// total supporting reads
    depth: u32,
    /// genotype quality
    gq: u8
}

impl SampleGenotype {
    pub fn new(alleles: Option<(usize, usize)>, allele_depths: Vec<u32>, gq: u8) -> SampleGenotype {
        let depth: u32 = allele_depths.iter().sum();
        SampleGenotype {
            alleles,
            allele_depths,
            depth,
            gq
        }
    }

    pub fn alleles(&self) -> Option<(usize, usize)> {
        self.alleles
    }

    pub fn allele_depths(&self) -> &[u32] {
        &self.allele_depths
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn gq(&self) -> u8 {
        self.gq
    }

    pub fn is_missing(&self) -> bool {
        self.alleles.is_none()
    }

    pub fn zygosity(&self) -> Zygosity {
        match self.alleles {
            None => Zygosity::Unknown,
            Some((0, 0)) => Zygosity::HomozygousReference,
            Some((a, b)) if a == b => Zygosity::HomozygousAlternate,
            Some(_) => Zygosity::Heterozygous
        }
    }
}

/// A finalized site with genotypes for every sample.
#[derive(Clone, Debug, PartialEq)]
pub struct GenotypeCall {
    /// alleles of this record, REF first
    candidate: VariantCandidate,
    variant_type: VariantType,
    ids: Vec<String>,
    /// one entry per sample
    genotypes: Vec<SampleGenotype>,
    /// phred confidence that some sample is not homozygous reference
    qual: f64,
    low_confidence: bool,
    /// site allele index -> allele index in this record
    source_allele_map: Vec<usize>
}

impl GenotypeCall {
    /// Creates a call where every site allele maps to itself.
    pub fn new(candidate: VariantCandidate, variant_type: VariantType, ids: Vec<String>, genotypes: Vec<SampleGenotype>, qual: f64) -> GenotypeCall {
        let source_allele_map = (0..candidate.num_alleles()).collect();
        GenotypeCall {
            candidate,
            variant_type,
            ids,
            genotypes,
            qual,
            low_confidence: false,
            source_allele_map
        }
    }

    pub fn candidate(&self) -> &VariantCandidate {
        &self.candidate
    }

    pub fn variant_type(&self) -> VariantType {
        self.variant_type
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn genotypes(&self) -> &[SampleGenotype] {
        &self.genotypes
    }

    pub fn qual(&self) -> f64 {
        self.qual
    }

    pub fn is_low_confidence(&self) -> bool {
        self.low_confidence
    }

    pub fn set_low_confidence(&mut self, low_confidence: bool) {
        self.low_confidence = low_confidence;
    }

    pub fn source_allele_map(&self) -> &[usize] {
        &self.source_allele_map
    }
}

/// log10 likelihood of every unordered diploid genotype given per-allele read counts.
fn genotype_log_likelihoods(counts: &[u32]) -> Vec<((usize, usize), f64)> {
    let num_alleles = counts.len();
    let other: f64 = if num_alleles > 1 { ERROR_RATE / (num_alleles - 1) as f64 } else { ERROR_RATE };
    let observe = |read_allele: usize, genotype_allele: usize| {
        if read_allele == genotype_allele { 1.0 - ERROR_RATE } else { other }
    };

    let mut likelihoods: Vec<((usize, usize), f64)> = Vec::with_capacity(num_alleles * (num_alleles + 1) / 2);
    for a in 0..num_alleles {
        for b in a..num_alleles {
            let ll: f64 = counts.iter().enumerate()
                .filter(|&(_, &c)| c > 0)
                .map(|(i, &c)| c as f64 * (0.5 * observe(i, a) + 0.5 * observe(i, b)).log10())
                .sum();
            likelihoods.push(((a, b), ll));
        }
    }
    likelihoods
}

/// log10 of the sum of 10^x
fn log10_sum(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.map(|v| 10.0_f64.powf(v - max)).sum::<f64>().log10()
}

/// Calls one sample at one site.
/// Returns the genotype and the phred confidence that the sample is not homozygous reference.
fn call_sample(support: &AlleleSupport, thresholds: &CallThresholds) -> (SampleGenotype, f64) {
    let counts: &[u32] = support.allele_counts();
    let total: u32 = support.total();
    let passing: Vec<usize> = counts.iter().enumerate()
        .filter(|&(_, &c)| {
            c > 0 && c >= thresholds.min_support_count &&
                c as f64 >= thresholds.min_support_ratio * total as f64
        })
        .map(|(i, _)| i)
        .collect();
    if passing.is_empty() {
        return (SampleGenotype::new(None, counts.to_vec(), 0), 0.0);
    }

    let likelihoods = genotype_log_likelihoods(counts);
    let called = likelihoods.iter()
        .filter(|((a, b), _)| passing.contains(a) && passing.contains(b))
        .fold(None, |acc: Option<&((usize, usize), f64)>, entry| match acc {
            Some(best) if best.1 >= entry.1 => Some(best),
            _ => Some(entry)
        });
    let Some(&(genotype, called_ll)) = called else {
        return (SampleGenotype::new(None, counts.to_vec(), 0), 0.0);
    };

    let best_other = likelihoods.iter()
        .filter(|(g, _)| *g != genotype)
        .map(|(_, ll)| *ll)
        .fold(f64::NEG_INFINITY, f64::max);
    let gq: f64 = if best_other == f64::NEG_INFINITY {
        MAX_GQ
    } else {
        (10.0 * (called_ll - best_other)).clamp(0.0, MAX_GQ)
    };

    let total_ll = log10_sum(likelihoods.iter().map(|(_, ll)| *ll));
    let hom_ref_ll = likelihoods[0].1;
    let non_ref_qual = (-10.0 * (hom_ref_ll - total_ll)).clamp(0.0, MAX_QUAL);

    (SampleGenotype::new(Some(genotype), counts.to_vec(), gq.round() as u8), non_ref_qual)
}

/// What one read name has been counted as at one site
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReadClaim {
    /// counted once for this (allele, read group)
    Counted { allele_index: usize, read_group_index: usize },
    /// records named different alleles, the read is not counted at all
    Conflicting
}

/// Per-sample, per-site allele support for one region.
#[derive(Clone, Debug)]
pub struct VariantMap {
    sites: Vec<MapSite>,
    num_samples: usize,
    /// site index -> sample index -> support
    support: Vec<Vec<AlleleSupport>>,
    /// (read name, sample, site) -> how that read is counted there
    claims: HashMap<(String, usize, usize), ReadClaim>
}

impl VariantMap {
    /// Creates an empty map over the given sites.
    pub fn new(sites: Vec<MapSite>, num_samples: usize) -> VariantMap {
        let support = sites.iter()
            .map(|s| vec![AlleleSupport::new(s.candidate.num_alleles()); num_samples])
            .collect();
        VariantMap {
            sites,
            num_samples,
            support,
            claims: Default::default()
        }
    }

    /// Creates an empty map over the sites of a graph.
    pub fn from_graph(graph: &ReferenceGraph, num_samples: usize) -> VariantMap {
        let sites = graph.sites().iter()
            .map(|s| MapSite {
                candidate: s.candidate().clone(),
                variant_type: s.variant_type(),
                ids: s.ids().to_vec(),
                low_confidence: s.is_low_confidence()
            })
            .collect();
        VariantMap::new(sites, num_samples)
    }

    pub fn num_sites(&self) -> usize {
        self.sites.len()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// # Panics
    /// * if either index is out of range
    pub fn support(&self, site_index: usize, sample_index: usize) -> &AlleleSupport {
        &self.support[site_index][sample_index]
    }

    /// Folds read support into the tallies.
    /// A read name counts at most once per (sample, site). Repeated records for the same allele collapse into one,
    /// and a read whose records name different alleles at a site is not counted there at all.
    /// Either way the result does not depend on the order or batching of records.
    /// # Errors
    /// * if a record refers to a sample, site, or allele that does not exist
    pub fn accumulate(&mut self, records: &[SupportRecord]) -> Result<(), CallerError> {
        for record in records.iter() {
            let inconsistent = |message: String| CallerError::InternalConsistency {
                read_name: record.read_name.clone(),
                message
            };
            if record.sample_index >= self.num_samples {
                return Err(inconsistent(format!("sample index {} with {} samples", record.sample_index, self.num_samples)));
            }
            let Some(site) = self.sites.get(record.site_index) else {
                return Err(inconsistent(format!("site index {} with {} sites", record.site_index, self.sites.len())));
            };
            if record.allele_index >= site.candidate.num_alleles() {
                return Err(inconsistent(format!("allele index {} at a site with {} alleles", record.allele_index, site.candidate.num_alleles())));
            }

            let support = &mut self.support[record.site_index][record.sample_index];
            let key = (record.read_name.clone(), record.sample_index, record.site_index);
            match self.claims.get(&key).copied() {
                None => {
                    support.add(record.allele_index, record.read_group_index);
                    self.claims.insert(key, ReadClaim::Counted {
                        allele_index: record.allele_index,
                        read_group_index: record.read_group_index
                    });
                },
                Some(ReadClaim::Counted { allele_index, read_group_index }) if allele_index == record.allele_index => {
                    // same allele from another read group, the lowest group wins
                    if record.read_group_index < read_group_index {
                        support.remove(allele_index, read_group_index);
                        support.add(allele_index, record.read_group_index);
                        self.claims.insert(key, ReadClaim::Counted { allele_index, read_group_index: record.read_group_index });
                    } else {
                        trace!("Read {} already counted for site {}", record.read_name, record.site_index);
                    }
                },
                Some(ReadClaim::Counted { allele_index, read_group_index }) => {
                    trace!("Read {} supports alleles {} and {} at site {}, dropping it", record.read_name, allele_index, record.allele_index, record.site_index);
                    support.remove(allele_index, read_group_index);
                    self.claims.insert(key, ReadClaim::Conflicting);
                },
                Some(ReadClaim::Conflicting) => {}
            }
        }
        Ok(())
    }

    /// Calls genotypes at every site.
    /// A site is kept if any sample passes the thresholds for at least one allele, or always if `emit_no_calls` is set.
    pub fn call(&self, thresholds: &CallThresholds) -> Vec<GenotypeCall> {
        let mut calls: Vec<GenotypeCall> = vec![];
        for (site, site_support) in self.sites.iter().zip(self.support.iter()) {
            let mut genotypes: Vec<SampleGenotype> = Vec::with_capacity(self.num_samples);
            let mut qual: f64 = 0.0;
            for sample_support in site_support.iter() {
                let (genotype, sample_qual) = call_sample(sample_support, thresholds);
                qual = qual.max(sample_qual);
                genotypes.push(genotype);
            }

            if !thresholds.emit_no_calls && genotypes.iter().all(|g| g.is_missing()) {
                trace!("Dropping site at {}, no sample passes the support thresholds", site.candidate.abs_pos());
                continue;
            }
            let mut call = GenotypeCall::new(site.candidate.clone(), site.variant_type, site.ids.clone(), genotypes, qual);
            call.low_confidence = site.low_confidence;
            calls.push(call);
        }
        calls
    }
}

/// One alternate allele reduced to its minimal difference from REF, in site-local coordinates
struct AltDifference {
    source_allele: usize,
    /// [begin, end) of the replaced REF bases, relative to the site start
    begin: usize,
    end: usize,
    /// the replacement bases
    replacement: Vec<u8>
}

/// Splits a call into records whose alternate alleles do not overlap.
/// Genotypes keep the allele order of the source call so haplotypes can be reassembled.
fn decompose_call(call: &GenotypeCall) -> Vec<GenotypeCall> {
    let site_pos = call.candidate.abs_pos();
    let ref_allele: &[u8] = call.candidate.ref_allele();

    let mut differences: Vec<AltDifference> = call.candidate.alt_alleles().iter().enumerate()
        .filter_map(|(i, alt)| {
            let pair = VariantCandidate::new(site_pos, vec![ref_allele.to_vec(), alt.clone()]).ok()?.trimmed();
            let begin = (pair.abs_pos() - site_pos) as usize;
            Some(AltDifference {
                source_allele: i + 1,
                begin,
                end: begin + pair.ref_allele().len(),
                replacement: pair.seqs()[1].clone()
            })
        })
        .collect();
    differences.sort_by_key(|d| (d.begin, d.end));

    // group differences whose spans overlap, insertions at the same point included
    // an empty allele right at the end of a cluster is padded into that cluster, so it joins as well
    let mut clusters: Vec<Vec<AltDifference>> = vec![];
    let mut cluster_end: usize = 0;
    let mut cluster_begin: usize = 0;
    for difference in differences.into_iter() {
        let padded_into = difference.begin == cluster_end &&
            (difference.begin == difference.end || difference.replacement.is_empty());
        let joins = !clusters.is_empty() &&
            (difference.begin < cluster_end || difference.begin == cluster_begin || padded_into);
        if joins {
            cluster_end = cluster_end.max(difference.end);
            if let Some(cluster) = clusters.last_mut() {
                cluster.push(difference);
            }
        } else {
            cluster_begin = difference.begin;
            cluster_end = difference.end;
            clusters.push(vec![difference]);
        }
    }
    if clusters.len() <= 1 {
        return vec![call.clone()];
    }

    let num_source_alleles = call.candidate.num_alleles();
    let mut records: Vec<GenotypeCall> = Vec::with_capacity(clusters.len());
    for cluster in clusters.into_iter() {
        let begin = cluster.iter().map(|d| d.begin).min().unwrap_or_default();
        let end = cluster.iter().map(|d| d.end).max().unwrap_or_default();
        let record_ref: Vec<u8> = ref_allele[begin..end].to_vec();

        let mut seqs: Vec<Vec<u8>> = vec![record_ref.clone()];
        let mut source_allele_map: Vec<usize> = vec![0; num_source_alleles];
        for difference in cluster.iter() {
            let mut alt: Vec<u8> = record_ref[..difference.begin - begin].to_vec();
            alt.extend_from_slice(&difference.replacement);
            alt.extend_from_slice(&record_ref[difference.end - begin..]);
            let record_allele = match seqs.iter().position(|s| s == &alt) {
                Some(index) => index,
                None => {
                    seqs.push(alt);
                    seqs.len() - 1
                }
            };
            source_allele_map[difference.source_allele] = record_allele;
        }

        let genotypes: Vec<SampleGenotype> = call.genotypes.iter()
            .map(|g| {
                let mut allele_depths: Vec<u32> = vec![0; seqs.len()];
                for (source, &depth) in g.allele_depths.iter().enumerate() {
                    allele_depths[source_allele_map[source]] += depth;
                }
                SampleGenotype {
                    alleles: g.alleles.map(|(a, b)| (source_allele_map[a], source_allele_map[b])),
                    allele_depths,
                    depth: g.depth,
                    gq: g.gq
                }
            })
            .collect();

        let Ok(candidate) = VariantCandidate::new(site_pos + begin as u64, seqs) else {
            continue;
        };
        let variant_type = if call.variant_type.is_sv() { call.variant_type } else { candidate.variant_type() };
        records.push(GenotypeCall {
            candidate,
            variant_type,
            ids: call.ids.clone(),
            genotypes,
            qual: call.qual,
            low_confidence: call.low_confidence,
            source_allele_map
        });
    }
    records
}

/// Turns raw site calls into output records.
/// Unless either option is set, every call is split into non-overlapping records.
/// Every record is then padded so no allele is empty, and the result is sorted by position.
/// # Arguments
/// * `calls` - calls from `VariantMap::call`, with trimmed alleles
/// * `reference` - source for the padding bases
/// * `options` - decomposition switches
pub fn decompose<R: BaseLookup + ?Sized>(calls: Vec<GenotypeCall>, reference: &R, options: &DecomposeOptions) -> Vec<GenotypeCall> {
    let split = !options.no_decompose && !options.no_variant_overlapping;
    let mut records: Vec<GenotypeCall> = vec![];
    for call in calls.into_iter() {
        let parts = if split { decompose_call(&call) } else { vec![call] };
        for mut record in parts.into_iter() {
            record.candidate = record.candidate.expanded_normalized(reference);
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.candidate.cmp(&b.candidate));
    records
}
