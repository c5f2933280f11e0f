
use crate::data_types::allele_support::SupportRecord;
use crate::data_types::genomic_region::{GenomicRegion, REGION_SIZE, merge_overlapping};
use crate::data_types::reference_genome::{BaseLookup, InputError, ReferenceGenome};
use crate::graph_index::{GraphIndex, IndexConfig, IndexError};
use crate::persistence::GraphFormatError;
use crate::read_placer::{PlacementConfig, ReadPlacer};
use crate::read_source::{ReadSource, SourceRead};
use crate::reference_graph::{GraphConfig, GraphError, ReferenceGraph};
use crate::variant_catalogue::VariantCatalogue;
use crate::variant_map::{CallThresholds, CallerError, DecomposeOptions, GenotypeCall, VariantMap, decompose};

use log::{debug, error, info};
use simple_error::bail;
use std::error::Error;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use threadpool::ThreadPool;

/// How often the collector checks the pool for panics while waiting on results
const PANIC_POLL: Duration = Duration::from_millis(500);
/// Log a progress line every this many regions
const UPDATE_SPEED: u64 = 100;

/// Everything a genotyping run needs, passed down to every worker
#[derive(Clone, Debug)]
pub struct GenotypeConfig {
    pub graph: GraphConfig,
    pub index: IndexConfig,
    pub placement: PlacementConfig,
    pub thresholds: CallThresholds,
    pub decompose: DecomposeOptions,
    /// number of worker threads
    pub threads: usize,
    /// cap on simultaneously open read files
    pub max_files_open: usize,
    /// target region length before splitting
    pub region_size: u64,
    /// minimum mapping quality for a read to be used
    pub min_mapq: u8
}

impl Default for GenotypeConfig {
    fn default() -> GenotypeConfig {
        GenotypeConfig {
            graph: Default::default(),
            index: Default::default(),
            placement: Default::default(),
            thresholds: Default::default(),
            decompose: Default::default(),
            threads: 1,
            max_files_open: 1000,
            region_size: REGION_SIZE,
            min_mapq: 0
        }
    }
}

/// Counters for one region, or summed over many
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegionStats {
    /// nodes in the region graph
    pub nodes: u64,
    /// variant sites in the region graph
    pub sites: u64,
    /// catalogue variants that could not be placed in the graph
    pub rejected_variants: u64,
    /// sites flagged low-confidence during index construction
    pub low_confidence_sites: u64,
    /// reads fetched for the region
    pub reads: u64,
    /// reads with no alignment passing the identity floor
    pub unmapped_reads: u64,
    /// reads with an accepted alignment
    pub placed_reads: u64,
    /// (read, site, allele) observations produced
    pub support_records: u64,
    /// sites where no sample passed the support thresholds
    pub dropped_sites: u64,
    /// output records after decomposition
    pub emitted_records: u64,
    /// CPU time spent on the region
    pub cpu_seconds: f64
}

impl AddAssign<&RegionStats> for RegionStats {
    fn add_assign(&mut self, rhs: &RegionStats) {
        self.nodes += rhs.nodes;
        self.sites += rhs.sites;
        self.rejected_variants += rhs.rejected_variants;
        self.low_confidence_sites += rhs.low_confidence_sites;
        self.reads += rhs.reads;
        self.unmapped_reads += rhs.unmapped_reads;
        self.placed_reads += rhs.placed_reads;
        self.support_records += rhs.support_records;
        self.dropped_sites += rhs.dropped_sites;
        self.emitted_records += rhs.emitted_records;
        self.cpu_seconds += rhs.cpu_seconds;
    }
}

/// The finished calls for one region
#[derive(Clone, Debug)]
pub struct RegionOutput {
    /// position of this region in the planned order
    pub region_index: usize,
    pub region: GenomicRegion,
    /// records sorted by position
    pub calls: Vec<GenotypeCall>,
    pub stats: RegionStats
}

/// Error that can cross from a worker thread back to the collector
type WorkerError = Box<dyn Error + Send + Sync>;

/// Moves a region error onto the worker channel, keeping its type when it is one of ours so exit codes still apply.
/// Anything else is carried over as its message.
fn into_worker_error(error: Box<dyn Error>) -> WorkerError {
    let error = match error.downcast::<InputError>() {
        Ok(e) => return e,
        Err(e) => e
    };
    let error = match error.downcast::<CallerError>() {
        Ok(e) => return e,
        Err(e) => e
    };
    let error = match error.downcast::<GraphError>() {
        Ok(e) => return e,
        Err(e) => e
    };
    let error = match error.downcast::<GraphFormatError>() {
        Ok(e) => return e,
        Err(e) => e
    };
    match error.downcast::<IndexError>() {
        Ok(e) => e as WorkerError,
        Err(e) => e.to_string().into()
    }
}

/// Turns requested regions into the non-overlapping work list.
/// No requests means every contig in full.
/// Requests are clamped to the contigs, merged where they overlap, and split into pieces of about `region_size`.
/// # Arguments
/// * `requested` - regions from the user, in any order
/// * `reference` - provides contig names, lengths, and order
/// * `region_size` - target piece length
/// # Errors
/// * if a request names an unknown contig or lies outside it
pub fn plan_regions(requested: &[GenomicRegion], reference: &ReferenceGenome, region_size: u64) -> Result<Vec<GenomicRegion>, InputError> {
    let clamped: Vec<GenomicRegion> = if requested.is_empty() {
        reference.contig_keys().iter()
            .filter_map(|chrom| {
                let length = reference.contig_length(chrom)?;
                Some(GenomicRegion::new(chrom, 0, length))
            })
            .filter(|r| !r.is_empty())
            .collect()
    } else {
        requested.iter()
            .map(|r| r.clamp(reference))
            .collect::<Result<Vec<_>, _>>()?
    };

    let merged = merge_overlapping(clamped, reference)?;
    Ok(merged.iter()
        .filter(|r| !r.is_empty())
        .flat_map(|r| r.split(region_size.max(1)))
        .collect())
}

/// Places reads on a graph and calls every site.
/// # Arguments
/// * `graph` - the region graph
/// * `index` - the index built from `graph`
/// * `reads` - reads to place, in any order
/// * `num_samples` - number of samples the reads refer to
/// * `reference` - padding source for the output alleles
/// * `config` - placement, threshold, and decomposition options
/// # Errors
/// * if a read refers to a sample index outside `num_samples`
pub fn genotype_reads<R: BaseLookup + ?Sized>(
    graph: &ReferenceGraph, index: &GraphIndex, reads: &[SourceRead], num_samples: usize,
    reference: &R, config: &GenotypeConfig
) -> Result<(Vec<GenotypeCall>, RegionStats), CallerError> {
    let placer = ReadPlacer::new(graph, index, config.placement.clone());
    let mut stats = RegionStats {
        nodes: graph.num_nodes() as u64,
        sites: graph.sites().len() as u64,
        rejected_variants: graph.rejected_variants() as u64,
        low_confidence_sites: graph.sites().iter().filter(|s| s.is_low_confidence()).count() as u64,
        ..Default::default()
    };

    let mut support_records: Vec<SupportRecord> = vec![];
    for read in reads.iter() {
        stats.reads += 1;
        let Some(alignment) = placer.place_best(&read.sequence) else {
            stats.unmapped_reads += 1;
            continue;
        };
        stats.placed_reads += 1;
        for (site_index, allele_index) in alignment.allele_support(graph) {
            support_records.push(SupportRecord {
                read_name: read.name.clone(),
                sample_index: read.sample_index,
                read_group_index: read.read_group_index,
                site_index,
                allele_index
            });
        }
    }
    stats.support_records = support_records.len() as u64;

    let mut variant_map = VariantMap::from_graph(graph, num_samples);
    variant_map.accumulate(&support_records)?;
    let calls = variant_map.call(&config.thresholds);
    stats.dropped_sites = (variant_map.num_sites() - calls.len()) as u64;

    let records = decompose(calls, reference, &config.decompose);
    stats.emitted_records = records.len() as u64;
    Ok((records, stats))
}

/// Builds the graph and index for one region, then fetches, places, and calls its reads.
/// # Arguments
/// * `region_index` - position of the region in the planned order
/// * `region` - the region to genotype
/// * `reference` - the reference genome
/// * `catalogue` - all known variants
/// * `read_source` - provides the reads and the sample list
/// * `config` - run options
/// # Errors
/// * if the region graph cannot be built or fails its structural check
/// * if the reads cannot be fetched
/// * if read support is internally inconsistent
pub fn process_region(
    region_index: usize, region: &GenomicRegion, reference: &ReferenceGenome, catalogue: &VariantCatalogue,
    read_source: &dyn ReadSource, config: &GenotypeConfig
) -> Result<RegionOutput, Box<dyn std::error::Error>> {
    let start_time = cpu_time::ThreadTime::now();
    let (abs_begin, abs_end) = region.absolute_range(reference)?;
    let mut graph = ReferenceGraph::build(reference, catalogue.in_range(abs_begin, abs_end), region, &config.graph)?;
    if let Err(defects) = graph.check() {
        for defect in defects.iter() {
            error!("Graph defect in {}: {}", region, defect);
        }
        bail!("Graph for {} failed its structural check with {} defects", region, defects.len());
    }

    let index = GraphIndex::build(&graph, &config.index)?;
    graph.flag_low_confidence(index.low_confidence_sites());

    let reads = read_source.fetch(region)?;
    let (calls, mut stats) = genotype_reads(&graph, &index, &reads, read_source.sample_names().len(), reference, config)?;
    stats.cpu_seconds = start_time.elapsed().as_secs_f64();

    debug!(
        "Region {}: {} sites, {} rejected, {} low-confidence, {} / {} reads placed, {} sites dropped, {} records",
        region, stats.sites, stats.rejected_variants, stats.low_confidence_sites,
        stats.placed_reads, stats.reads, stats.dropped_sites, stats.emitted_records
    );
    Ok(RegionOutput {
        region_index,
        region: region.clone(),
        calls,
        stats
    })
}

/// Genotypes every region, in parallel when `config.threads > 1`.
/// Each finished region is handed to `receiver` in completion order; `region_index` restores the planned order.
/// On the first failure no further regions are started, regions already running are allowed to finish, and the error is returned.
/// # Arguments
/// * `regions` - planned regions, see `plan_regions`
/// * `reference` - shared reference genome
/// * `catalogue` - shared variant catalogue
/// * `read_source` - shared read source
/// * `config` - run options
/// * `receiver` - consumes each finished region
/// # Errors
/// * if any region fails, the receiver fails, or a worker panics
pub fn run_regions<F>(
    regions: &[GenomicRegion], reference: Arc<ReferenceGenome>, catalogue: Arc<VariantCatalogue>,
    read_source: Arc<dyn ReadSource>, config: Arc<GenotypeConfig>, mut receiver: F
) -> Result<RegionStats, Box<dyn std::error::Error>>
where
    F: FnMut(RegionOutput) -> Result<(), Box<dyn std::error::Error>>
{
    let start_time: Instant = Instant::now();
    let mut totals: RegionStats = Default::default();
    let mut results_received: u64 = 0;

    if config.threads <= 1 {
        for (region_index, region) in regions.iter().enumerate() {
            let output = match process_region(region_index, region, &reference, &catalogue, read_source.as_ref(), &config) {
                Ok(o) => o,
                Err(e) => {
                    error!("Error while processing {}: {}", region, e);
                    return Err(e);
                }
            };
            totals += &output.stats;
            results_received += 1;
            receiver(output)?;
            if results_received % UPDATE_SPEED == 0 {
                info!("Finished {} / {} regions in {:.2} seconds", results_received, regions.len(), start_time.elapsed().as_secs_f64());
            }
        }
        return Ok(totals);
    }

    info!("Starting job pool with {} threads...", config.threads);
    let job_slots: u64 = 40 * config.threads as u64;
    let mut jobs_queued: u64 = 0;
    let pool = ThreadPool::new(config.threads);
    let (tx, rx) = mpsc::channel::<Option<Result<RegionOutput, WorkerError>>>();
    let abort = Arc::new(AtomicBool::new(false));
    let mut first_error: Option<Box<dyn Error>> = None;

    // pulls one result, watching for panicked workers that will never report
    let mut receive_one = |first_error: &mut Option<Box<dyn Error>>, totals: &mut RegionStats| -> Result<(), Box<dyn Error>> {
        let message = loop {
            if pool.panic_count() > 0 {
                bail!("Panic detected in ThreadPool, check above for details.");
            }
            match rx.recv_timeout(PANIC_POLL) {
                Ok(m) => break m,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => bail!("Worker channel closed unexpectedly")
            }
        };
        match message {
            Some(Ok(output)) => {
                *totals += &output.stats;
                if first_error.is_none() {
                    if let Err(e) = receiver(output) {
                        abort.store(true, Ordering::SeqCst);
                        *first_error = Some(e);
                    }
                }
            },
            Some(Err(e)) => {
                abort.store(true, Ordering::SeqCst);
                if first_error.is_none() {
                    let e: Box<dyn Error> = e;
                    *first_error = Some(e);
                }
            },
            // skipped after an abort
            None => {}
        }
        Ok(())
    };

    for (region_index, region) in regions.iter().enumerate() {
        if first_error.is_some() {
            break;
        }
        if jobs_queued - results_received >= job_slots {
            receive_one(&mut first_error, &mut totals)?;
            results_received += 1;
            if results_received % UPDATE_SPEED == 0 {
                info!("Finished {} / {} regions in {:.2} seconds", results_received, regions.len(), start_time.elapsed().as_secs_f64());
            }
        }

        let tx = tx.clone();
        let region = region.clone();
        let reference = reference.clone();
        let catalogue = catalogue.clone();
        let read_source = read_source.clone();
        let config = config.clone();
        let abort = abort.clone();
        jobs_queued += 1;
        pool.execute(move || {
            if abort.load(Ordering::SeqCst) {
                tx.send(None).expect("channel will be there waiting for the pool");
                return;
            }
            let result = process_region(region_index, &region, &reference, &catalogue, read_source.as_ref(), &config)
                .map_err(|e| {
                    error!("Error while processing {}: {}", region, e);
                    into_worker_error(e)
                });
            tx.send(Some(result)).expect("channel will be there waiting for the pool");
        });
    }

    while results_received < jobs_queued {
        receive_one(&mut first_error, &mut totals)?;
        results_received += 1;
        if results_received % UPDATE_SPEED == 0 || (jobs_queued - results_received) < config.threads as u64 {
            debug!("Received {} / {} regions", results_received, jobs_queued);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::variant_candidate::{SubstitutionClass, VariantCandidate};
    use crate::data_types::variants::CatalogueVariant;
    use crate::read_source::InMemoryReadSource;

    fn catalogue_of(variants: &[(u64, &[&str])]) -> VariantCatalogue {
        VariantCatalogue::new(variants.iter()
            .map(|(pos, seqs)| {
                let candidate = VariantCandidate::new(*pos, seqs.iter().map(|s| s.as_bytes().to_vec()).collect()).unwrap();
                CatalogueVariant::new(candidate, None, None).unwrap()
            })
            .collect())
    }

    fn small_config() -> GenotypeConfig {
        GenotypeConfig {
            index: IndexConfig { k: 5, ..Default::default() },
            ..Default::default()
        }
    }

    /// `ACGTACGT` with a C>T SNP at 0-based position 1
    fn scenario(alt_reads: usize, ref_reads: usize) -> RegionOutput {
        let reference = ReferenceGenome::from_contigs(vec![("chr1".to_string(), b"ACGTACGT".to_vec())]);
        let catalogue = catalogue_of(&[(1, &["C", "T"])]);
        let mut read_source = InMemoryReadSource::new(vec!["sample1".to_string()]);
        for i in 0..alt_reads {
            read_source.add_read("chr1", 0, &format!("alt{i}"), b"ATGTACGT", 0);
        }
        for i in 0..ref_reads {
            read_source.add_read("chr1", 0, &format!("ref{i}"), b"ACGTACGT", 0);
        }
        let region = GenomicRegion::new("chr1", 0, 8);
        process_region(0, &region, &reference, &catalogue, &read_source, &small_config()).unwrap()
    }

    #[test]
    fn test_scenario_all_alt() {
        let output = scenario(10, 0);
        assert_eq!(output.calls.len(), 1);
        let call = &output.calls[0];
        assert_eq!(call.candidate().abs_pos(), 1);
        assert_eq!(call.candidate().seqs(), &[b"C".to_vec(), b"T".to_vec()]);
        assert_eq!(call.candidate().is_transition_or_transversion(), SubstitutionClass::Transition);
        let genotype = &call.genotypes()[0];
        assert_eq!(genotype.alleles(), Some((1, 1)));
        assert_eq!(genotype.allele_depths(), &[0, 10]);

        assert_eq!(output.stats.reads, 10);
        assert_eq!(output.stats.placed_reads, 10);
        assert_eq!(output.stats.unmapped_reads, 0);
        assert_eq!(output.stats.emitted_records, 1);
    }

    #[test]
    fn test_scenario_ref_wins() {
        let output = scenario(2, 8);
        assert_eq!(output.calls.len(), 1);
        let genotype = &output.calls[0].genotypes()[0];
        assert_eq!(genotype.alleles(), Some((0, 0)));
        assert_eq!(genotype.allele_depths(), &[8, 2]);
    }

    #[test]
    fn test_scenario_no_reads() {
        let output = scenario(0, 0);
        assert!(output.calls.is_empty());
        assert_eq!(output.stats.dropped_sites, 1);
    }

    #[test]
    fn test_unmapped_reads() {
        let reference = ReferenceGenome::from_contigs(vec![("chr1".to_string(), b"ACGTACGT".to_vec())]);
        let catalogue = catalogue_of(&[(1, &["C", "T"])]);
        let mut read_source = InMemoryReadSource::new(vec!["sample1".to_string()]);
        read_source.add_read("chr1", 0, "junk", b"GGGGGGGG", 0);
        read_source.add_read("chr1", 0, "short", b"ACG", 0);
        let region = GenomicRegion::new("chr1", 0, 8);
        let output = process_region(0, &region, &reference, &catalogue, &read_source, &small_config()).unwrap();
        assert_eq!(output.stats.reads, 2);
        assert_eq!(output.stats.unmapped_reads, 2);
        assert!(output.calls.is_empty());
    }

    #[test]
    fn test_plan_regions_split() {
        let reference = ReferenceGenome::from_contigs(vec![("chr1".to_string(), vec![b'A'; 120_000])]);
        let regions = plan_regions(&[GenomicRegion::new("chr1", 0, 120_000)], &reference, REGION_SIZE).unwrap();
        assert_eq!(regions, vec![
            GenomicRegion::new("chr1", 0, 50_000),
            GenomicRegion::new("chr1", 50_000, 100_000),
            GenomicRegion::new("chr1", 100_000, 120_000)
        ]);
        // contiguous and non-overlapping
        for pair in regions.windows(2) {
            assert_eq!(pair[0].end(), pair[1].begin());
        }
    }

    #[test]
    fn test_plan_regions_whole_genome() {
        let reference = ReferenceGenome::from_contigs(vec![
            ("chr1".to_string(), vec![b'A'; 30]),
            ("chr2".to_string(), vec![b'C'; 12])
        ]);
        let regions = plan_regions(&[], &reference, 10).unwrap();
        assert_eq!(regions, vec![
            GenomicRegion::new("chr1", 0, 10),
            GenomicRegion::new("chr1", 10, 20),
            GenomicRegion::new("chr1", 20, 30),
            GenomicRegion::new("chr2", 0, 12)
        ]);

        // overlapping requests are merged first
        let regions = plan_regions(&[
            GenomicRegion::new("chr2", 0, 5),
            GenomicRegion::new("chr1", 5, 15),
            GenomicRegion::new("chr1", 12, 18)
        ], &reference, 100).unwrap();
        assert_eq!(regions, vec![
            GenomicRegion::new("chr1", 5, 18),
            GenomicRegion::new("chr2", 0, 5)
        ]);

        assert!(plan_regions(&[GenomicRegion::new("chrX", 0, 5)], &reference, 100).is_err());
    }

    /// Two contigs with one SNP each and reads supporting both
    fn multi_region_inputs() -> (Arc<ReferenceGenome>, Arc<VariantCatalogue>, Arc<dyn ReadSource>, Vec<GenomicRegion>) {
        let chr1: &[u8] = b"TTGACCATGAGCTAGGCTAACGTTCAGTCCGATGCAATCG";
        let chr2: &[u8] = b"GATTACAGGCATCCAGTTGCAACTGGATCCTAGGTCAAGT";
        let reference = ReferenceGenome::from_contigs(vec![
            ("chr1".to_string(), chr1.to_vec()),
            ("chr2".to_string(), chr2.to_vec())
        ]);
        let chr2_offset = chr1.len() as u64;
        // chr1:25 A>G and chr2:15 G>C
        let catalogue = catalogue_of(&[(25, &["A", "G"]), (chr2_offset + 15, &["G", "C"])]);

        let mut read_source = InMemoryReadSource::new(vec!["s1".to_string(), "s2".to_string()]);
        let mut chr1_alt = chr1.to_vec();
        chr1_alt[25] = b'G';
        let mut chr2_alt = chr2.to_vec();
        chr2_alt[15] = b'C';
        // reads stay inside a single 20 bp region
        for i in 0..6 {
            read_source.add_read("chr1", 21, &format!("a{i}"), &chr1_alt[21..37], 0);
            read_source.add_read("chr1", 21, &format!("b{i}"), &chr1[21..37], 1);
            read_source.add_read("chr2", 2, &format!("c{i}"), &chr2[2..18], 0);
            read_source.add_read("chr2", 2, &format!("d{i}"), &chr2_alt[2..18], 1);
        }

        let regions = plan_regions(&[], &reference, 20).unwrap();
        let read_source: Arc<dyn ReadSource> = Arc::new(read_source);
        (Arc::new(reference), Arc::new(catalogue), read_source, regions)
    }

    fn run_collect(threads: usize) -> (Vec<RegionOutput>, RegionStats) {
        let (reference, catalogue, read_source, regions) = multi_region_inputs();
        let config = GenotypeConfig {
            index: IndexConfig { k: 8, ..Default::default() },
            threads,
            region_size: 20,
            ..Default::default()
        };
        let mut outputs: Vec<RegionOutput> = vec![];
        let totals = run_regions(&regions, reference, catalogue, read_source, Arc::new(config), |o| {
            outputs.push(o);
            Ok(())
        }).unwrap();
        outputs.sort_by_key(|o| o.region_index);
        (outputs, totals)
    }

    #[test]
    fn test_run_regions() {
        let (outputs, totals) = run_collect(1);
        assert_eq!(outputs.len(), 4);
        let calls: Vec<&GenotypeCall> = outputs.iter().flat_map(|o| o.calls.iter()).collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].candidate().abs_pos(), 25);
        assert_eq!(calls[0].genotypes()[0].alleles(), Some((1, 1)));
        assert_eq!(calls[0].genotypes()[1].alleles(), Some((0, 0)));
        assert_eq!(calls[1].candidate().abs_pos(), 55);
        assert_eq!(calls[1].genotypes()[0].alleles(), Some((0, 0)));
        assert_eq!(calls[1].genotypes()[1].alleles(), Some((1, 1)));
        assert_eq!(totals.sites, 2);
        assert_eq!(totals.emitted_records, 2);
    }

    #[test]
    fn test_run_regions_parallel_matches() {
        let (serial, serial_totals) = run_collect(1);
        let (parallel, parallel_totals) = run_collect(3);
        assert_eq!(serial.len(), parallel.len());
        for (a, b) in serial.iter().zip(parallel.iter()) {
            assert_eq!(a.region, b.region);
            assert_eq!(a.calls, b.calls);
        }
        assert_eq!(serial_totals.emitted_records, parallel_totals.emitted_records);
        assert_eq!(serial_totals.placed_reads, parallel_totals.placed_reads);
    }

    #[test]
    fn test_run_regions_receiver_error() {
        let (reference, catalogue, read_source, regions) = multi_region_inputs();
        let config = GenotypeConfig { index: IndexConfig { k: 8, ..Default::default() }, threads: 2, region_size: 20, ..Default::default() };
        let result = run_regions(&regions, reference, catalogue, read_source, Arc::new(config), |_| {
            Err("sink failed".into())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_read_crossing_region_edge() {
        let chr1: &[u8] = b"TTGACCATGAGCTAGGCTAACGTTCAGTCCGATGCAATCGGATTACAGGCATCCAGTTGC";
        let reference = Arc::new(ReferenceGenome::from_contigs(vec![("chr1".to_string(), chr1.to_vec())]));
        // chr1:18 A>G, two bases before the first region ends
        let catalogue = Arc::new(catalogue_of(&[(18, &["A", "G"])]));
        let mut alt = chr1.to_vec();
        alt[18] = b'G';
        let mut read_source = InMemoryReadSource::new(vec!["s1".to_string()]);
        for i in 0..6 {
            read_source.add_read("chr1", 10, &format!("edge{i}"), &alt[10..26], 0);
        }
        let read_source: Arc<dyn ReadSource> = Arc::new(read_source);

        let config = GenotypeConfig { index: IndexConfig { k: 8, ..Default::default() }, region_size: 20, ..Default::default() };
        let regions = plan_regions(&[], &reference, config.region_size).unwrap();
        assert_eq!(regions[0], GenomicRegion::new("chr1", 0, 20));

        let mut outputs: Vec<RegionOutput> = vec![];
        run_regions(&regions, reference, catalogue, read_source, Arc::new(config), |o| {
            outputs.push(o);
            Ok(())
        }).unwrap();
        outputs.sort_by_key(|o| o.region_index);

        // the reads reach past the region end but still align in full
        let first = &outputs[0];
        assert_eq!(first.stats.reads, 6);
        assert_eq!(first.stats.placed_reads, 6);
        assert_eq!(first.calls.len(), 1);
        assert_eq!(first.calls[0].candidate().abs_pos(), 18);
        assert_eq!(first.calls[0].genotypes()[0].alleles(), Some((1, 1)));
        assert_eq!(first.calls[0].genotypes()[0].allele_depths(), &[0, 6]);

        // the next region sees the same reads but does not call the site again
        let second = &outputs[1];
        assert_eq!(second.stats.reads, 6);
        assert_eq!(second.stats.sites, 0);
        assert!(second.calls.is_empty());
    }

    #[test]
    fn test_region_error_keeps_type() {
        for threads in [1, 2] {
            let (reference, catalogue, read_source, mut regions) = multi_region_inputs();
            regions.push(GenomicRegion::new("chrX", 0, 10));
            let config = GenotypeConfig { index: IndexConfig { k: 8, ..Default::default() }, threads, region_size: 20, ..Default::default() };
            let error = run_regions(&regions, reference, catalogue, read_source, Arc::new(config), |_| Ok(())).unwrap_err();
            assert!(matches!(error.downcast_ref::<InputError>(), Some(InputError::UnknownContig { .. })), "{error}");
        }
    }
}
