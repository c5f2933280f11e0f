
use graphtyper::cli::{BreakDownSettings, CallSettings, CheckSettings, Command, ConcatenateSettings, ConstructSettings, GenotypeSettings, MergeSettings, Settings, check_settings, get_raw_settings};
use graphtyper::data_types::genomic_region::GenomicRegion;
use graphtyper::data_types::reference_genome::{InputError, ReferenceGenome};
use graphtyper::graph_index::{GraphIndex, default_index_path};
use graphtyper::pipeline::{GenotypeConfig, RegionStats, genotype_reads, plan_regions, run_regions};
use graphtyper::read_source::{BamReadSource, FileHandleLimiter, ReadSource};
use graphtyper::reference_graph::ReferenceGraph;
use graphtyper::variant_catalogue::VariantCatalogue;
use graphtyper::variant_map::CallerError;
use graphtyper::writers::ordered_vcf_writer::OrderedVcfWriter;
use graphtyper::writers::region_stats::StatsWriter;
use graphtyper::writers::vcf_break_down::break_down_vcf;
use graphtyper::writers::vcf_concatenate::concatenate_vcfs;
use graphtyper::writers::vcf_merge::merge_vcfs;
use graphtyper::writers::vcf_util::{build_bcf_index, csi_required, is_indexable};

use log::{LevelFilter, error, info, warn};
use simple_error::bail;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Picks the exit code for a failed run from the kind of error that ended it.
/// Format and I/O failures fall through to `IOERR`.
fn exit_code(error: &(dyn Error + 'static)) -> exitcode::ExitCode {
    if error.downcast_ref::<InputError>().is_some() {
        exitcode::NOINPUT
    } else if error.downcast_ref::<CallerError>().is_some() {
        exitcode::SOFTWARE
    } else {
        exitcode::IOERR
    }
}

/// Loads the reference and reports how long it took.
fn load_reference(filename: &Path) -> Result<ReferenceGenome, Box<dyn Error>> {
    info!("Loading reference genome from {:?}...", filename);
    let start_time: Instant = Instant::now();
    let reference = ReferenceGenome::from_fasta(filename)?;
    info!("Finished loading {} contigs in {} seconds.", reference.contig_keys().len(), start_time.elapsed().as_secs_f32());
    Ok(reference)
}

/// Loads the catalogue if one was given, otherwise returns an empty one.
fn load_catalogue(filename: Option<&PathBuf>, reference: &ReferenceGenome, is_sv: bool) -> Result<VariantCatalogue, Box<dyn Error>> {
    let Some(filename) = filename else {
        return Ok(VariantCatalogue::default());
    };
    info!("Loading variant catalogue from {:?}...", filename);
    let catalogue = VariantCatalogue::from_vcf(filename, reference, is_sv)?;
    info!("Loaded {} variants, rejected {}, skipped {} structural variants", catalogue.len(), catalogue.rejected(), catalogue.skipped_sv());
    Ok(catalogue)
}

/// Indexes a finished output if it is block-compressed.
fn index_output(filename: &Path, csi_index: bool) -> Result<(), Box<dyn Error>> {
    if !is_indexable(filename) {
        return Ok(());
    }
    info!("Building index for {:?}...", filename);
    build_bcf_index(filename, None, 1, !csi_index)?;
    Ok(())
}

fn run_construct(settings: &ConstructSettings) -> Result<(), Box<dyn Error>> {
    let reference = load_reference(&settings.reference_filename)?;
    let catalogue = load_catalogue(settings.vcf_filename.as_ref(), &reference, settings.is_sv)?;
    let region = GenomicRegion::parse(&settings.region)?.clamp(&reference)?;
    let (abs_begin, abs_end) = region.absolute_range(&reference)?;

    let graph_config = settings.graph.graph_config(settings.is_sv);
    let graph = ReferenceGraph::build(&reference, catalogue.in_range(abs_begin, abs_end), &region, &graph_config)?;
    info!("Built graph for {} with {} nodes and {} variant sites ({} variants rejected)", region, graph.num_nodes(), graph.sites().len(), graph.rejected_variants());
    if let Err(defects) = graph.check() {
        for defect in defects.iter() {
            error!("{}", defect);
        }
        bail!("Graph for {} has {} structural defects", region, defects.len());
    }
    graph.save(&settings.output_graph)?;
    info!("Graph saved to {:?}", settings.output_graph);

    if settings.skip_index {
        return Ok(());
    }
    let index = GraphIndex::build(&graph, &settings.graph.index_config())?;
    if !index.low_confidence_sites().is_empty() {
        warn!("{} sites had bubble paths left out of the index", index.low_confidence_sites().len());
    }
    let index_filename = settings.output_index.clone().unwrap_or_else(|| default_index_path(&settings.output_graph));
    index.save(&index_filename)?;
    info!("Index with {} k-mers saved to {:?}", index.len(), index_filename);
    Ok(())
}

fn run_check(settings: &CheckSettings) -> Result<(), Box<dyn Error>> {
    let graph = ReferenceGraph::load(&settings.graph_filename)?;
    if let Err(defects) = graph.check() {
        for defect in defects.iter() {
            error!("{}", defect);
        }
        bail!("Graph {:?} has {} structural defects", settings.graph_filename, defects.len());
    }
    info!("Graph {:?} for {} is valid: {} nodes, {} sites", settings.graph_filename, graph.region(), graph.num_nodes(), graph.sites().len());

    if let Some(index_filename) = settings.index_filename.as_ref() {
        let index = GraphIndex::load(index_filename, &graph)?;
        info!("Index {:?} matches the graph: k={}, {} k-mers", index_filename, index.k(), index.len());
    }
    Ok(())
}

fn run_call(settings: &CallSettings) -> Result<(), Box<dyn Error>> {
    let mut graph = ReferenceGraph::load(&settings.graph_filename)?;
    let index_filename = settings.index_filename.clone().unwrap_or_else(|| default_index_path(&settings.graph_filename));
    let index = GraphIndex::load(&index_filename, &graph)?;
    graph.flag_low_confidence(index.low_confidence_sites());

    let reference = Arc::new(load_reference(&settings.reference_filename)?);
    let limiter = Arc::new(FileHandleLimiter::new(settings.reads.max_files_open));
    let read_source = BamReadSource::new(&settings.reads.bam_filenames, &settings.reference_filename, settings.reads.min_mapq, limiter)?;

    let config = GenotypeConfig {
        placement: settings.reads.placement_config(),
        thresholds: settings.calling.thresholds(),
        decompose: settings.calling.decompose_options(),
        max_files_open: settings.reads.max_files_open,
        min_mapq: settings.reads.min_mapq,
        ..Default::default()
    };

    let reads = read_source.fetch(graph.region())?;
    let num_samples = read_source.sample_names().len();
    let (calls, stats) = genotype_reads(&graph, &index, &reads, num_samples, reference.as_ref(), &config)?;
    info!("Placed {} / {} reads, wrote {} records", stats.placed_reads, stats.reads, stats.emitted_records);

    {
        let mut vcf_writer = OrderedVcfWriter::new(&settings.output_vcf_filename, reference.clone(), read_source.sample_names())?;
        vcf_writer.write_calls(&calls)?;
    }
    index_output(&settings.output_vcf_filename, csi_required(&reference))
}

fn run_genotype(settings: &GenotypeSettings, is_sv: bool) -> Result<(), Box<dyn Error>> {
    let config: GenotypeConfig = settings.genotype_config(is_sv);
    let reference = Arc::new(load_reference(&settings.reference_filename)?);
    if !settings.csi_index && is_indexable(&settings.output_vcf_filename) && csi_required(&reference) {
        error!("Output files will require .csi indexing (contig length > 2^29 - 1); use --csi-index to enable");
        std::process::exit(exitcode::USAGE);
    }

    let catalogue = Arc::new(load_catalogue(settings.vcf_filename.as_ref(), &reference, is_sv)?);
    let requested = settings.requested_regions()?;
    let regions = plan_regions(&requested, &reference, config.region_size)?;
    info!("Planned {} regions", regions.len());

    let limiter = Arc::new(FileHandleLimiter::new(config.max_files_open));
    let read_source = BamReadSource::new(&settings.reads.bam_filenames, &settings.reference_filename, config.min_mapq, limiter)?;
    info!("Genotyping {} samples: {:?}", read_source.sample_names().len(), read_source.sample_names());
    let read_source: Arc<dyn ReadSource> = Arc::new(read_source);

    let mut stats_writer: Option<StatsWriter> = match settings.stats_filename.as_ref() {
        Some(filename) => {
            info!("Saving region statistics to {:?}", filename);
            Some(StatsWriter::new(filename)?)
        },
        None => None
    };

    let start_time: Instant = Instant::now();
    let mut vcf_writer = OrderedVcfWriter::new(&settings.output_vcf_filename, reference.clone(), read_source.sample_names())?;
    let totals: RegionStats = run_regions(&regions, reference.clone(), catalogue, read_source, Arc::new(config), |output| {
        if let Some(writer) = stats_writer.as_mut() {
            writer.write_region(&output)?;
        }
        vcf_writer.write_region(output)
    })?;

    if !vcf_writer.is_drained() {
        bail!("Output writer still waiting on region {}", vcf_writer.get_wait_region());
    }
    let records_written = vcf_writer.records_written();
    // closes the file before indexing
    std::mem::drop(vcf_writer);

    info!(
        "Finished {} regions in {:.2} seconds: {} sites, {} / {} reads placed, {} records written",
        regions.len(), start_time.elapsed().as_secs_f64(), totals.sites, totals.placed_reads, totals.reads, records_written
    );
    index_output(&settings.output_vcf_filename, settings.csi_index)
}

fn run_break_down(settings: &BreakDownSettings) -> Result<(), Box<dyn Error>> {
    let reference = Arc::new(load_reference(&settings.reference_filename)?);
    let region = match settings.region.as_ref() {
        Some(r) => Some(GenomicRegion::parse(r)?.clamp(&reference)?),
        None => None
    };
    break_down_vcf(&settings.input_filename, &settings.output_vcf_filename, reference.clone(), region.as_ref())?;
    index_output(&settings.output_vcf_filename, csi_required(&reference))
}

fn run_concatenate(settings: &ConcatenateSettings) -> Result<(), Box<dyn Error>> {
    let options = settings.concatenate_options()?;
    concatenate_vcfs(&settings.input_filenames, &settings.output_vcf_filename, &options)?;
    index_output(&settings.output_vcf_filename, settings.csi_index)
}

fn run_merge(settings: &MergeSettings) -> Result<(), Box<dyn Error>> {
    let inputs = settings.all_inputs()?;
    let reference = Arc::new(load_reference(&settings.reference_filename)?);
    merge_vcfs(&inputs, &settings.output_vcf_filename, reference.clone())?;
    index_output(&settings.output_vcf_filename, csi_required(&reference))
}

fn main() {
    // get the settings
    let settings: Settings = get_raw_settings();
    let filter_level: LevelFilter = match settings.verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace
    };

    // immediately setup logging first
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(filter_level)
        .init();

    // okay, now we can check all the other settings
    let cli_settings: Settings = check_settings(settings);

    let start_time: Instant = Instant::now();
    let result = match &cli_settings.command {
        Command::Construct(s) => run_construct(s),
        Command::Check(s) => run_check(s),
        Command::Call(s) => run_call(s),
        Command::Genotype(s) => run_genotype(s, false),
        Command::GenotypeSv(s) => run_genotype(s, true),
        Command::VcfBreakDown(s) => run_break_down(s),
        Command::VcfConcatenate(s) => run_concatenate(s),
        Command::VcfMerge(s) => run_merge(s)
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(exit_code(e.as_ref()));
    }
    info!("Total run time: {} seconds", start_time.elapsed().as_secs_f32());
}
