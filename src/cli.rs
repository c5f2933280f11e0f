
use clap::{Args, Parser, Subcommand};
use chrono::Datelike;
use flate2::bufread::MultiGzDecoder;
use lazy_static::lazy_static;
use log::{error, info, trace, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::data_types::genomic_region::{GenomicRegion, REGION_SIZE, SV_REGION_SIZE};
use crate::data_types::reference_genome::InputError;
use crate::graph_index::{IndexConfig, MAX_K};
use crate::pipeline::GenotypeConfig;
use crate::read_placer::PlacementConfig;
use crate::reference_graph::GraphConfig;
use crate::variant_map::{CallThresholds, DecomposeOptions};
use crate::writers::vcf_concatenate::ConcatenateOptions;

lazy_static! {
    /// Stores the full version string we plan to use.
    /// # Examples
    /// * `0.1.0-6bb9635-dirty` - while on a dirty branch
    /// * `0.1.0-6bb9635` - with a fresh commit
    pub static ref FULL_VERSION: String = format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("VERGEN_GIT_DESCRIBE"));
}

#[derive(Clone, Parser)]
#[clap(author,
    version = &**FULL_VERSION,
    about,
    after_help = format!("Copyright (C) 2014-{}     graphtyper developers
This program comes with ABSOLUTELY NO WARRANTY.", chrono::Utc::now().year()))]
pub struct Settings {
    /// Enable verbose output
    #[clap(short = 'v')]
    #[clap(long = "verbose")]
    #[clap(action = clap::ArgAction::Count)]
    #[clap(global = true)]
    pub verbosity: u8,

    #[clap(subcommand)]
    pub command: Command
}

#[derive(Clone, Subcommand)]
pub enum Command {
    /// Build a graph for one region and save it with its index
    Construct(ConstructSettings),
    /// Validate a saved graph and, optionally, its index
    Check(CheckSettings),
    /// Genotype reads against a saved graph
    Call(CallSettings),
    /// Genotype SNPs and indels over regions
    Genotype(GenotypeSettings),
    /// Genotype structural variants over regions
    #[clap(name = "genotype_sv")]
    GenotypeSv(GenotypeSettings),
    /// Split multi-allelic records of a genotyped VCF into non-overlapping records
    #[clap(name = "vcf_break_down")]
    VcfBreakDown(BreakDownSettings),
    /// Concatenate VCFs with the same samples, merging by position unless --no-sort is set
    #[clap(name = "vcf_concatenate")]
    VcfConcatenate(ConcatenateSettings),
    /// Join the samples of genotyped VCFs into one VCF
    #[clap(name = "vcf_merge")]
    VcfMerge(MergeSettings)
}

/// Options that shape the graph
#[derive(Args, Clone, Debug)]
pub struct GraphArgs {
    /// Merge overlapping variants into one bubble with every compatible allele combination
    #[clap(long = "add-all-variants")]
    #[clap(help_heading = Some("Graph"))]
    pub add_all_variants: bool,

    /// Maximum number of paths enumerated through one bubble, for both merging and indexing
    #[clap(long = "max-bubble-paths")]
    #[clap(value_name = "PATHS")]
    #[clap(default_value = "64")]
    #[clap(help_heading = Some("Graph"))]
    pub max_bubble_paths: usize,

    /// k-mer length of the graph index
    #[clap(short = 'k')]
    #[clap(long = "kmer-size")]
    #[clap(value_name = "K")]
    #[clap(default_value = "32")]
    #[clap(help_heading = Some("Graph"))]
    pub kmer_size: usize,

    /// Reference bases added on each side of a region so reads crossing its edges still align, should be at least the read length
    #[clap(long = "graph-flank")]
    #[clap(value_name = "BASES")]
    #[clap(default_value = "200")]
    #[clap(help_heading = Some("Graph"))]
    pub graph_flank: u64
}

impl GraphArgs {
    pub fn graph_config(&self, is_sv: bool) -> GraphConfig {
        GraphConfig {
            is_sv,
            add_all_variants: self.add_all_variants,
            max_bubble_paths: self.max_bubble_paths,
            flank: self.graph_flank
        }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            k: self.kmer_size,
            max_bubble_paths: self.max_bubble_paths
        }
    }

    fn check(&self) {
        if self.kmer_size == 0 || self.kmer_size > MAX_K {
            error!("--kmer-size must be in the range [1, {}]", MAX_K);
            std::process::exit(exitcode::USAGE);
        }
        if self.max_bubble_paths == 0 {
            error!("--max-bubble-paths must be at least 1");
            std::process::exit(exitcode::USAGE);
        }
        info!("Graph:");
        info!("\tAdd all variants: {}", if self.add_all_variants { "ENABLED" } else { "DISABLED" });
        info!("\tMaximum bubble paths: {}", self.max_bubble_paths);
        info!("\tk-mer size: {}", self.kmer_size);
        info!("\tGraph flank: {}", self.graph_flank);
    }
}

/// Options for read input and placement
#[derive(Args, Clone, Debug)]
pub struct ReadArgs {
    /// Input alignment file in BAM/CRAM format, indexed
    #[clap(required = true)]
    #[clap(short = 'b')]
    #[clap(long = "bam")]
    #[clap(value_name = "BAM")]
    #[clap(help_heading = Some("Input/Output"))]
    pub bam_filenames: Vec<PathBuf>,

    /// Sets a minimum MAPQ to include a read
    #[clap(long = "min-mapq")]
    #[clap(value_name = "MAPQ")]
    #[clap(default_value = "0")]
    #[clap(help_heading = Some("Read Placement"))]
    pub min_mapq: u8,

    /// Maximum number of alignment files open at the same time
    #[clap(long = "max-files-open")]
    #[clap(value_name = "COUNT")]
    #[clap(default_value = "1000")]
    #[clap(help_heading = Some("Read Placement"))]
    pub max_files_open: usize,

    /// Distance between seed starts along a read, 0 for one seed every k bases
    #[clap(long = "seed-step")]
    #[clap(value_name = "BASES")]
    #[clap(default_value = "0")]
    #[clap(help_heading = Some("Read Placement"))]
    pub seed_step: usize,

    /// Maximum edits in an accepted read alignment
    #[clap(long = "max-edits")]
    #[clap(value_name = "COUNT")]
    #[clap(default_value = "8")]
    #[clap(help_heading = Some("Read Placement"))]
    pub max_edits: usize,

    /// Minimum fraction of matching read bases in an accepted alignment
    #[clap(long = "min-identity")]
    #[clap(value_name = "FRAC")]
    #[clap(default_value = "0.9")]
    #[clap(help_heading = Some("Read Placement"))]
    pub min_identity: f64,

    /// Seeds with more graph locations than this are skipped as repeats
    #[clap(long = "max-seed-locations")]
    #[clap(value_name = "COUNT")]
    #[clap(default_value = "64")]
    #[clap(help_heading = Some("Read Placement"))]
    pub max_seed_locations: usize
}

impl ReadArgs {
    pub fn placement_config(&self) -> PlacementConfig {
        PlacementConfig {
            seed_step: self.seed_step,
            max_edits: self.max_edits,
            min_identity: self.min_identity,
            max_seed_locations: self.max_seed_locations,
            ..Default::default()
        }
    }

    fn check(&mut self) {
        for filename in self.bam_filenames.iter() {
            check_required_filename(filename, "Alignment file");
        }
        if !(0.0..=1.0).contains(&self.min_identity) {
            error!("--min-identity must be in the range [0.0, 1.0]");
            std::process::exit(exitcode::USAGE);
        }
        // 0 doesn't make sense, so lets just error proof it up to 1
        if self.max_files_open == 0 {
            self.max_files_open = 1;
        }
        info!("Read placement:");
        info!("\tMinimum mapping quality: {}", self.min_mapq);
        info!("\tMaximum edits: {}", self.max_edits);
        info!("\tMinimum identity: {}", self.min_identity);
        info!("\tMaximum open files: {}", self.max_files_open);
    }
}

/// Options for genotype calling and output records
#[derive(Args, Clone, Debug)]
pub struct CallingArgs {
    /// Minimum reads supporting an allele for it to be called
    #[clap(long = "min-support-count")]
    #[clap(value_name = "READS")]
    #[clap(default_value = "5")]
    #[clap(help_heading = Some("Calling"))]
    pub min_support_count: u32,

    /// Minimum fraction of a sample's reads supporting an allele for it to be called
    #[clap(long = "min-support-ratio")]
    #[clap(value_name = "FRAC")]
    #[clap(default_value = "0.25")]
    #[clap(help_heading = Some("Calling"))]
    pub min_support_ratio: f64,

    /// Write sites where no sample passes the thresholds as missing genotypes
    #[clap(long = "emit-no-calls")]
    #[clap(help_heading = Some("Calling"))]
    pub emit_no_calls: bool,

    /// Write every site as one record
    #[clap(long = "no-decompose")]
    #[clap(help_heading = Some("Calling"))]
    pub no_decompose: bool,

    /// Keep overlapping alleles in one record
    #[clap(long = "no-variant-overlapping")]
    #[clap(help_heading = Some("Calling"))]
    pub no_variant_overlapping: bool
}

impl CallingArgs {
    pub fn thresholds(&self) -> CallThresholds {
        CallThresholds {
            min_support_count: self.min_support_count,
            min_support_ratio: self.min_support_ratio,
            emit_no_calls: self.emit_no_calls
        }
    }

    pub fn decompose_options(&self) -> DecomposeOptions {
        DecomposeOptions {
            no_decompose: self.no_decompose,
            no_variant_overlapping: self.no_variant_overlapping
        }
    }

    fn check(&self) {
        if !(0.0..=1.0).contains(&self.min_support_ratio) {
            error!("--min-support-ratio must be in the range [0.0, 1.0]");
            std::process::exit(exitcode::USAGE);
        }
        info!("Calling:");
        info!("\tMinimum support count: {}", self.min_support_count);
        info!("\tMinimum support ratio: {}", self.min_support_ratio);
        info!("\tEmit no-calls: {}", if self.emit_no_calls { "ENABLED" } else { "DISABLED" });
        info!("\tDecomposition: {}", if self.no_decompose || self.no_variant_overlapping { "DISABLED" } else { "ENABLED" });
    }
}

#[derive(Args, Clone, Debug)]
pub struct ConstructSettings {
    /// Reference FASTA file
    #[clap(required = true)]
    #[clap(short = 'r')]
    #[clap(long = "reference")]
    #[clap(value_name = "FASTA")]
    #[clap(help_heading = Some("Input/Output"))]
    pub reference_filename: PathBuf,

    /// Variant catalogue in VCF format, omit for a reference-only graph
    #[clap(short = 'c')]
    #[clap(long = "vcf")]
    #[clap(value_name = "VCF")]
    #[clap(help_heading = Some("Input/Output"))]
    pub vcf_filename: Option<PathBuf>,

    /// Region of the graph, chr:begin-end (1-based, inclusive) or a contig name
    #[clap(required = true)]
    #[clap(long = "region")]
    #[clap(value_name = "REGION")]
    #[clap(help_heading = Some("Input/Output"))]
    pub region: String,

    /// Output graph file
    #[clap(required = true)]
    #[clap(short = 'o')]
    #[clap(long = "output")]
    #[clap(value_name = "GRAPH")]
    #[clap(help_heading = Some("Input/Output"))]
    pub output_graph: PathBuf,

    /// Output index file (default: <GRAPH>.gti)
    #[clap(long = "output-index")]
    #[clap(value_name = "INDEX")]
    #[clap(help_heading = Some("Input/Output"))]
    pub output_index: Option<PathBuf>,

    /// Do not build the index
    #[clap(long = "skip-index")]
    #[clap(help_heading = Some("Input/Output"))]
    pub skip_index: bool,

    /// Include structural variants from the catalogue
    #[clap(long = "sv")]
    #[clap(help_heading = Some("Graph"))]
    pub is_sv: bool,

    #[clap(flatten)]
    pub graph: GraphArgs
}

#[derive(Args, Clone, Debug)]
pub struct CheckSettings {
    /// Graph file to validate
    #[clap(required = true)]
    #[clap(short = 'g')]
    #[clap(long = "graph")]
    #[clap(value_name = "GRAPH")]
    #[clap(help_heading = Some("Input/Output"))]
    pub graph_filename: PathBuf,

    /// Index file to validate against the graph
    #[clap(long = "index")]
    #[clap(value_name = "INDEX")]
    #[clap(help_heading = Some("Input/Output"))]
    pub index_filename: Option<PathBuf>
}

#[derive(Args, Clone, Debug)]
pub struct CallSettings {
    /// Graph file from `construct`
    #[clap(required = true)]
    #[clap(short = 'g')]
    #[clap(long = "graph")]
    #[clap(value_name = "GRAPH")]
    #[clap(help_heading = Some("Input/Output"))]
    pub graph_filename: PathBuf,

    /// Index file (default: <GRAPH>.gti)
    #[clap(long = "index")]
    #[clap(value_name = "INDEX")]
    #[clap(help_heading = Some("Input/Output"))]
    pub index_filename: Option<PathBuf>,

    /// Reference FASTA file the graph was built from
    #[clap(required = true)]
    #[clap(short = 'r')]
    #[clap(long = "reference")]
    #[clap(value_name = "FASTA")]
    #[clap(help_heading = Some("Input/Output"))]
    pub reference_filename: PathBuf,

    /// Output genotypes in VCF format (.vcf, .vcf.gz, or .bcf)
    #[clap(required = true)]
    #[clap(short = 'o')]
    #[clap(long = "output-vcf")]
    #[clap(value_name = "VCF")]
    #[clap(help_heading = Some("Input/Output"))]
    pub output_vcf_filename: PathBuf,

    #[clap(flatten)]
    pub reads: ReadArgs,

    #[clap(flatten)]
    pub calling: CallingArgs
}

#[derive(Args, Clone, Debug)]
pub struct GenotypeSettings {
    /// Reference FASTA file
    #[clap(required = true)]
    #[clap(short = 'r')]
    #[clap(long = "reference")]
    #[clap(value_name = "FASTA")]
    #[clap(help_heading = Some("Input/Output"))]
    pub reference_filename: PathBuf,

    /// Variant catalogue in VCF format, omit to genotype against the reference only
    #[clap(short = 'c')]
    #[clap(long = "vcf")]
    #[clap(value_name = "VCF")]
    #[clap(help_heading = Some("Input/Output"))]
    pub vcf_filename: Option<PathBuf>,

    /// Output genotypes in VCF format (.vcf, .vcf.gz, or .bcf)
    #[clap(required = true)]
    #[clap(short = 'o')]
    #[clap(long = "output-vcf")]
    #[clap(value_name = "VCF")]
    #[clap(help_heading = Some("Input/Output"))]
    pub output_vcf_filename: PathBuf,

    /// Region to genotype, chr:begin-end (1-based, inclusive) or a contig name; may be repeated
    #[clap(long = "region")]
    #[clap(value_name = "REGION")]
    #[clap(help_heading = Some("Input/Output"))]
    pub regions: Vec<String>,

    /// File with one region per line
    #[clap(long = "region-file")]
    #[clap(value_name = "FILE")]
    #[clap(help_heading = Some("Input/Output"))]
    pub region_filename: Option<PathBuf>,

    /// Output per-region statistics file (optional, csv/tsv)
    #[clap(long = "stats-file")]
    #[clap(value_name = "FILE")]
    #[clap(help_heading = Some("Input/Output"))]
    pub stats_filename: Option<PathBuf>,

    /// Output .csi indices instead of .tbi
    #[clap(long = "csi-index")]
    #[clap(help_heading = Some("Input/Output"))]
    pub csi_index: bool,

    /// Length of the regions processed independently (default: 50000, 1000000 for genotype_sv)
    #[clap(long = "region-size")]
    #[clap(value_name = "LENGTH")]
    #[clap(help_heading = Some("Input/Output"))]
    pub region_size: Option<u64>,

    /// Number of threads to use for genotyping
    #[clap(short = 't')]
    #[clap(long = "threads")]
    #[clap(value_name = "THREADS")]
    #[clap(default_value = "1")]
    pub threads: usize,

    #[clap(flatten)]
    pub graph: GraphArgs,

    #[clap(flatten)]
    pub reads: ReadArgs,

    #[clap(flatten)]
    pub calling: CallingArgs
}

impl GenotypeSettings {
    /// Bundles the checked settings into the configuration handed to the pipeline.
    /// # Arguments
    /// * `is_sv` - true for `genotype_sv`
    pub fn genotype_config(&self, is_sv: bool) -> GenotypeConfig {
        let default_size = if is_sv { SV_REGION_SIZE } else { REGION_SIZE };
        GenotypeConfig {
            graph: self.graph.graph_config(is_sv),
            index: self.graph.index_config(),
            placement: self.reads.placement_config(),
            thresholds: self.calling.thresholds(),
            decompose: self.calling.decompose_options(),
            threads: self.threads.max(1),
            max_files_open: self.reads.max_files_open,
            region_size: self.region_size.unwrap_or(default_size),
            min_mapq: self.reads.min_mapq
        }
    }

    /// Parses `--region` values and the lines of `--region-file`.
    /// Blank lines and lines starting with `#` are skipped.
    /// # Errors
    /// * if the region file cannot be read or any region string is malformed
    pub fn requested_regions(&self) -> Result<Vec<GenomicRegion>, Box<dyn std::error::Error>> {
        let mut regions: Vec<GenomicRegion> = vec![];
        for region in self.regions.iter() {
            regions.push(GenomicRegion::parse(region)?);
        }
        if let Some(filename) = self.region_filename.as_ref() {
            let file_reader = BufReader::new(File::open(filename)?);
            for line in file_reader.lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                regions.push(GenomicRegion::parse(line)?);
            }
        }
        Ok(regions)
    }
}

#[derive(Args, Clone, Debug)]
pub struct ConcatenateSettings {
    /// Input VCFs with the same samples, each position-sorted unless --no-sort is set
    #[clap(required = true)]
    #[clap(value_name = "VCF")]
    pub input_filenames: Vec<PathBuf>,

    /// Output VCF (.vcf, .vcf.gz, or .bcf)
    #[clap(required = true)]
    #[clap(short = 'o')]
    #[clap(long = "output-vcf")]
    #[clap(value_name = "VCF")]
    pub output_vcf_filename: PathBuf,

    /// Append the inputs in the order given instead of merging them by position
    #[clap(long = "no-sort")]
    pub no_sort: bool,

    /// Drop all sample columns from the output
    #[clap(long = "sites-only")]
    pub sites_only: bool,

    /// Only keep records starting in this region, chr:begin-end (1-based, inclusive) or a contig name
    #[clap(long = "region")]
    #[clap(value_name = "REGION")]
    pub region: Option<String>,

    /// Maximum number of inputs open at once while merging
    #[clap(long = "max-files-open")]
    #[clap(value_name = "NUM")]
    #[clap(default_value = "1000")]
    pub max_files_open: usize,

    /// Output .csi indices instead of .tbi
    #[clap(long = "csi-index")]
    pub csi_index: bool
}

impl ConcatenateSettings {
    /// # Errors
    /// * if the region string is malformed
    pub fn concatenate_options(&self) -> Result<ConcatenateOptions, InputError> {
        let region = match self.region.as_ref() {
            Some(r) => Some(GenomicRegion::parse(r)?),
            None => None
        };
        Ok(ConcatenateOptions {
            no_sort: self.no_sort,
            sites_only: self.sites_only,
            region,
            max_files_open: self.max_files_open
        })
    }
}

#[derive(Args, Clone, Debug)]
pub struct BreakDownSettings {
    /// Reference FASTA file the calls were made against
    #[clap(required = true)]
    #[clap(short = 'r')]
    #[clap(long = "reference")]
    #[clap(value_name = "FASTA")]
    pub reference_filename: PathBuf,

    /// Genotyped VCF to break down
    #[clap(required = true)]
    #[clap(value_name = "VCF")]
    pub input_filename: PathBuf,

    /// Output VCF (.vcf, .vcf.gz, or .bcf)
    #[clap(required = true)]
    #[clap(short = 'o')]
    #[clap(long = "output-vcf")]
    #[clap(value_name = "VCF")]
    pub output_vcf_filename: PathBuf,

    /// Only break down records starting in this region
    #[clap(long = "region")]
    #[clap(value_name = "REGION")]
    pub region: Option<String>
}

#[derive(Args, Clone, Debug)]
pub struct MergeSettings {
    /// Reference FASTA file the calls were made against
    #[clap(required = true)]
    #[clap(short = 'r')]
    #[clap(long = "reference")]
    #[clap(value_name = "FASTA")]
    pub reference_filename: PathBuf,

    /// Genotyped VCFs with different samples
    #[clap(value_name = "VCF")]
    pub input_filenames: Vec<PathBuf>,

    /// File with one input VCF per line, added after the positional inputs
    #[clap(long = "file-list")]
    #[clap(value_name = "FILE")]
    pub file_list: Option<PathBuf>,

    /// Output VCF (.vcf, .vcf.gz, or .bcf)
    #[clap(required = true)]
    #[clap(short = 'o')]
    #[clap(long = "output-vcf")]
    #[clap(value_name = "VCF")]
    pub output_vcf_filename: PathBuf
}

impl MergeSettings {
    /// Positional inputs followed by the non-blank lines of `--file-list`.
    /// # Errors
    /// * if the file list cannot be read
    pub fn all_inputs(&self) -> Result<Vec<PathBuf>, std::io::Error> {
        let mut inputs: Vec<PathBuf> = self.input_filenames.clone();
        if let Some(filename) = self.file_list.as_ref() {
            let file_reader = BufReader::new(File::open(filename)?);
            for line in file_reader.lines() {
                let line = line?;
                let line = line.trim();
                if !line.is_empty() {
                    inputs.push(PathBuf::from(line));
                }
            }
        }
        Ok(inputs)
    }
}

/// Checks if a file exists and will otherwise exit
/// # Arguments
/// * `filename` - the file path to check for
/// * `label` - the label to use for error messages
fn check_required_filename(filename: &Path, label: &str) {
    if !filename.exists() {
        error!("{} does not exist: \"{}\"", label, filename.display());
        std::process::exit(exitcode::NOINPUT);
    } else {
        info!("{}: \"{}\"", label, filename.display());
    }
}

/// Checks if the VCF file exists and, if it claims to be gzipped, that it decompresses. If it fails any of those, this will exit.
/// # Argument
/// * `filename` - the VCF file path to check
/// * `label` - the label to use for error messages
fn check_required_vcf(filename: &Path, label: &str) {
    // first check the filename normally
    check_required_filename(filename, label);
    if filename.extension().unwrap_or_default() != "gz" {
        return;
    }

    // NOTE: a gzip file (as opposed to bgzip) will still pass this
    let vcf_file: File = match File::open(filename) {
        Ok(f) => f,
        Err(e) => {
            error!("Error while opening {filename:?}: {e}");
            std::process::exit(exitcode::IOERR);
        }
    };
    let file_reader = BufReader::new(vcf_file);
    let mut gz_decoder = MultiGzDecoder::new(file_reader);
    let mut small_buffer: [u8; 10] = [0; 10];
    match gz_decoder.read(&mut small_buffer) {
        Ok(bytes_read) => {
            trace!("Successfully read {bytes_read} bytes from VCF.")
        },
        Err(e) => {
            if e.to_string() == "invalid gzip header" {
                error!("Error while checking {filename:?}: {e}; is the VCF bgzipped?");
            } else {
                error!("Error while checking {filename:?}: {e}");
            }
            std::process::exit(exitcode::IOERR);
        }
    };
}

pub fn get_raw_settings() -> Settings {
    Settings::parse()
}

/// Do some additional checks here, we may increase these as we go.
/// Also can modify settings if needed since we're passing it around.
/// # Arguments
/// * `settings` - the raw settings, nothing has been checked other than what clap does for us.
pub fn check_settings(mut settings: Settings) -> Settings {
    match &mut settings.command {
        Command::Construct(s) => {
            check_required_filename(&s.reference_filename, "Reference file");
            if let Some(vcf) = s.vcf_filename.as_ref() {
                check_required_vcf(vcf, "Variant file");
            }
            if let Err(e) = GenomicRegion::parse(&s.region) {
                error!("{}", e);
                std::process::exit(exitcode::USAGE);
            }
            s.graph.check();
            info!("Structural variants: {}", if s.is_sv { "ENABLED" } else { "DISABLED" });
        },
        Command::Check(s) => {
            check_required_filename(&s.graph_filename, "Graph file");
            if let Some(index) = s.index_filename.as_ref() {
                check_required_filename(index, "Index file");
            }
        },
        Command::Call(s) => {
            check_required_filename(&s.graph_filename, "Graph file");
            if let Some(index) = s.index_filename.as_ref() {
                check_required_filename(index, "Index file");
            }
            check_required_filename(&s.reference_filename, "Reference file");
            s.reads.check();
            s.calling.check();
        },
        Command::Genotype(s) | Command::GenotypeSv(s) => {
            check_required_filename(&s.reference_filename, "Reference file");
            if let Some(vcf) = s.vcf_filename.as_ref() {
                check_required_vcf(vcf, "Variant file");
            } else {
                warn!("No variant file provided, genotyping against the reference only");
            }
            if let Some(region_file) = s.region_filename.as_ref() {
                check_required_filename(region_file, "Region file");
            }
            if s.region_size == Some(0) {
                error!("--region-size must be at least 1");
                std::process::exit(exitcode::USAGE);
            }
            // 0 doesn't make sense, so lets just error proof it up to 1
            if s.threads == 0 {
                s.threads = 1;
            }
            s.graph.check();
            s.reads.check();
            s.calling.check();
            info!("Processing threads: {}", s.threads);
            if s.csi_index {
                info!("CSI indexing: ENABLED");
            }
        },
        Command::VcfBreakDown(s) => {
            check_required_filename(&s.reference_filename, "Reference file");
            check_required_vcf(&s.input_filename, "Input VCF");
            if let Some(Err(e)) = s.region.as_ref().map(|r| GenomicRegion::parse(r)) {
                error!("{}", e);
                std::process::exit(exitcode::USAGE);
            }
        },
        Command::VcfConcatenate(s) => {
            for filename in s.input_filenames.iter() {
                check_required_vcf(filename, "Input VCF");
            }
            if let Err(e) = s.concatenate_options() {
                error!("{}", e);
                std::process::exit(exitcode::USAGE);
            }
            if s.max_files_open < 2 {
                warn!("--max-files-open must be at least 2 for merging, using 2");
                s.max_files_open = 2;
            }
            if s.no_sort {
                info!("Sorting: DISABLED");
            }
            if s.sites_only {
                info!("Sites only: ENABLED");
            }
        },
        Command::VcfMerge(s) => {
            check_required_filename(&s.reference_filename, "Reference file");
            if let Some(file_list) = s.file_list.as_ref() {
                check_required_filename(file_list, "File list");
            }
            let inputs = match s.all_inputs() {
                Ok(inputs) => inputs,
                Err(e) => {
                    error!("Error while reading the file list: {}", e);
                    std::process::exit(exitcode::IOERR);
                }
            };
            if inputs.is_empty() {
                error!("No input VCFs, provide them as arguments or with --file-list");
                std::process::exit(exitcode::USAGE);
            }
            for filename in inputs.iter() {
                check_required_vcf(filename, "Input VCF");
            }
        }
    };

    //send the settings back
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference_graph::DEFAULT_FLANK;
    use std::io::Write;

    #[test]
    fn test_parse_genotype() {
        let settings = Settings::try_parse_from([
            "graphtyper", "genotype", "-r", "ref.fa", "-c", "variants.vcf", "-b", "a.bam", "-b", "b.bam",
            "-o", "out.vcf.gz", "--region", "chr1:1-100", "--region", "chr2", "-t", "4", "-k", "24",
            "--min-support-ratio", "0.3", "-vv"
        ]).unwrap();
        assert_eq!(settings.verbosity, 2);
        let Command::Genotype(s) = settings.command else {
            panic!("expected genotype");
        };
        assert_eq!(s.reads.bam_filenames.len(), 2);
        let config = s.genotype_config(false);
        assert_eq!(config.threads, 4);
        assert_eq!(config.index.k, 24);
        assert_eq!(config.region_size, REGION_SIZE);
        assert_eq!(config.thresholds.min_support_count, 5);
        assert_eq!(config.thresholds.min_support_ratio, 0.3);
        assert!(!config.graph.is_sv);
        assert_eq!(config.max_files_open, 1000);
        assert_eq!(config.graph.flank, DEFAULT_FLANK);

        let regions = s.requested_regions().unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0], GenomicRegion::new("chr1", 0, 100));
    }

    #[test]
    fn test_parse_genotype_sv() {
        let settings = Settings::try_parse_from([
            "graphtyper", "genotype_sv", "-r", "ref.fa", "-b", "a.bam", "-o", "out.vcf", "--graph-flank", "1000"
        ]).unwrap();
        let Command::GenotypeSv(s) = settings.command else {
            panic!("expected genotype_sv");
        };
        let config = s.genotype_config(true);
        assert!(config.graph.is_sv);
        assert_eq!(config.graph.flank, 1000);
        assert_eq!(config.region_size, SV_REGION_SIZE);
        assert!(s.vcf_filename.is_none());
    }

    #[test]
    fn test_parse_other_commands() {
        let settings = Settings::try_parse_from([
            "graphtyper", "construct", "-r", "ref.fa", "--region", "chr1", "-o", "chr1.gtg", "--sv", "--add-all-variants"
        ]).unwrap();
        let Command::Construct(s) = settings.command else {
            panic!("expected construct");
        };
        assert!(s.is_sv);
        assert!(s.graph.graph_config(s.is_sv).add_all_variants);
        assert_eq!(s.graph.index_config().k, MAX_K);

        let settings = Settings::try_parse_from(["graphtyper", "check", "-g", "chr1.gtg"]).unwrap();
        assert!(matches!(settings.command, Command::Check(_)));

        let settings = Settings::try_parse_from(["graphtyper", "vcf_concatenate", "a.vcf", "b.vcf", "-o", "out.vcf"]).unwrap();
        let Command::VcfConcatenate(s) = settings.command else {
            panic!("expected vcf_concatenate");
        };
        assert_eq!(s.input_filenames.len(), 2);
        let options = s.concatenate_options().unwrap();
        assert!(!options.no_sort && !options.sites_only);
        assert!(options.region.is_none());
        assert_eq!(options.max_files_open, 1000);

        let settings = Settings::try_parse_from([
            "graphtyper", "vcf_concatenate", "a.vcf", "-o", "out.vcf", "--no-sort", "--sites-only", "--region", "chr1:11-20", "--max-files-open", "8"
        ]).unwrap();
        let Command::VcfConcatenate(s) = settings.command else {
            panic!("expected vcf_concatenate");
        };
        let options = s.concatenate_options().unwrap();
        assert!(options.no_sort && options.sites_only);
        assert_eq!(options.region, Some(GenomicRegion::new("chr1", 10, 20)));
        assert_eq!(options.max_files_open, 8);

        let settings = Settings::try_parse_from([
            "graphtyper", "vcf_break_down", "-r", "ref.fa", "calls.vcf", "-o", "out.vcf", "--region", "chr2"
        ]).unwrap();
        let Command::VcfBreakDown(s) = settings.command else {
            panic!("expected vcf_break_down");
        };
        assert_eq!(s.input_filename, PathBuf::from("calls.vcf"));
        assert_eq!(s.region.as_deref(), Some("chr2"));

        // missing required arguments
        assert!(Settings::try_parse_from(["graphtyper", "call", "-g", "chr1.gtg"]).is_err());
        assert!(Settings::try_parse_from(["graphtyper", "genotype_camou"]).is_err());
    }

    #[test]
    fn test_merge_file_list() {
        let mut file_list = tempfile::NamedTempFile::new().unwrap();
        write!(file_list, "b.vcf\n\n  c.vcf.gz\n").unwrap();
        let path = file_list.path();
        let settings = Settings::try_parse_from([
            "graphtyper", "vcf_merge", "-r", "ref.fa", "a.vcf", "-o", "out.vcf", "--file-list", path.to_str().unwrap()
        ]).unwrap();
        let Command::VcfMerge(s) = settings.command else {
            panic!("expected vcf_merge");
        };
        let inputs = s.all_inputs().unwrap();
        assert_eq!(inputs, vec![PathBuf::from("a.vcf"), PathBuf::from("b.vcf"), PathBuf::from("c.vcf.gz")]);
    }

    #[test]
    fn test_region_file() {
        let mut region_file = tempfile::NamedTempFile::new().unwrap();
        write!(region_file, "# comment\nchr1:11-20\n\nchr2\n").unwrap();
        let path = region_file.path();
        let settings = Settings::try_parse_from([
            "graphtyper", "genotype", "-r", "ref.fa", "-b", "a.bam", "-o", "out.vcf", "--region-file", path.to_str().unwrap()
        ]).unwrap();
        let Command::Genotype(s) = settings.command else {
            panic!("expected genotype");
        };
        let regions = s.requested_regions().unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0], GenomicRegion::new("chr1", 10, 20));
        assert_eq!(regions[1].chrom(), "chr2");
    }
}
