
use crate::data_types::genomic_region::GenomicRegion;

use log::{debug, trace};
use rust_htslib::bam;
use rust_htslib::bam::record::Aux;
use rust_htslib::htslib;
use rustc_hash::FxHashMap as HashMap;
use simple_error::bail;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

/// One read handed to the placer
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceRead {
    /// read name, shared by mates
    pub name: String,
    /// read bases in reference orientation
    pub sequence: Vec<u8>,
    /// index into `ReadSource::sample_names()`
    pub sample_index: usize,
    /// index into `ReadSource::read_group_names()`
    pub read_group_index: usize
}

/// Anything that can hand out the reads overlapping a region.
pub trait ReadSource: Send + Sync {
    /// Sample names in output order
    fn sample_names(&self) -> &[String];

    /// Read group names, each belonging to one sample
    fn read_group_names(&self) -> &[String];

    /// Returns every usable read overlapping `region`.
    /// # Errors
    /// * if the underlying input cannot be read
    fn fetch(&self, region: &GenomicRegion) -> Result<Vec<SourceRead>, Box<dyn std::error::Error>>;
}

/// Counting semaphore over open input files, shared by all workers.
#[derive(Debug)]
pub struct FileHandleLimiter {
    max_open: usize,
    open: Mutex<usize>,
    released: Condvar
}

/// An acquired file slot, returned to the limiter on drop
#[derive(Debug)]
pub struct FileHandle<'a> {
    limiter: &'a FileHandleLimiter
}

impl FileHandleLimiter {
    /// Creates a limiter allowing at most `max_open` files at once, minimum 1.
    pub fn new(max_open: usize) -> FileHandleLimiter {
        FileHandleLimiter {
            max_open: max_open.max(1),
            open: Mutex::new(0),
            released: Condvar::new()
        }
    }

    /// Blocks until a slot is free and takes it.
    pub fn acquire(&self) -> FileHandle<'_> {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        while *open >= self.max_open {
            open = self.released.wait(open).unwrap_or_else(|e| e.into_inner());
        }
        *open += 1;
        FileHandle { limiter: self }
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Number of slots currently taken
    pub fn open_count(&self) -> usize {
        *self.open.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        let mut open = self.limiter.open.lock().unwrap_or_else(|e| e.into_inner());
        *open -= 1;
        self.limiter.released.notify_one();
    }
}

/// Returns true if an alignment should be ignored.
/// Unmapped, secondary, failed QC, and duplicate alignments are removed, as are those below `min_mapq`.
pub fn filter_out_alignment_record(record: &bam::Record, min_mapq: u8) -> bool {
    static FLAG_FILTER: u32 =
        htslib::BAM_FUNMAP | htslib::BAM_FSECONDARY | htslib::BAM_FQCFAIL | htslib::BAM_FDUP;

    ((record.flags() as u32) & FLAG_FILTER) != 0 || record.mapq() < min_mapq
}

/// Extracts (read group ID, sample name) pairs from a BAM header.
/// # Errors
/// * if a read group is missing its ID or SM tag
pub fn parse_read_groups(header: &bam::HeaderView, filename: &Path) -> Result<Vec<(String, String)>, Box<dyn std::error::Error>> {
    let header_hashmap = bam::Header::from_template(header).to_hashmap();
    let empty_vec = vec![];
    let read_groups = header_hashmap.get("RG").unwrap_or(&empty_vec);

    let mut pairs: Vec<(String, String)> = Vec::with_capacity(read_groups.len());
    for read_group in read_groups.iter() {
        let Some(rg_id) = read_group.get("ID") else {
            bail!("BAM file has read group with no ID tag: {}", filename.to_string_lossy());
        };
        let Some(sample_name) = read_group.get("SM") else {
            bail!("BAM file has read group with no sample name (SM) tag: {}", filename.to_string_lossy());
        };
        pairs.push((rg_id.clone(), sample_name.clone()));
    }
    Ok(pairs)
}

/// Sample name for a file without read groups
fn file_stem_name(filename: &Path) -> String {
    let name = filename.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    for suffix in [".bam", ".cram", ".sam"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    name
}

/// Read groups of one input file
#[derive(Debug)]
struct FileReadGroups {
    /// read group ID -> global read group index
    by_id: HashMap<String, usize>,
    /// used for reads with no or unknown RG tag
    default_group: usize
}

/// Reads from indexed BAM/CRAM files, resolving each read to a sample through its read group.
#[derive(Debug)]
pub struct BamReadSource {
    bam_files: Vec<PathBuf>,
    reference_filename: PathBuf,
    min_mapq: u8,
    sample_names: Vec<String>,
    read_group_names: Vec<String>,
    /// read group index -> sample index
    read_group_samples: Vec<usize>,
    file_read_groups: Vec<FileReadGroups>,
    limiter: Arc<FileHandleLimiter>
}

impl BamReadSource {
    /// Opens every file once to collect its read groups and samples.
    /// # Arguments
    /// * `bam_files` - the alignment files, each must be indexed
    /// * `reference_filename` - reference FASTA, needed for CRAM
    /// * `min_mapq` - alignments below this MAPQ are ignored
    /// * `limiter` - shared cap on open files
    /// # Errors
    /// * if a file cannot be opened or has a malformed read group
    pub fn new(bam_files: &[PathBuf], reference_filename: &Path, min_mapq: u8, limiter: Arc<FileHandleLimiter>) -> Result<BamReadSource, Box<dyn std::error::Error>> {
        use rust_htslib::bam::Read;

        let mut sample_names: Vec<String> = vec![];
        let mut sample_lookup: HashMap<String, usize> = Default::default();
        let mut read_group_names: Vec<String> = vec![];
        let mut read_group_samples: Vec<usize> = vec![];
        let mut file_read_groups: Vec<FileReadGroups> = Vec::with_capacity(bam_files.len());

        let mut sample_index_for = |name: &str, sample_names: &mut Vec<String>| -> usize {
            *sample_lookup.entry(name.to_string()).or_insert_with(|| {
                sample_names.push(name.to_string());
                sample_names.len() - 1
            })
        };

        for bam_fn in bam_files.iter() {
            let pairs = {
                let _handle = limiter.acquire();
                let mut bam_reader = bam::IndexedReader::from_path(bam_fn)?;
                bam_reader.set_reference(reference_filename)?;
                parse_read_groups(bam_reader.header(), bam_fn)?
            };

            let mut by_id: HashMap<String, usize> = Default::default();
            let default_group = if pairs.is_empty() {
                let name = file_stem_name(bam_fn);
                debug!("No read groups in {:?}, using sample name {:?}", bam_fn, name);
                let sample_index = sample_index_for(&name, &mut sample_names);
                read_group_names.push(name);
                read_group_samples.push(sample_index);
                read_group_names.len() - 1
            } else {
                let first_group = read_group_names.len();
                for (rg_id, sample_name) in pairs.into_iter() {
                    let sample_index = sample_index_for(&sample_name, &mut sample_names);
                    read_group_names.push(rg_id.clone());
                    read_group_samples.push(sample_index);
                    by_id.insert(rg_id, read_group_names.len() - 1);
                }
                first_group
            };
            file_read_groups.push(FileReadGroups {
                by_id,
                default_group
            });
        }

        debug!("Loaded {} samples and {} read groups from {} alignment files", sample_names.len(), read_group_names.len(), bam_files.len());
        Ok(BamReadSource {
            bam_files: bam_files.to_vec(),
            reference_filename: reference_filename.to_path_buf(),
            min_mapq,
            sample_names,
            read_group_names,
            read_group_samples,
            file_read_groups,
            limiter
        })
    }
}

impl ReadSource for BamReadSource {
    fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    fn read_group_names(&self) -> &[String] {
        &self.read_group_names
    }

    fn fetch(&self, region: &GenomicRegion) -> Result<Vec<SourceRead>, Box<dyn std::error::Error>> {
        use rust_htslib::bam::Read;

        let mut reads: Vec<SourceRead> = vec![];
        let mut filtered: u64 = 0;
        for (file_index, bam_fn) in self.bam_files.iter().enumerate() {
            let groups = &self.file_read_groups[file_index];
            let _handle = self.limiter.acquire();
            let mut bam_reader = bam::IndexedReader::from_path(bam_fn)?;
            bam_reader.set_reference(&self.reference_filename)?;
            bam_reader.fetch((region.chrom(), region.begin(), region.end()))?;

            for read_entry in bam_reader.records() {
                let read = read_entry?;
                if filter_out_alignment_record(&read, self.min_mapq) {
                    filtered += 1;
                    continue;
                }
                let read_group_index = match read.aux(b"RG") {
                    Ok(Aux::String(rg)) => groups.by_id.get(rg).copied().unwrap_or(groups.default_group),
                    _ => groups.default_group
                };
                reads.push(SourceRead {
                    name: String::from_utf8_lossy(read.qname()).to_string(),
                    sequence: read.seq().as_bytes(),
                    sample_index: self.read_group_samples[read_group_index],
                    read_group_index
                });
            }
        }
        trace!("Fetched {} reads in {}, filtered {}", reads.len(), region, filtered);
        Ok(reads)
    }
}

/// Read source over reads held in memory, each tagged with its aligned start.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReadSource {
    sample_names: Vec<String>,
    read_group_names: Vec<String>,
    /// (contig, 0-based start, read)
    reads: Vec<(String, u64, SourceRead)>
}

impl InMemoryReadSource {
    /// Creates a source with one read group per sample, named after the sample.
    pub fn new(sample_names: Vec<String>) -> InMemoryReadSource {
        InMemoryReadSource {
            read_group_names: sample_names.clone(),
            sample_names,
            reads: vec![]
        }
    }

    /// Adds a read for `sample_index` starting at `position` on `chrom`, in that sample's read group.
    /// # Panics
    /// * if `sample_index` is not a known sample
    pub fn add_read(&mut self, chrom: &str, position: u64, name: &str, sequence: &[u8], sample_index: usize) {
        assert!(sample_index < self.sample_names.len());
        self.reads.push((chrom.to_string(), position, SourceRead {
            name: name.to_string(),
            sequence: sequence.to_vec(),
            sample_index,
            read_group_index: sample_index
        }));
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }
}

impl ReadSource for InMemoryReadSource {
    fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    fn read_group_names(&self) -> &[String] {
        &self.read_group_names
    }

    fn fetch(&self, region: &GenomicRegion) -> Result<Vec<SourceRead>, Box<dyn std::error::Error>> {
        Ok(self.reads.iter()
            .filter(|(chrom, position, read)| {
                chrom == region.chrom() &&
                    *position < region.end() &&
                    position + read.sequence.len() as u64 > region.begin()
            })
            .map(|(_, _, read)| read.clone())
            .collect())
    }
}
