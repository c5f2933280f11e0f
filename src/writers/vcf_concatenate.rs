use crate::data_types::genomic_region::GenomicRegion;
use crate::data_types::reference_genome::InputError;
use crate::writers::vcf_util::output_format;

use log::{debug, info, warn};
use priority_queue::PriorityQueue;
use rust_htslib::bcf;
use rust_htslib::bcf::Read;
use simple_error::bail;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};

/// Sort key of a record in the output header: (contig index, position, input index)
type RecordKey = (u32, i64, usize);

/// Options for `concatenate_vcfs`
#[derive(Clone, Debug)]
pub struct ConcatenateOptions {
    /// append the inputs in the order given instead of merging them by position
    pub no_sort: bool,
    /// write the sites without any sample columns
    pub sites_only: bool,
    /// only keep records starting inside this region
    pub region: Option<GenomicRegion>,
    /// most inputs open at the same time, longer input lists are merged in rounds
    pub max_files_open: usize
}

impl Default for ConcatenateOptions {
    fn default() -> ConcatenateOptions {
        ConcatenateOptions {
            no_sort: false,
            sites_only: false,
            region: None,
            max_files_open: 1000
        }
    }
}

/// A region translated to the output header: (contig index, begin, end)
type RegionKey = (u32, i64, i64);

fn open_input(path: &Path) -> Result<bcf::Reader, InputError> {
    bcf::Reader::from_path(path).map_err(|e| InputError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string()
    })
}

fn sample_names(header: &bcf::header::HeaderView) -> Vec<Vec<u8>> {
    header.samples().iter().map(|s| s.to_vec()).collect()
}

/// Reads the next record of one input and computes its key against the output header.
fn next_record(reader: &mut bcf::Reader, output_header: &bcf::header::HeaderView, file_index: usize) -> Result<Option<(bcf::Record, RecordKey)>, Box<dyn std::error::Error>> {
    let mut record = reader.empty_record();
    match reader.read(&mut record) {
        None => Ok(None),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(())) => {
            let Some(rid) = record.rid() else {
                bail!("Record without a contig in input #{}", file_index);
            };
            let contig = record.header().rid2name(rid)?.to_vec();
            let output_rid = output_header.name2rid(&contig)?;
            let key = (output_rid, record.pos(), file_index);
            Ok(Some((record, key)))
        }
    }
}

/// Output for one round along with what every record needs before it is written
struct RoundWriter {
    writer: bcf::Writer,
    header: bcf::header::HeaderView,
    region: Option<RegionKey>,
    sites_only: bool,
    records_written: u64
}

impl RoundWriter {
    /// Opens the output with the header of the first input, without samples if `sites_only`.
    fn new(template: &bcf::header::HeaderView, output: &Path, options: &ConcatenateOptions) -> Result<RoundWriter, Box<dyn std::error::Error>> {
        let output_header = if options.sites_only {
            bcf::header::Header::from_template_subset(template, &[])?
        } else {
            bcf::header::Header::from_template(template)
        };
        let (uncompressed, format) = output_format(output);
        let writer = bcf::Writer::from_path(output, &output_header, uncompressed, format)?;
        let header: bcf::header::HeaderView = writer.header().clone();
        let region = match options.region.as_ref() {
            Some(r) => {
                let rid = header.name2rid(r.chrom().as_bytes())
                    .map_err(|_| InputError::UnknownContig { contig: r.chrom().to_string() })?;
                // a region without an end runs to the end of the contig
                let end = i64::try_from(r.end()).unwrap_or(i64::MAX);
                Some((rid, r.begin() as i64, end))
            },
            None => None
        };
        Ok(RoundWriter {
            writer,
            header,
            region,
            sites_only: options.sites_only,
            records_written: 0
        })
    }

    /// Writes a record if it starts inside the region, returns true if it was written.
    fn write(&mut self, mut record: bcf::Record, key: RecordKey) -> Result<bool, Box<dyn std::error::Error>> {
        if let Some((rid, begin, end)) = self.region {
            if key.0 != rid || key.1 < begin || key.1 >= end {
                return Ok(false);
            }
        }
        self.writer.translate(&mut record);
        if self.sites_only {
            self.writer.subset(&mut record);
        }
        self.writer.write(&record)?;
        self.records_written += 1;
        Ok(true)
    }
}

/// Concatenates VCFs that share a header into one output.
/// By default the inputs must each be position-sorted and are merged into one sorted output, with records at the same position kept in input order.
/// With `no_sort` the inputs are appended one after another and only one is open at a time.
/// When merging more inputs than `max_files_open`, groups are first merged into intermediate files next to the output.
/// # Arguments
/// * `inputs` - VCF/BCF files, all with the same samples
/// * `output` - the output path, format chosen by extension
/// * `options` - ordering, filtering, and open file options
/// # Returns
/// the number of records written
/// # Errors
/// * if an input cannot be opened or parsed
/// * if the inputs have different samples, or one uses a contig the first does not declare
/// * if an input is not sorted when merging by position
/// * if the region contig is not declared in the first input
pub fn concatenate_vcfs(inputs: &[PathBuf], output: &Path, options: &ConcatenateOptions) -> Result<u64, Box<dyn std::error::Error>> {
    if inputs.is_empty() {
        bail!("No VCF files to concatenate");
    }

    let records_written = if options.no_sort {
        append_inputs(inputs, output, options)?
    } else {
        let max_open = options.max_files_open.max(2);
        let mut intermediates: Vec<PathBuf> = vec![];
        let result = merge_in_rounds(inputs, output, options, max_open, &mut intermediates);
        for path in intermediates.iter() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove intermediate file {:?}: {}", path, e);
            }
        }
        result?
    };
    info!("Concatenated {} records from {} files into {:?}", records_written, inputs.len(), output);
    Ok(records_written)
}

/// Path of one intermediate merge result
fn intermediate_path(output: &Path, round: usize, group: usize) -> PathBuf {
    PathBuf::from(format!("{}.round{}_{}.bcf", output.display(), round, group))
}

/// Merges inputs in groups of `max_open` until one final merge can hold them all.
/// Every intermediate created is added to `intermediates` so the caller can clean up.
fn merge_in_rounds(inputs: &[PathBuf], output: &Path, options: &ConcatenateOptions, max_open: usize, intermediates: &mut Vec<PathBuf>) -> Result<u64, Box<dyn std::error::Error>> {
    let mut round_inputs: Vec<PathBuf> = inputs.to_vec();
    let mut round: usize = 0;
    while round_inputs.len() > max_open {
        debug!("Merging {} inputs in groups of {}", round_inputs.len(), max_open);
        let mut next_inputs: Vec<PathBuf> = vec![];
        for (group, group_inputs) in round_inputs.chunks(max_open).enumerate() {
            let path = intermediate_path(output, round, group);
            intermediates.push(path.clone());
            merge_sorted(group_inputs, &path, options)?;
            next_inputs.push(path);
        }
        round_inputs = next_inputs;
        round += 1;
    }
    merge_sorted(&round_inputs, output, options)
}

/// Opens every input at once and merges them by position.
fn merge_sorted(inputs: &[PathBuf], output: &Path, options: &ConcatenateOptions) -> Result<u64, Box<dyn std::error::Error>> {
    let mut readers: Vec<bcf::Reader> = Vec::with_capacity(inputs.len());
    for path in inputs.iter() {
        readers.push(open_input(path)?);
    }

    let first_header: bcf::header::HeaderView = readers[0].header().clone();
    let first_samples = sample_names(&first_header);
    for (reader, path) in readers.iter().zip(inputs.iter()).skip(1) {
        if sample_names(reader.header()) != first_samples {
            bail!("Samples in {:?} do not match samples in {:?}", path, inputs[0]);
        }
    }

    let mut writer = RoundWriter::new(&first_header, output, options)?;
    let mut pending: Vec<Option<bcf::Record>> = (0..readers.len()).map(|_| None).collect();
    let mut pqueue: PriorityQueue<usize, Reverse<RecordKey>> = PriorityQueue::new();
    for (file_index, reader) in readers.iter_mut().enumerate() {
        if let Some((record, key)) = next_record(reader, &writer.header, file_index)? {
            pending[file_index] = Some(record);
            pqueue.push(file_index, Reverse(key));
        }
    }

    let mut last_key: Option<(u32, i64)> = None;
    while let Some((file_index, Reverse(key))) = pqueue.pop() {
        let Some(record) = pending[file_index].take() else {
            bail!("Queued input #{} has no pending record", file_index);
        };
        if last_key.is_some_and(|last| (key.0, key.1) < last) {
            // the other inputs are already ahead, so this one must be unsorted
            bail!("Input {:?} is not sorted by position", inputs[file_index]);
        }
        last_key = Some((key.0, key.1));
        writer.write(record, key)?;

        if let Some((record, key)) = next_record(&mut readers[file_index], &writer.header, file_index)? {
            pending[file_index] = Some(record);
            pqueue.push(file_index, Reverse(key));
        } else {
            debug!("Finished input {:?}", inputs[file_index]);
        }
    }
    Ok(writer.records_written)
}

/// Writes every input in the order given, opening one at a time.
fn append_inputs(inputs: &[PathBuf], output: &Path, options: &ConcatenateOptions) -> Result<u64, Box<dyn std::error::Error>> {
    let mut first_reader = open_input(&inputs[0])?;
    let first_header: bcf::header::HeaderView = first_reader.header().clone();
    let first_samples = sample_names(&first_header);
    let mut writer = RoundWriter::new(&first_header, output, options)?;

    while let Some((record, key)) = next_record(&mut first_reader, &writer.header, 0)? {
        writer.write(record, key)?;
    }
    std::mem::drop(first_reader);

    for (file_index, path) in inputs.iter().enumerate().skip(1) {
        let mut reader = open_input(path)?;
        if sample_names(reader.header()) != first_samples {
            bail!("Samples in {:?} do not match samples in {:?}", path, inputs[0]);
        }
        while let Some((record, key)) = next_record(&mut reader, &writer.header, file_index)? {
            writer.write(record, key)?;
        }
        debug!("Finished input {:?}", path);
    }
    Ok(writer.records_written)
}
