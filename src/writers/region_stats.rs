
use crate::pipeline::{RegionOutput, RegionStats};

use serde::Serialize;
use std::fs::File;
use std::path::Path;

/// This is a wrapper for writing out per-region stats to a file
pub struct StatsWriter {
    /// Handle for the CSV writer
    csv_writer: csv::Writer<File>
}

/// Contains all the data written to each row of our stats file
#[derive(Serialize)]
struct CsvRow {
    /// The index of the region in the planned order
    region_index: usize,
    /// the chromosome of the region
    chrom: String,
    /// the first base of the region, 0-based
    start: u64,
    /// one past the last base of the region
    end: u64,
    /// nodes in the region graph
    nodes: u64,
    /// variant sites in the region graph
    sites: u64,
    /// catalogue variants left out of the graph
    rejected_variants: u64,
    /// sites with truncated index paths
    low_confidence_sites: u64,
    /// reads fetched
    reads: u64,
    /// reads without an accepted alignment
    unmapped_reads: u64,
    /// reads with an accepted alignment
    placed_reads: u64,
    /// sites dropped by the support thresholds
    dropped_sites: u64,
    /// records written after decomposition
    emitted_records: u64,
    /// CPU seconds spent on the region
    cpu_seconds: f64
}

impl StatsWriter {
    /// Creates a new writer for a given filename
    /// # Arguments
    /// * `filename` - the path to write all stats to
    pub fn new(filename: &Path) -> csv::Result<StatsWriter> {
        // modify the delimiter to "," if it ends with .csv
        let is_csv: bool = filename.extension().unwrap_or_default() == "csv";
        let delimiter: u8 = if is_csv { b',' } else { b'\t' };
        let csv_writer: csv::Writer<File> = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(filename)?;
        Ok(StatsWriter {
            csv_writer
        })
    }

    /// Writes one row for a finished region.
    /// # Errors
    /// * if the row cannot be serialized or flushed
    pub fn write_region(&mut self, output: &RegionOutput) -> Result<(), Box<dyn std::error::Error>> {
        let stats: &RegionStats = &output.stats;
        let row = CsvRow {
            region_index: output.region_index,
            chrom: output.region.chrom().to_string(),
            start: output.region.begin(),
            end: output.region.end(),
            nodes: stats.nodes,
            sites: stats.sites,
            rejected_variants: stats.rejected_variants,
            low_confidence_sites: stats.low_confidence_sites,
            reads: stats.reads,
            unmapped_reads: stats.unmapped_reads,
            placed_reads: stats.placed_reads,
            dropped_sites: stats.dropped_sites,
            emitted_records: stats.emitted_records,
            cpu_seconds: stats.cpu_seconds
        };
        self.csv_writer.serialize(&row)?;
        self.csv_writer.flush()?;
        Ok(())
    }
}
