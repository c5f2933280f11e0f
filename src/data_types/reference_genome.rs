
use bio::io::fasta;
use flate2::bufread::MultiGzDecoder;
use log::{debug, info, warn};
use rustc_hash::FxHashMap as HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// A single coordinate over all contigs concatenated in reference order, 0-based.
pub type AbsolutePosition = u64;

/// Anything that can answer "which reference base sits at this absolute position".
pub trait BaseLookup {
    /// Returns the uppercase base at `position`, or None if it is outside the known sequence.
    fn base_at(&self, position: AbsolutePosition) -> Option<u8>;
}

/// Lookup that never knows any bases, for when no reference is available.
pub struct NoReference;

impl BaseLookup for NoReference {
    fn base_at(&self, _position: AbsolutePosition) -> Option<u8> {
        None
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InputError {
    #[error("failed to read {path:?}: {message}")]
    Unreadable { path: PathBuf, message: String },
    #[error("contig {contig:?} was not found in the reference")]
    UnknownContig { contig: String },
    #[error("invalid region string {region:?}: {message}")]
    BadRegion { region: String, message: String }
}

/// Wrapper structure for a reference genome
pub struct ReferenceGenome {
    /// The filename we loaded
    filename: PathBuf,
    /// Contains the keys in order of the reference load
    contig_keys: Vec<String>,
    /// Map where keys are contig names and value is ASCII formatted sequence
    contig_map: HashMap<String, Vec<u8>>,
    /// Absolute offset of each contig, parallel to `contig_keys`
    contig_offsets: Vec<AbsolutePosition>
}

impl ReferenceGenome {
    /// Loads a reference genome from a given FASTA file
    /// # Arguments
    /// * `fasta_fn` - the FASTA filename, gzip is allowed
    /// # Errors
    /// This will pass through any error detected from loading the provided FASTA file.
    /// This includes file reading and/or record reading errors.
    pub fn from_fasta(fasta_fn: &Path) -> Result<ReferenceGenome, Box<dyn std::error::Error>> {
        info!("Loading {:?}...", fasta_fn);
        let mut contigs: Vec<(String, Vec<u8>)> = vec![];

        let fasta_file: std::fs::File = match std::fs::File::open(fasta_fn) {
            Ok(f) => f,
            Err(e) => {
                return Err(Box::new(InputError::Unreadable { path: fasta_fn.to_path_buf(), message: e.to_string() }));
            }
        };
        let file_reader = BufReader::new(fasta_file);
        let fasta_reader: fasta::Reader<Box<dyn BufRead>> = if fasta_fn.extension().unwrap_or_default() == "gz" {
            debug!("Detected gzip extension, loading reference with MultiGzDecoder...");
            let gz_decoder = MultiGzDecoder::new(file_reader);
            let bufreader = BufReader::new(gz_decoder);
            fasta::Reader::from_bufread(Box::new(bufreader))
        } else {
            debug!("Loading reference as plain-text file...");
            fasta::Reader::from_bufread(Box::new(file_reader))
        };

        for entry in fasta_reader.records() {
            let record: fasta::Record = entry?;
            let seq_id: String = record.id().to_string();
            let sequence: Vec<u8> = record.seq().to_ascii_uppercase();
            contigs.push((seq_id, sequence));
        }

        let mut reference = ReferenceGenome::from_contigs(contigs);
        reference.filename = fasta_fn.to_path_buf();
        Ok(reference)
    }

    /// Builds a reference directly from in-memory contigs, mostly useful for tests and embedding.
    /// Contigs are placed in the absolute coordinate space in the order they are provided.
    /// # Arguments
    /// * `contigs` - (name, sequence) pairs
    pub fn from_contigs(contigs: Vec<(String, Vec<u8>)>) -> ReferenceGenome {
        let mut contig_keys: Vec<String> = Default::default();
        let mut contig_map: HashMap<String, Vec<u8>> = Default::default();
        let mut contig_offsets: Vec<AbsolutePosition> = Default::default();
        let mut offset: AbsolutePosition = 0;
        for (seq_id, sequence) in contigs.into_iter() {
            if contig_map.contains_key(&seq_id) {
                warn!("Duplicate contig name {:?} in reference, keeping the first entry", seq_id);
                continue;
            }
            contig_offsets.push(offset);
            offset += sequence.len() as u64;
            contig_keys.push(seq_id.clone());
            contig_map.insert(seq_id, sequence.to_ascii_uppercase());
        }
        info!("Finished loading {} contigs.", contig_map.len());

        ReferenceGenome {
            filename: PathBuf::new(),
            contig_keys,
            contig_map,
            contig_offsets
        }
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn contig_keys(&self) -> &[String] {
        &self.contig_keys
    }

    /// Returns the length of a contig, or None if it is not in the reference.
    pub fn contig_length(&self, chromosome: &str) -> Option<u64> {
        self.contig_map.get(chromosome).map(|s| s.len() as u64)
    }

    /// Returns the absolute offset of the first base of a contig.
    pub fn contig_offset(&self, chromosome: &str) -> Option<AbsolutePosition> {
        self.contig_keys.iter()
            .position(|k| k == chromosome)
            .map(|i| self.contig_offsets[i])
    }

    /// Converts a contig-local 0-based coordinate into an absolute one.
    /// Positions equal to the contig length are allowed so half-open ends convert cleanly.
    /// # Errors
    /// * if the contig is unknown
    pub fn absolute_position(&self, chromosome: &str, position: u64) -> Result<AbsolutePosition, InputError> {
        match self.contig_offset(chromosome) {
            Some(offset) => Ok(offset + position),
            None => Err(InputError::UnknownContig { contig: chromosome.to_string() })
        }
    }

    /// Converts an absolute coordinate back into (contig, 0-based local position).
    pub fn contig_position(&self, position: AbsolutePosition) -> Option<(&str, u64)> {
        // last contig whose offset is <= position
        let index = self.contig_offsets.partition_point(|&o| o <= position);
        if index == 0 {
            return None;
        }
        let contig = &self.contig_keys[index - 1];
        let local = position - self.contig_offsets[index - 1];
        if local < self.contig_map[contig].len() as u64 {
            Some((contig, local))
        } else {
            None
        }
    }

    /// Retrieves a reference slice from a given 0-based coordinates.
    /// If `start` or `end` goes past the full contig length, it will be truncated to the full contig length.
    /// # Arguments
    /// * `chromosome` - the chromosome to slice from
    /// * `start` - the 0-based start index (included)
    /// * `end` - the 0-based end index (excluded)
    /// # Panics
    /// * if `chromosome` was not in the FASTA file
    /// * if `start` > `end`
    pub fn get_slice(&self, chromosome: &str, start: usize, end: usize) -> &[u8] {
        let full_contig = self.contig_map.get(chromosome).expect("a chromosome from the reference file");
        assert!(start <= end, "start > end: {start} > {end}");
        let truncated_start = if start <= full_contig.len() { start } else {
            warn!("Received get_slice({:?}, {}, {}), truncated start to {}", chromosome, start, end, full_contig.len());
            full_contig.len()
        };
        let truncated_end = if end <= full_contig.len() { end } else {
            warn!("Received get_slice({:?}, {}, {}), truncated end to {}", chromosome, start, end, full_contig.len());
            full_contig.len()
        };
        &full_contig[truncated_start..truncated_end]
    }

    /// Retrieves a full chromosome by name
    /// # Arguments
    /// * `chromosome` - the chromosome to slice from
    /// # Panics
    /// * if `chromosome` was not in the FASTA file
    pub fn get_full_chromosome(&self, chromosome: &str) -> &[u8] {
        let full_contig = self.contig_map.get(chromosome).expect("a chromosome from the reference file");
        full_contig
    }
}

impl BaseLookup for ReferenceGenome {
    fn base_at(&self, position: AbsolutePosition) -> Option<u8> {
        let (contig, local) = self.contig_position(position)?;
        self.contig_map[contig].get(local as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_simple_reference() {
        let references = vec![
            "./test_data/test_reference.fa",
            "./test_data/test_reference.fa.gz"
        ];
        for &reference_fn in references.iter() {
            let simple_reference_fn: PathBuf = PathBuf::from(reference_fn);
            let reference_genome = ReferenceGenome::from_fasta(&simple_reference_fn).unwrap();

            assert_eq!(reference_genome.contig_keys(), &[
                "chr1".to_string(),
                "chr2".to_string()
            ]);
            assert_eq!(reference_genome.filename(), simple_reference_fn.as_path());

            //chr1 = ACGTACGT
            let chr1_string: Vec<u8> = "ACGTACGT".as_bytes().to_vec();
            for i in 0..8 {
                assert_eq!(reference_genome.get_slice("chr1", i, 8), &chr1_string[i..]);
            }

            //chr2 = ACCATGTA
            let chr2_string: Vec<u8> = "ACCATGTA".as_bytes().to_vec();
            assert_eq!(reference_genome.get_slice("chr2", 0, 8), chr2_string);
        }
    }

    #[test]
    fn test_missing_reference() {
        let result = ReferenceGenome::from_fasta(Path::new("./test_data/does_not_exist.fa"));
        assert!(result.is_err());
    }

    #[test]
    fn test_absolute_coordinates() {
        let reference_genome = ReferenceGenome::from_fasta(Path::new("./test_data/test_reference.fa")).unwrap();
        assert_eq!(reference_genome.contig_offset("chr1"), Some(0));
        assert_eq!(reference_genome.contig_offset("chr2"), Some(8));
        assert_eq!(reference_genome.absolute_position("chr2", 3).unwrap(), 11);
        assert!(reference_genome.absolute_position("chr3", 0).is_err());

        assert_eq!(reference_genome.contig_position(0), Some(("chr1", 0)));
        assert_eq!(reference_genome.contig_position(7), Some(("chr1", 7)));
        assert_eq!(reference_genome.contig_position(8), Some(("chr2", 0)));
        assert_eq!(reference_genome.contig_position(16), None);

        // chr2 = ACCATGTA
        assert_eq!(reference_genome.base_at(11), Some(b'A'));
        assert_eq!(reference_genome.base_at(12), Some(b'T'));
        assert_eq!(reference_genome.base_at(100), None);
        assert_eq!(NoReference.base_at(0), None);
    }
}
