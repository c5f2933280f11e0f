
use rustc_hash::FxHashMap as HashMap;
use std::ops::AddAssign;

/// One read's evidence for one allele at one site.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SupportRecord {
    /// the read name, used to avoid counting the same read twice
    pub read_name: String,
    /// index of the sample the read belongs to
    pub sample_index: usize,
    /// index of the read group the read came from
    pub read_group_index: usize,
    /// index of the site in the graph
    pub site_index: usize,
    /// the allele supported, 0 is reference
    pub allele_index: usize
}

/// Per-allele read counts for one sample at one site, with a per-read-group breakdown.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AlleleSupport {
    /// total reads supporting each allele
    allele_counts: Vec<u32>,
    /// read group index -> reads supporting each allele from that group
    read_group_counts: HashMap<usize, Vec<u32>>
}

impl AlleleSupport {
    /// Creates an empty tally for a site with `num_alleles` alleles
    pub fn new(num_alleles: usize) -> AlleleSupport {
        AlleleSupport {
            allele_counts: vec![0; num_alleles],
            read_group_counts: Default::default()
        }
    }

    /// Adds one supporting read.
    /// # Panics
    /// * if `allele_index` is out of range, callers validate this first
    pub fn add(&mut self, allele_index: usize, read_group_index: usize) {
        let num_alleles = self.allele_counts.len();
        self.allele_counts[allele_index] += 1;
        self.read_group_counts.entry(read_group_index)
            .or_insert_with(|| vec![0; num_alleles])[allele_index] += 1;
    }

    /// Takes back one read added with `add`, dropping the read group once it has no reads left.
    /// Does nothing if there is no such read to remove.
    pub fn remove(&mut self, allele_index: usize, read_group_index: usize) {
        let Some(group_counts) = self.read_group_counts.get_mut(&read_group_index) else {
            return;
        };
        if group_counts.get(allele_index).copied().unwrap_or_default() == 0 {
            return;
        }
        group_counts[allele_index] -= 1;
        self.allele_counts[allele_index] -= 1;
        if group_counts.iter().all(|&c| c == 0) {
            self.read_group_counts.remove(&read_group_index);
        }
    }

    pub fn allele_counts(&self) -> &[u32] {
        &self.allele_counts
    }

    pub fn num_alleles(&self) -> usize {
        self.allele_counts.len()
    }

    /// Total number of supporting reads across all alleles
    pub fn total(&self) -> u32 {
        self.allele_counts.iter().sum()
    }

    pub fn read_group_counts(&self) -> &HashMap<usize, Vec<u32>> {
        &self.read_group_counts
    }

    /// Number of read groups contributing any support
    pub fn num_read_groups(&self) -> usize {
        self.read_group_counts.len()
    }
}

impl AddAssign<&AlleleSupport> for AlleleSupport {
    fn add_assign(&mut self, rhs: &AlleleSupport) {
        assert_eq!(self.allele_counts.len(), rhs.allele_counts.len());
        for (l, &r) in self.allele_counts.iter_mut().zip(rhs.allele_counts.iter()) {
            *l += r;
        }
        for (&read_group, counts) in rhs.read_group_counts.iter() {
            let entry = self.read_group_counts.entry(read_group)
                .or_insert_with(|| vec![0; counts.len()]);
            for (l, &r) in entry.iter_mut().zip(counts.iter()) {
                *l += r;
            }
        }
    }
}
