
use crate::data_types::reference_genome::ReferenceGenome;

use rust_htslib::bcf;
use std::path::Path;

/// Largest contig that .tbi indices can address
const TBI_MAX_CONTIG: u64 = (1 << 29) - 1;

/// Failure reported by htslib while indexing
#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum BcfBuildError {
    #[error("path {path:?} cannot be passed to htslib")]
    BadPath { path: String },
    #[error("failed to build index for {path:?}: {message}")]
    IndexFailed { path: String, message: &'static str }
}

fn error_message(error: i32) -> &'static str {
    match error {
        -1 => "indexing failed",
        -2 => "opening the file failed",
        -3 => "format not indexable",
        -4 => "failed to create and/or save the index",
        _ => "unknown error"
    }
}

/// Build a bcf or vcf.gz index.
/// Builds tbi or csi depending on if build_tbi is set.
/// # Arguments
/// * `bcf_path` - the compressed VCF or BCF to index
/// * `idx_path` - optional index path, htslib picks one next to the input if None
/// * `n_threads` - htslib worker threads
/// * `build_tbi` - .tbi if true, .csi otherwise
pub fn build_bcf_index<P: AsRef<Path>>(bcf_path: P, idx_path: Option<P>, n_threads: u32, build_tbi: bool) -> Result<(), BcfBuildError> {
    let to_cstring = |p: &Path| rust_htslib::utils::path_to_cstring(&p).ok_or_else(|| BcfBuildError::BadPath {
        path: p.to_string_lossy().to_string()
    });
    let bcf_cstr = to_cstring(bcf_path.as_ref())?;
    let idx_path_cstr = match idx_path {
        Some(p) => Some(to_cstring(p.as_ref())?),
        None => None
    };
    let min_shift = if build_tbi { 0 } else { 14 };
    let ret = unsafe {
        rust_htslib::htslib::bcf_index_build3(
            bcf_cstr.as_ptr(),
            idx_path_cstr.as_ref().map_or(std::ptr::null(), |p| p.as_ptr()),
            min_shift,
            n_threads as i32
        )
    };
    match ret {
        0 => Ok(()),
        e => Err(BcfBuildError::IndexFailed {
            path: bcf_path.as_ref().to_string_lossy().to_string(),
            message: error_message(e)
        })
    }
}

/// How a VCF output path should be written, chosen by extension.
/// `.bcf` is compressed BCF, `.vcf.gz` is bgzipped VCF, anything else is plain VCF.
/// # Returns
/// (uncompressed, format)
pub fn output_format(path: &Path) -> (bool, bcf::Format) {
    let name = path.to_string_lossy();
    if name.ends_with(".bcf") {
        (false, bcf::Format::Bcf)
    } else if name.ends_with(".vcf.gz") || name.ends_with(".vcf.bgz") {
        (false, bcf::Format::Vcf)
    } else {
        (true, bcf::Format::Vcf)
    }
}

/// Returns true if the output will be block-compressed and can be indexed.
pub fn is_indexable(path: &Path) -> bool {
    !output_format(path).0
}

/// Returns true if some contig is too long for .tbi indexing.
pub fn csi_required(reference: &ReferenceGenome) -> bool {
    reference.contig_keys().iter()
        .filter_map(|k| reference.contig_length(k))
        .any(|length| length > TBI_MAX_CONTIG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_output_format() {
        assert_eq!(output_format(&PathBuf::from("out.vcf")).0, true);
        assert!(matches!(output_format(&PathBuf::from("out.vcf")).1, bcf::Format::Vcf));
        assert_eq!(output_format(&PathBuf::from("out.vcf.gz")).0, false);
        assert!(matches!(output_format(&PathBuf::from("out.vcf.gz")).1, bcf::Format::Vcf));
        assert_eq!(output_format(&PathBuf::from("out.bcf")).0, false);
        assert!(matches!(output_format(&PathBuf::from("out.bcf")).1, bcf::Format::Bcf));
        assert!(is_indexable(&PathBuf::from("dir/out.vcf.gz")));
        assert!(!is_indexable(&PathBuf::from("dir/out.vcf")));
    }

    #[test]
    fn test_csi_required() {
        let reference = ReferenceGenome::from_contigs(vec![("chr1".to_string(), b"ACGT".to_vec())]);
        assert!(!csi_required(&reference));
    }

    #[test]
    fn test_index_missing_file() {
        let result = build_bcf_index(PathBuf::from("/nonexistent/out.vcf.gz"), None, 1, true);
        assert!(matches!(result, Err(BcfBuildError::IndexFailed { .. })));
    }
}
