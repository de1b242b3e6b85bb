//! The input classifier.
//!
//! A submitted sample identifier decides which acquisition path the
//! pipeline takes: pull a read archive, fetch an accession, or use a
//! local FASTA file. The classifier only inspects the string (and, for
//! local files, the filesystem); it never reaches the network.

use std::fs::File;
use std::sync::OnceLock;

use regex::Regex;

use argpipe_common::prelude::*;

/// Extensions accepted for local FASTA input.
const FASTA_EXTENSIONS: &[&str] = &[".fasta", ".fna", ".fa", ".fasta.gz", ".fna.gz"];

fn reads_archive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[SED]RR\d+$").unwrap())
}

fn sequence_accession_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(CP|NC|NZ)_?\d+(\.\d+)?$").unwrap())
}

fn assembly_accession_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^GC[AF]_\d+(\.\d+)?$").unwrap())
}

/// Map a submitted identifier to an input type.
///
/// Patterns are case-sensitive and tried in order; the first match wins.
/// Local-file candidates must name an existing, readable file.
pub fn classify(sample_id: &str) -> Result<InputType> {
    if reads_archive_re().is_match(sample_id) {
        return Ok(InputType::ReadsArchive);
    }
    if sequence_accession_re().is_match(sample_id) {
        return Ok(InputType::SequenceAccession);
    }
    if assembly_accession_re().is_match(sample_id) {
        return Ok(InputType::AssemblyAccession);
    }
    if looks_like_local_file(sample_id) {
        if File::open(sample_id).is_ok() {
            return Ok(InputType::LocalFile);
        }
        return Err(Error::InvalidInput(format!(
            "{:?} is not a readable file",
            sample_id
        )));
    }
    Err(Error::InvalidInput(format!(
        "{:?} is not an SRA/ERR/DRR run, a GenBank or assembly accession, \
         or a FASTA file",
        sample_id
    )))
}

fn looks_like_local_file(sample_id: &str) -> bool {
    sample_id.starts_with('/')
        || FASTA_EXTENSIONS.iter().any(|ext| sample_id.ends_with(ext))
}
