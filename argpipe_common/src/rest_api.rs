//! Types used in the daemon's REST API.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json;

use crate::models::{InputType, Job, ProkkaMode, Status};

/// Request a new analysis run.
#[derive(Clone, Debug, Deserialize)]
pub struct LaunchRequest {
    /// Sample identifier: an accession or a local FASTA path.
    pub sample_id: String,
    /// Thread count for the pipeline. Defaults to the configured value.
    pub threads: Option<i32>,
    /// Annotation mode. Defaults to `auto`.
    pub prokka_mode: Option<ProkkaMode>,
    /// Genus override, required by `custom` mode.
    pub prokka_genus: Option<String>,
    /// Species override, required by `custom` mode.
    pub prokka_species: Option<String>,
    /// Run non-interactively, overwriting stale intermediate data.
    pub force: Option<bool>,
}

/// Reply to a successful launch.
#[derive(Debug, Serialize)]
pub struct LaunchResponse {
    /// The ID of the new job.
    pub job_id: String,
    /// The sample identifier, echoed.
    pub sample_id: String,
    /// Always `RUNNING` on the success path.
    pub status: Status,
    /// When the job row was created.
    pub created_at: NaiveDateTime,
}

/// Everything a polling client needs to render one job.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    /// The ID of the job.
    pub job_id: String,
    /// The sample identifier.
    pub sample_id: String,
    /// The current status.
    pub status: Status,
    /// The input shape the classifier decided on.
    pub input_type: Option<InputType>,
    /// The per-sample run number.
    pub run_number: Option<i32>,
    /// Estimated progress in percent.
    pub progress_percent: i32,
    /// The phase the progress tracker last recognized.
    pub current_step: String,
    /// Bounded tail of the pipeline log.
    pub logs_preview: Option<String>,
    /// When the pipeline was spawned.
    pub started_at: Option<NaiveDateTime>,
    /// When the job reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<NaiveDateTime>,
    /// Exit code of the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Why the job failed or was stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        JobStatusResponse {
            job_id: job.id,
            sample_id: job.sample_id,
            status: job.status,
            input_type: job.input_type,
            run_number: job.run_number,
            progress_percent: job.progress_percent,
            current_step: job.current_step,
            logs_preview: job.logs_preview,
            started_at: job.started_at,
            completed_at: job.completed_at,
            exit_code: job.exit_code,
            error_message: job.error_message,
        }
    }
}

/// One entry of the job list.
#[derive(Debug, Serialize)]
pub struct JobListItem {
    /// The ID of the job.
    pub job_id: String,
    /// The sample identifier.
    pub sample_id: String,
    /// The current status.
    pub status: Status,
    /// The input shape the classifier decided on.
    pub input_type: Option<InputType>,
    /// The per-sample run number.
    pub run_number: Option<i32>,
    /// Estimated progress in percent.
    pub progress_percent: i32,
    /// When the job row was created.
    pub created_at: NaiveDateTime,
    /// When the job reached a terminal status.
    pub completed_at: Option<NaiveDateTime>,
}

impl From<Job> for JobListItem {
    fn from(job: Job) -> Self {
        JobListItem {
            job_id: job.id,
            sample_id: job.sample_id,
            status: job.status,
            input_type: job.input_type,
            run_number: job.run_number,
            progress_percent: job.progress_percent,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Reply to `GET /api/jobs`.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    /// Total number of jobs matching the filter, ignoring pagination.
    pub total: i64,
    /// The requested page.
    pub jobs: Vec<JobListItem>,
}

/// Positive acknowledgement with no further payload.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    /// Always true.
    pub ack: bool,
}

impl AckResponse {
    /// The one value this type ever has.
    pub fn new() -> AckResponse {
        AckResponse { ack: true }
    }
}

impl Default for AckResponse {
    fn default() -> Self {
        AckResponse::new()
    }
}

/// One file of a run directory.
#[derive(Debug, Eq, PartialEq, Serialize)]
pub struct FileEntry {
    /// Path relative to the run directory.
    pub rel_path: String,
    /// Size in bytes.
    pub size: u64,
    /// Best-effort MIME type, by extension.
    pub mime: String,
}

/// Assembly statistics extracted from the QUAST report.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AssemblyStats {
    /// Number of contigs.
    pub num_contigs: Option<i64>,
    /// Total assembly length in bases.
    pub total_length: Option<i64>,
    /// Length of the largest contig.
    pub largest_contig: Option<i64>,
    /// N50 of the assembly.
    pub n50: Option<i64>,
    /// L50 of the assembly.
    pub l50: Option<i64>,
    /// GC content in percent.
    pub gc_percent: Option<f64>,
}

/// Taxonomic classification extracted from the Kraken2 report.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaxonomyCall {
    /// The best-supported species.
    pub species: String,
    /// The best-supported genus, when the report has genus-rank lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genus: Option<String>,
    /// Percentage of reads supporting the species call.
    pub confidence: f64,
}

/// MLST typing extracted from the typing table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MlstTyping {
    /// The typing scheme the alleles belong to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// The assigned sequence type.
    pub sequence_type: String,
    /// Allele number per locus.
    pub alleles: BTreeMap<String, String>,
    /// Allele numbers joined in table order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// One resistance or virulence gene reported by a detection tool.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ArgGene {
    /// Gene symbol.
    pub gene: String,
    /// The tool that reported it.
    pub tool: String,
    /// Contig or sequence the hit is on, when the tool reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contig: Option<String>,
    /// Coverage of the reference in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    /// Identity to the reference in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<f64>,
    /// Product description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// Resistance phenotype or drug class, as the tool spells it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resistance: Option<String>,
    /// Element type (AMR, VIRULENCE, STRESS), where reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    /// Detection method, where reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Resistance mechanism, where reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
    /// Clinical priority derived from the resistance class.
    pub priority: Priority,
}

/// Clinical priority of a detected gene.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Last-resort antibiotic classes.
    Critical,
    /// Broad first-line classes.
    High,
    /// Common, clinically manageable classes.
    Medium,
    /// Everything else.
    Low,
}

/// The genes one detection tool reported.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectionResults {
    /// The tool that produced these rows.
    pub tool: String,
    /// Number of genes.
    pub num_genes: usize,
    /// The genes, in file order.
    pub genes: Vec<ArgGene>,
}

/// Everything extracted from a completed run directory.
#[derive(Debug, Serialize)]
pub struct AnalysisResults {
    /// The ID of the job.
    pub job_id: String,
    /// The sample identifier.
    pub sample_id: String,
    /// Contents of `METADATA.json`, echoed as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Assembly statistics, when the assembly stage ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly_stats: Option<AssemblyStats>,
    /// Per-tool detection results, keyed by tool.
    pub arg_detection: BTreeMap<String, DetectionResults>,
    /// Number of `(gene, tool)`-deduplicated genes across all tools.
    pub total_arg_genes: usize,
    /// Sorted, deduplicated resistance classes across all tools.
    pub unique_resistance_types: Vec<String>,
    /// First row of `features_ml.csv`, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_features: Option<BTreeMap<String, String>>,
    /// Taxonomic classification, when the pipeline ran Kraken2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxonomy: Option<TaxonomyCall>,
    /// MLST typing, when a sequence type was assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mlst: Option<MlstTyping>,
    /// Absolute path of the professional HTML report, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_html_path: Option<String>,
    /// The run directory the results were parsed from.
    pub output_directory: String,
    /// When the job completed.
    pub completed_at: NaiveDateTime,
    /// Files that were present but could not be parsed.
    pub parse_warnings: Vec<String>,
}

/// One reference data bundle, as reported by `GET /api/databases`.
#[derive(Debug, Serialize)]
pub struct AssetStatus {
    /// Stable key of the bundle.
    pub key: String,
    /// Human-readable name.
    pub display_name: String,
    /// Where the bundle lives on disk.
    pub install_path: String,
    /// Whether the pipeline refuses to run without this bundle.
    pub required: bool,
    /// Whether the installed-ness probe found the marker files.
    pub installed: bool,
    /// Recursive size of the install directory in bytes.
    pub size_bytes: u64,
    /// Rough size the bundle is expected to have once installed.
    pub size_estimate: String,
    /// `idle`, `downloading` or `error`.
    pub download_state: String,
    /// Progress of an active download, when one is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_progress_percent: Option<i32>,
    /// The last download failure, when the state is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Progress of one asset download.
#[derive(Clone, Debug, Serialize)]
pub struct DownloadProgress {
    /// `idle`, `downloading` or `error`.
    pub state: String,
    /// Percent complete; -1 when the total size is unknown.
    pub percent: i32,
    /// Last human-readable progress message.
    pub last_message: String,
}
