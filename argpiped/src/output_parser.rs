//! The output parser.
//!
//! A completed run leaves a directory tree whose layout is owned by the
//! pipeline script; we only ever read it. Each detection tool writes one
//! tab-separated table, each with its own column set and its own habit of
//! mixing chatter into the output, so extraction is driven by a table of
//! per-tool specs rather than one parser per file. Absent files are
//! normal (early pipeline stages are skipped for some input types);
//! present-but-unreadable files become entries in `parse_warnings`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::sync::OnceLock;

use regex::Regex;

use argpipe_common::prelude::*;
use argpipe_common::rest_api::{
    AnalysisResults, ArgGene, AssemblyStats, DetectionResults, FileEntry, MlstTyping,
    Priority, TaxonomyCall,
};

/// How one tool's rows map onto `ArgGene`.
#[derive(Clone, Copy, Debug)]
enum ToolKind {
    /// The abricate family: `GENE`, `SEQUENCE`, `%COVERAGE`, `%IDENTITY`,
    /// `PRODUCT`, `RESISTANCE` columns, plus a `#FILE`-prefixed header.
    Abricate,
    /// AMRFinderPlus: `Gene symbol`, `Element type`, `Class`, `Method`,
    /// `% Identity to reference sequence`.
    AmrFinder,
    /// RGI best-hit output: `Best_Hit_ARO`, `Drug Class`,
    /// `Resistance Mechanism`.
    Rgi,
}

/// One detection tool we know how to read.
struct ToolSpec {
    key: &'static str,
    pattern: &'static str,
    kind: ToolKind,
}

/// The tool table, in output order.
const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        key: "amrfinderplus",
        pattern: "04_arg_detection/amrfinderplus/*_amrfinderplus.tsv",
        kind: ToolKind::AmrFinder,
    },
    ToolSpec {
        key: "resfinder",
        pattern: "04_arg_detection/resfinder/*_resfinder.tsv",
        kind: ToolKind::Abricate,
    },
    ToolSpec {
        key: "card",
        pattern: "04_arg_detection/card/*_card.tsv",
        kind: ToolKind::Abricate,
    },
    ToolSpec {
        key: "ncbi",
        pattern: "04_arg_detection/ncbi/*_ncbi.tsv",
        kind: ToolKind::Abricate,
    },
    ToolSpec {
        key: "vfdb",
        pattern: "04_arg_detection/vfdb/*_vfdb.tsv",
        kind: ToolKind::Abricate,
    },
    ToolSpec {
        key: "plasmidfinder",
        pattern: "04_arg_detection/plasmidfinder/*_plasmidfinder.tsv",
        kind: ToolKind::Abricate,
    },
    ToolSpec {
        key: "rgi",
        pattern: "04_arg_detection/rgi/*_rgi.txt",
        kind: ToolKind::Rgi,
    },
];

/// Chatter some tools print into their tabular output.
const CHATTER_PREFIXES: &[&str] = &["Using ", "Processing:", "Found ", "Tip:", "Done."];

/// Everything extracted from one run directory, minus the job identity
/// fields the HTTP layer fills in.
#[derive(Debug, Default)]
pub struct ParsedResults {
    /// Contents of `METADATA.json`.
    pub metadata: Option<serde_json::Value>,
    /// QUAST assembly statistics.
    pub assembly_stats: Option<AssemblyStats>,
    /// Per-tool detection results.
    pub arg_detection: BTreeMap<String, DetectionResults>,
    /// `(gene, tool)`-deduplicated gene count.
    pub total_arg_genes: usize,
    /// Sorted unique resistance classes.
    pub unique_resistance_types: Vec<String>,
    /// First row of `features_ml.csv`.
    pub ml_features: Option<BTreeMap<String, String>>,
    /// Kraken2 taxonomic classification.
    pub taxonomy: Option<TaxonomyCall>,
    /// MLST typing.
    pub mlst: Option<MlstTyping>,
    /// Absolute path of the professional HTML report.
    pub report_html_path: Option<String>,
    /// Files that were present but unreadable.
    pub parse_warnings: Vec<String>,
}

impl ParsedResults {
    /// Combine with the job row into the wire type.
    pub fn into_results(self, job: &Job) -> AnalysisResults {
        AnalysisResults {
            job_id: job.id.clone(),
            sample_id: job.sample_id.clone(),
            metadata: self.metadata,
            assembly_stats: self.assembly_stats,
            arg_detection: self.arg_detection,
            total_arg_genes: self.total_arg_genes,
            unique_resistance_types: self.unique_resistance_types,
            ml_features: self.ml_features,
            taxonomy: self.taxonomy,
            mlst: self.mlst,
            report_html_path: self.report_html_path,
            output_directory: job.output_dir.clone().unwrap_or_default(),
            completed_at: job.completed_at.unwrap_or(job.created_at),
            parse_warnings: self.parse_warnings,
        }
    }
}

/// Parse a run directory. Infallible by design: missing pieces stay
/// `None`, broken pieces become warnings, and two passes over the same
/// tree produce identical records.
pub fn parse_run_directory(output_dir: &Path) -> ParsedResults {
    let mut results = ParsedResults::default();

    // METADATA.json, echoed as-is.
    let metadata_path = output_dir.join("METADATA.json");
    if metadata_path.is_file() {
        match fs::read_to_string(&metadata_path)
            .map_err(anyhow::Error::new)
            .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::new))
        {
            Ok(value) => results.metadata = Some(value),
            Err(err) => results
                .parse_warnings
                .push(format!("METADATA.json: {}", err)),
        }
    }

    // QUAST assembly statistics.
    let quast_path = output_dir.join("02_assembly/quast/report.tsv");
    if quast_path.is_file() {
        match parse_quast_report(&quast_path) {
            Ok(stats) => results.assembly_stats = Some(stats),
            Err(err) => results
                .parse_warnings
                .push(format!("02_assembly/quast/report.tsv: {}", err)),
        }
    }

    // Per-tool gene tables.
    for tool in TOOLS {
        let Some(path) = find_tool_file(output_dir, tool.pattern) else {
            continue;
        };
        match parse_tool_table(&path, tool) {
            Ok(genes) => {
                results.arg_detection.insert(
                    tool.key.to_string(),
                    DetectionResults {
                        tool: tool.key.to_string(),
                        num_genes: genes.len(),
                        genes,
                    },
                );
            }
            Err(err) => results
                .parse_warnings
                .push(format!("{}: {}", tool.key, err)),
        }
    }

    // ML feature row.
    let features_path = output_dir.join("06_analysis/features_ml.csv");
    if features_path.is_file() {
        match parse_feature_row(&features_path) {
            Ok(features) => results.ml_features = features,
            Err(err) => results
                .parse_warnings
                .push(format!("06_analysis/features_ml.csv: {}", err)),
        }
    }

    // Taxonomic classification and MLST typing; their location varies
    // across pipeline versions, so search the whole tree.
    if let Some(path) = find_tool_file(output_dir, "**/*kraken2.report") {
        match parse_taxonomy(&path) {
            Ok(taxonomy) => results.taxonomy = taxonomy,
            Err(err) => results.parse_warnings.push(format!("taxonomy: {}", err)),
        }
    }
    if let Some(path) = find_tool_file(output_dir, "**/*mlst*.tsv") {
        match parse_mlst(&path) {
            Ok(mlst) => results.mlst = mlst,
            Err(err) => results.parse_warnings.push(format!("mlst: {}", err)),
        }
    }

    // The professional HTML report, path only.
    results.report_html_path = find_tool_file(
        output_dir,
        "06_analysis/reports/*_ARG_professional_report.html",
    )
    .map(|path| path.display().to_string());

    // Aggregate across tools.
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut resistance_types: BTreeSet<String> = BTreeSet::new();
    for detection in results.arg_detection.values() {
        for gene in &detection.genes {
            seen.insert((gene.gene.clone(), gene.tool.clone()));
            if let Some(resistance) = &gene.resistance {
                for class in resistance.split(';') {
                    let class = class.trim();
                    if !class.is_empty() {
                        resistance_types.insert(class.to_string());
                    }
                }
            }
        }
    }
    results.total_arg_genes = seen.len();
    results.unique_resistance_types = resistance_types.into_iter().collect();

    results
}

/// List every file under a run directory, sorted by relative path.
pub fn list_run_files(output_dir: &Path) -> Result<Vec<FileEntry>> {
    let pattern = format!("{}/**/*", output_dir.display());
    let paths = glob::glob(&pattern)
        .with_context(|| format!("error listing {}", output_dir.display()))
        .map_err(Error::Other)?;

    let mut entries = vec![];
    for path in paths {
        let path = path
            .with_context(|| format!("error listing {}", output_dir.display()))
            .map_err(Error::Other)?;
        if !path.is_file() {
            continue;
        }
        let metadata = match path.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        let rel_path = path
            .strip_prefix(output_dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string_lossy().into_owned());
        entries.push(FileEntry {
            mime: mime_for(&path).to_string(),
            rel_path,
            size: metadata.len(),
        });
    }
    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

/// Best-effort MIME type by extension, for the file listing.
fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "tsv" => "text/tab-separated-values",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "log" | "txt" => "text/plain",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "fasta" | "fna" | "fa" | "faa" | "ffn" | "gff" | "gbk" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Find the (lexicographically first) file matching `pattern` under
/// `output_dir`. The sample id is embedded in the file names, so the
/// glob keeps us independent of how the script spells it.
fn find_tool_file(output_dir: &Path, pattern: &str) -> Option<PathBuf> {
    let full = format!("{}/{}", output_dir.display(), pattern);
    let mut matches: Vec<PathBuf> = glob::glob(&full)
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter(|p| p.is_file())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// A tab-separated table with named columns.
struct TsvTable {
    columns: HashMap<String, usize>,
    rows: Vec<csv::StringRecord>,
}

impl TsvTable {
    /// Column value of `row` by header name. Missing columns and empty
    /// cells both read as `None`.
    fn get<'a>(&self, row: &'a csv::StringRecord, name: &str) -> Option<&'a str> {
        let index = *self.columns.get(name)?;
        match row.get(index) {
            Some("") | None => None,
            Some(value) => Some(value),
        }
    }

    /// Like `get`, but parsed as a number; unparseable values read as
    /// `None` rather than failing the row.
    fn get_f64(&self, row: &csv::StringRecord, name: &str) -> Option<f64> {
        self.get(row, name)?.trim().parse().ok()
    }
}

/// Read one tool's table, reconstructing the header and dropping
/// comments and chatter.
///
/// The abricate family prefixes its header with `#FILE`; we recover it
/// by stripping the `#`. Every other `#` line is a comment. A file with
/// no surviving data rows is an empty result, not an error.
fn read_tsv_table(path: &Path) -> anyhow::Result<TsvTable> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;

    let mut header: Option<String> = None;
    let mut data = String::new();
    for line in text.lines() {
        if let Some(stripped) = line.strip_prefix('#') {
            if line.starts_with("#FILE") {
                header = Some(stripped.to_string());
            }
            continue;
        }
        if CHATTER_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        if header.is_none() {
            header = Some(line.to_string());
            continue;
        }
        data.push_str(line);
        data.push('\n');
    }

    let Some(header) = header else {
        return Ok(TsvTable {
            columns: HashMap::new(),
            rows: vec![],
        });
    };

    let mut table = String::with_capacity(header.len() + data.len() + 1);
    table.push_str(&header);
    table.push('\n');
    table.push_str(&data);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(table.as_bytes());
    let columns = reader
        .headers()
        .with_context(|| format!("could not read header of {}", path.display()))?
        .iter()
        .enumerate()
        .map(|(index, name)| (name.trim().to_string(), index))
        .collect();
    let rows = reader
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("could not parse {}", path.display()))?;
    Ok(TsvTable { columns, rows })
}

/// Parse one tool's file into gene records.
fn parse_tool_table(path: &Path, tool: &ToolSpec) -> anyhow::Result<Vec<ArgGene>> {
    let table = read_tsv_table(path)?;
    let mut genes = vec![];
    for row in &table.rows {
        let gene = match tool.kind {
            ToolKind::Abricate => abricate_gene(&table, row, tool.key),
            ToolKind::AmrFinder => amrfinder_gene(&table, row),
            ToolKind::Rgi => rgi_gene(&table, row),
        };
        if let Some(gene) = gene {
            genes.push(gene);
        }
    }
    Ok(genes)
}

fn abricate_gene(
    table: &TsvTable,
    row: &csv::StringRecord,
    tool: &str,
) -> Option<ArgGene> {
    let gene = table.get(row, "GENE")?.to_string();
    let resistance = table.get(row, "RESISTANCE").map(str::to_string);
    Some(ArgGene {
        priority: classify_priority(resistance.as_deref()),
        gene,
        tool: tool.to_string(),
        contig: table.get(row, "SEQUENCE").map(str::to_string),
        coverage: table.get_f64(row, "%COVERAGE"),
        identity: table.get_f64(row, "%IDENTITY"),
        product: table.get(row, "PRODUCT").map(str::to_string),
        resistance,
        element_type: None,
        method: None,
        mechanism: None,
    })
}

fn amrfinder_gene(table: &TsvTable, row: &csv::StringRecord) -> Option<ArgGene> {
    let gene = table
        .get(row, "Gene symbol")
        .or_else(|| table.get(row, "Element symbol"))?
        .to_string();
    let resistance = table.get(row, "Class").map(str::to_string);
    Some(ArgGene {
        priority: classify_priority(resistance.as_deref()),
        gene,
        tool: "amrfinderplus".to_string(),
        contig: table.get(row, "Contig id").map(str::to_string),
        coverage: None,
        identity: table.get_f64(row, "% Identity to reference sequence"),
        product: table.get(row, "Sequence name").map(str::to_string),
        resistance,
        element_type: table
            .get(row, "Element type")
            .or(Some("AMR"))
            .map(str::to_string),
        method: table.get(row, "Method").map(str::to_string),
        mechanism: None,
    })
}

fn rgi_gene(table: &TsvTable, row: &csv::StringRecord) -> Option<ArgGene> {
    let gene = table.get(row, "Best_Hit_ARO")?.to_string();
    let resistance = table.get(row, "Drug Class").map(str::to_string);
    Some(ArgGene {
        priority: classify_priority(resistance.as_deref()),
        gene,
        tool: "rgi".to_string(),
        contig: table.get(row, "Contig").map(str::to_string),
        coverage: None,
        identity: table.get_f64(row, "Best_Identities"),
        product: None,
        resistance,
        element_type: None,
        method: table.get(row, "Model_type").map(str::to_string),
        mechanism: table.get(row, "Resistance Mechanism").map(str::to_string),
    })
}

/// Resistance classes in descending clinical priority. Matching is
/// case-insensitive substring, first bucket wins.
const CRITICAL_CLASSES: &[&str] =
    &["carbapenem", "colistin", "vancomycin", "mrsa", "linezolid"];
const HIGH_CLASSES: &[&str] =
    &["beta-lactam", "fluoroquinolone", "aminoglycoside", "esbl"];
const MEDIUM_CLASSES: &[&str] =
    &["tetracycline", "sulfonamide", "trimethoprim", "chloramphenicol"];

/// Classify the clinical priority of a gene from its resistance class.
pub fn classify_priority(resistance: Option<&str>) -> Priority {
    let Some(resistance) = resistance else {
        return Priority::Low;
    };
    let lower = resistance.to_lowercase();
    if CRITICAL_CLASSES.iter().any(|c| lower.contains(c)) {
        return Priority::Critical;
    }
    if HIGH_CLASSES.iter().any(|c| lower.contains(c)) {
        return Priority::High;
    }
    if MEDIUM_CLASSES.iter().any(|c| lower.contains(c)) {
        return Priority::Medium;
    }
    Priority::Low
}

/// Parse the QUAST report: `metric<TAB>value` rows, no header.
fn parse_quast_report(path: &Path) -> anyhow::Result<AssemblyStats> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let mut metrics: HashMap<&str, &str> = HashMap::new();
    for line in text.lines() {
        if let Some((metric, value)) = line.split_once('\t') {
            metrics.insert(metric.trim(), value.trim());
        }
    }
    let int = |name: &str| metrics.get(name).and_then(|v| v.parse::<i64>().ok());
    let float = |name: &str| metrics.get(name).and_then(|v| v.parse::<f64>().ok());
    Ok(AssemblyStats {
        num_contigs: int("# contigs"),
        total_length: int("Total length"),
        largest_contig: int("Largest contig"),
        n50: int("N50"),
        l50: int("L50"),
        gc_percent: float("GC (%)"),
    })
}

/// Parse the Kraken2 report: keep the best species-rank and genus-rank
/// lines by read percentage. Columns are read-percent, clade reads,
/// direct reads, rank code, taxid, name.
fn parse_taxonomy(path: &Path) -> anyhow::Result<Option<TaxonomyCall>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let mut species: Option<(String, f64)> = None;
    let mut genus: Option<(String, f64)> = None;
    for line in text.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 6 {
            continue;
        }
        let Ok(percent) = parts[0].trim().parse::<f64>() else {
            continue;
        };
        let rank = parts[3].trim();
        let name = parts[5].trim();
        match rank {
            "S" if species.as_ref().map(|s| percent > s.1).unwrap_or(true) => {
                species = Some((name.to_string(), percent));
            }
            "G" if genus.as_ref().map(|g| percent > g.1).unwrap_or(true) => {
                genus = Some((name.to_string(), percent));
            }
            _ => {}
        }
    }
    Ok(species.map(|(species, confidence)| TaxonomyCall {
        species,
        genus: genus.map(|(name, _)| name),
        confidence,
    }))
}

fn mlst_allele_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:Pas_)?(\w+)\((\d+)\)$").unwrap())
}

/// Parse the MLST table: one data row of `FILE SCHEME ST allele…`, with
/// alleles spelled `gene(number)` (some schemes prefix loci with
/// `Pas_`). An unassigned sequence type (`-`) means no typing at all.
fn parse_mlst(path: &Path) -> anyhow::Result<Option<MlstTyping>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let Some(line) = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
    else {
        return Ok(None);
    };

    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 3 {
        return Ok(None);
    }
    let sequence_type = parts[2].trim();
    if sequence_type.is_empty() || sequence_type == "-" {
        return Ok(None);
    }
    let scheme = match parts[1].trim() {
        "" | "-" => None,
        scheme => Some(scheme.to_string()),
    };

    let mut alleles = BTreeMap::new();
    let mut profile = vec![];
    for (index, raw) in parts[3..].iter().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() || raw == "-" {
            continue;
        }
        if let Some(captures) = mlst_allele_re().captures(raw) {
            alleles.insert(captures[1].to_string(), captures[2].to_string());
            profile.push(captures[2].to_string());
        } else if raw.chars().all(|c| c.is_ascii_digit()) {
            // Bare allele numbers; keep them under positional names.
            alleles.insert(format!("locus_{}", index + 1), raw.to_string());
            profile.push(raw.to_string());
        }
    }

    Ok(Some(MlstTyping {
        scheme,
        sequence_type: sequence_type.to_string(),
        alleles,
        profile: if profile.is_empty() {
            None
        } else {
            Some(profile.join("-"))
        },
    }))
}

/// Read the single feature row of `features_ml.csv` as a map.
fn parse_feature_row(path: &Path) -> anyhow::Result<Option<BTreeMap<String, String>>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("could not read header of {}", path.display()))?
        .clone();
    let Some(record) = reader.records().next() else {
        return Ok(None);
    };
    let record =
        record.with_context(|| format!("could not parse {}", path.display()))?;
    Ok(Some(
        headers
            .iter()
            .zip(record.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fake_run_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(root, "METADATA.json", r#"{"pipeline_version": "3.2"}"#);

        write(
            root,
            "02_assembly/quast/report.tsv",
            "Assembly\tSRR1\n\
             # contigs\t35\n\
             Largest contig\t409311\n\
             Total length\t4641652\n\
             GC (%)\t50.79\n\
             N50\t221281\n\
             L50\t7\n",
        );

        write(
            root,
            "04_arg_detection/resfinder/SRR1_resfinder.tsv",
            "Using database resfinder\n\
             #FILE\tSEQUENCE\tSTART\tEND\tSTRAND\tGENE\t%COVERAGE\t%IDENTITY\tPRODUCT\tRESISTANCE\n\
             contigs.fa\tcontig_1\t100\t961\t+\tblaTEM-1B\t100.00\t99.88\tbeta-lactamase\tBeta-lactam\n\
             contigs.fa\tcontig_4\t55\t900\t-\ttet(A)\t97.40\t98.12\tefflux pump\tTetracycline\n\
             Done.\n",
        );

        write(
            root,
            "04_arg_detection/amrfinderplus/SRR1_amrfinderplus.tsv",
            "Protein identifier\tContig id\tGene symbol\tSequence name\tElement type\tClass\tMethod\t% Identity to reference sequence\n\
             NA\tcontig_1\tblaKPC-2\tcarbapenemase KPC-2\tAMR\tCARBAPENEM\tBLASTX\t100.00\n",
        );

        write(
            root,
            "04_arg_detection/rgi/SRR1_rgi.txt",
            "ORF_ID\tContig\tBest_Hit_ARO\tDrug Class\tResistance Mechanism\tModel_type\tBest_Identities\n\
             orf1\tcontig_2\tvanA\tglycopeptide antibiotic; vancomycin\tantibiotic target alteration\tprotein homolog model\t99.1\n",
        );

        write(
            root,
            "06_analysis/features_ml.csv",
            "sample_id,total_args,critical_args\nSRR1,4,2\n",
        );

        write(
            root,
            "05_taxonomy/kraken2/SRR1_kraken2.report",
            " 96.31\t48210\t120\tG\t561\t  Escherichia\n\
              95.20\t47650\t1190\tS\t562\t    Escherichia coli\n\
               1.02\t510\t12\tS\t620\t    Shigella sonnei\n",
        );

        write(
            root,
            "03_annotation/mlst/SRR1_mlst.tsv",
            "contigs.fa\tecoli\t131\tadk(53)\tfumC(40)\tgyrB(47)\n",
        );

        write(
            root,
            "06_analysis/reports/SRR1_ARG_professional_report.html",
            "<html></html>",
        );

        dir
    }

    #[test]
    fn parses_a_complete_tree() {
        let dir = fake_run_dir();
        let results = parse_run_directory(dir.path());

        assert!(results.parse_warnings.is_empty());
        assert_eq!(
            results.metadata.as_ref().unwrap()["pipeline_version"],
            "3.2"
        );

        let stats = results.assembly_stats.unwrap();
        assert_eq!(stats.num_contigs, Some(35));
        assert_eq!(stats.total_length, Some(4_641_652));
        assert_eq!(stats.n50, Some(221_281));
        assert_eq!(stats.gc_percent, Some(50.79));

        let resfinder = &results.arg_detection["resfinder"];
        assert_eq!(resfinder.num_genes, 2);
        assert_eq!(resfinder.genes[0].gene, "blaTEM-1B");
        assert_eq!(resfinder.genes[0].coverage, Some(100.0));
        assert_eq!(resfinder.genes[0].priority, Priority::High);
        assert_eq!(resfinder.genes[1].priority, Priority::Medium);

        let amrfinder = &results.arg_detection["amrfinderplus"];
        assert_eq!(amrfinder.num_genes, 1);
        assert_eq!(amrfinder.genes[0].gene, "blaKPC-2");
        assert_eq!(amrfinder.genes[0].element_type.as_deref(), Some("AMR"));
        assert_eq!(amrfinder.genes[0].method.as_deref(), Some("BLASTX"));
        assert_eq!(amrfinder.genes[0].priority, Priority::Critical);

        let rgi = &results.arg_detection["rgi"];
        assert_eq!(rgi.genes[0].gene, "vanA");
        assert_eq!(rgi.genes[0].priority, Priority::Critical);
        assert_eq!(
            rgi.genes[0].mechanism.as_deref(),
            Some("antibiotic target alteration")
        );

        assert_eq!(results.total_arg_genes, 4);
        assert_eq!(
            results.unique_resistance_types,
            vec![
                "Beta-lactam",
                "CARBAPENEM",
                "Tetracycline",
                "glycopeptide antibiotic",
                "vancomycin",
            ]
        );

        let taxonomy = results.taxonomy.as_ref().unwrap();
        assert_eq!(taxonomy.species, "Escherichia coli");
        assert_eq!(taxonomy.genus.as_deref(), Some("Escherichia"));
        assert_eq!(taxonomy.confidence, 95.2);

        let mlst = results.mlst.as_ref().unwrap();
        assert_eq!(mlst.scheme.as_deref(), Some("ecoli"));
        assert_eq!(mlst.sequence_type, "131");
        assert_eq!(mlst.alleles["adk"], "53".to_string());
        assert_eq!(mlst.alleles["gyrB"], "47".to_string());
        assert_eq!(mlst.profile.as_deref(), Some("53-40-47"));

        assert_eq!(
            results.ml_features.unwrap()["critical_args"],
            "2".to_string()
        );
        assert!(results
            .report_html_path
            .unwrap()
            .ends_with("SRR1_ARG_professional_report.html"));
    }

    #[test]
    fn missing_files_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let results = parse_run_directory(dir.path());
        assert!(results.metadata.is_none());
        assert!(results.assembly_stats.is_none());
        assert!(results.arg_detection.is_empty());
        assert_eq!(results.total_arg_genes, 0);
        assert!(results.unique_resistance_types.is_empty());
        assert!(results.taxonomy.is_none());
        assert!(results.mlst.is_none());
        assert!(results.report_html_path.is_none());
        assert!(results.parse_warnings.is_empty());
    }

    #[test]
    fn broken_files_become_warnings() {
        let dir = fake_run_dir();
        write(dir.path(), "METADATA.json", "{ not json");
        let results = parse_run_directory(dir.path());
        assert_eq!(results.parse_warnings.len(), 1);
        assert!(results.parse_warnings[0].starts_with("METADATA.json:"));
        // Everything else still parses.
        assert_eq!(results.arg_detection.len(), 3);
    }

    #[test]
    fn chatter_only_tool_files_yield_empty_results() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "04_arg_detection/card/SRR1_card.tsv",
            "Using database card\nDone.\n",
        );
        let results = parse_run_directory(dir.path());
        let card = &results.arg_detection["card"];
        assert_eq!(card.num_genes, 0);
        assert!(results.parse_warnings.is_empty());
    }

    #[test]
    fn unparseable_numbers_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "04_arg_detection/resfinder/SRR1_resfinder.tsv",
            "#FILE\tSEQUENCE\tGENE\t%COVERAGE\t%IDENTITY\n\
             contigs.fa\tcontig_1\tsul1\tnot-a-number\t99.0\n",
        );
        let results = parse_run_directory(dir.path());
        let gene = &results.arg_detection["resfinder"].genes[0];
        assert_eq!(gene.coverage, None);
        assert_eq!(gene.identity, Some(99.0));
        assert_eq!(gene.priority, Priority::Medium);
    }

    #[test]
    fn mlst_without_a_sequence_type_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "03_annotation/mlst/SRR1_mlst.tsv",
            "contigs.fa\t-\t-\n",
        );
        let results = parse_run_directory(dir.path());
        assert!(results.mlst.is_none());
        assert!(results.parse_warnings.is_empty());
    }

    #[test]
    fn mlst_bare_allele_numbers_keep_positional_loci() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "03_annotation/mlst/SRR1_mlst.tsv",
            "contigs.fa\tsaureus\t8\t3\t1\t-\t1\n",
        );
        let results = parse_run_directory(dir.path());
        let mlst = results.mlst.unwrap();
        assert_eq!(mlst.sequence_type, "8");
        assert_eq!(mlst.alleles["locus_1"], "3".to_string());
        assert_eq!(mlst.alleles["locus_4"], "1".to_string());
        assert_eq!(mlst.profile.as_deref(), Some("3-1-1"));
    }

    #[test]
    fn taxonomy_picks_the_best_supported_species() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "05_taxonomy/kraken2/SRR1_kraken2.report",
            "  4.10\t200\t5\tS\t620\t  Shigella sonnei\n\
              90.00\t9000\t400\tS\t562\t  Escherichia coli\n",
        );
        let results = parse_run_directory(dir.path());
        let taxonomy = results.taxonomy.unwrap();
        assert_eq!(taxonomy.species, "Escherichia coli");
        assert_eq!(taxonomy.confidence, 90.0);
        assert_eq!(taxonomy.genus, None);
    }

    #[test]
    fn parsing_twice_is_deterministic() {
        let dir = fake_run_dir();
        let first = parse_run_directory(dir.path());
        let second = parse_run_directory(dir.path());
        let job = fake_job();
        assert_eq!(
            serde_json::to_string(&first.into_results(&job)).unwrap(),
            serde_json::to_string(&second.into_results(&job)).unwrap(),
        );
    }

    #[test]
    fn priority_buckets_match_the_classification() {
        assert_eq!(
            classify_priority(Some("Carbapenem; Colistin")),
            Priority::Critical
        );
        assert_eq!(classify_priority(Some("ESBL")), Priority::High);
        assert_eq!(classify_priority(Some("trimethoprim")), Priority::Medium);
        assert_eq!(classify_priority(Some("macrolide")), Priority::Low);
        assert_eq!(classify_priority(None), Priority::Low);
    }

    #[test]
    fn lists_run_files_with_sizes_and_mime_types() {
        let dir = fake_run_dir();
        let files = list_run_files(dir.path()).unwrap();
        assert!(!files.is_empty());
        let metadata = files
            .iter()
            .find(|f| f.rel_path == "METADATA.json")
            .unwrap();
        assert_eq!(metadata.mime, "application/json");
        assert!(metadata.size > 0);
        // Sorted by relative path.
        let mut sorted = files.iter().map(|f| f.rel_path.clone()).collect::<Vec<_>>();
        sorted.sort();
        assert_eq!(
            files.iter().map(|f| f.rel_path.clone()).collect::<Vec<_>>(),
            sorted
        );
    }

    fn fake_job() -> Job {
        Job {
            id: "test-job".to_string(),
            sample_id: "SRR1".to_string(),
            input_type: Some(InputType::ReadsArchive),
            status: Status::Completed,
            run_number: Some(1),
            output_dir: Some("/tmp/outputs/SRR1_1".to_string()),
            pid: None,
            threads: 8,
            prokka_mode: ProkkaMode::Auto,
            prokka_genus: None,
            prokka_species: None,
            force: false,
            created_at: chrono::NaiveDate::from_ymd_opt(2026, 1, 28)
                .unwrap()
                .and_hms_opt(12, 40, 16)
                .unwrap(),
            started_at: None,
            completed_at: None,
            exit_code: Some(0),
            error_message: None,
            progress_percent: 100,
            current_step: "finalizing".to_string(),
            logs_preview: None,
        }
    }
}
