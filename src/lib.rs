pub mod clades;
pub mod concat;
pub mod config;
pub mod fasta;
pub mod reroot;
pub mod select;
pub mod taxon;
pub mod tree;

use crate::{
    clades::find_clades,
    concat::{realign, write_selection, Aligner, ExternalAligner, RealignedOg, Supermatrix},
    config::Config,
    fasta::Alignment,
    reroot::{reroot, RerootOutcome},
    select::{select_sequences, Reason, SelectionResult},
    taxon::{CoverageStrategy, Targets, TAXON_CODE_LEN},
    tree::{extract_newick, PhyloTree},
};
use anyhow::{anyhow, bail, Result};
use chrono::Local;
use clap::{builder::PossibleValue, Parser, Subcommand, ValueEnum};
use csv::WriterBuilder;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};
use walkdir::WalkDir;

/// Alignment file extensions picked up from the alignments directory
const ALIGNMENT_EXTENSIONS: &[&str] = &["fasta", "fas", "faa", "fa"];

/// Ortholog selection and supermatrix concatenation
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output directory
    #[arg(
        short,
        long,
        value_name = "OUTDIR",
        default_value = "ogconcat-out",
        global = true
    )]
    pub outdir: PathBuf,

    /// Log level
    #[arg(short, long, global = true)]
    pub log: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Choose one sequence per taxon for every gene family
    Select(SelectArgs),

    /// Choose, realign and concatenate into a supermatrix
    Concat(ConcatArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct SelectArgs {
    /// Directory of per-OG alignments
    #[arg(long, value_name = "ALIGNMENTS")]
    pub alignments: PathBuf,

    /// Directory of per-OG gene trees (Newick or NEXUS)
    #[arg(long, value_name = "TREES")]
    pub trees: PathBuf,

    /// Target taxa: a .txt file of codes or comma-separated codes
    #[arg(long, value_name = "TARGETS")]
    pub targets: Option<String>,

    /// TOML configuration file
    #[arg(long, value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of OGs processed in parallel
    #[arg(short, long, value_name = "JOBS")]
    pub jobs: Option<usize>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ConcatArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Aligner program, called as "<ALIGNER> [ARGS] <unaligned.fasta>"
    #[arg(long, value_name = "ALIGNER")]
    pub aligner: Option<String>,

    /// Aligner arguments (replace the configured ones)
    #[arg(long, value_name = "ARG", num_args = 0.., allow_hyphen_values = true)]
    pub aligner_args: Option<Vec<String>>,

    /// Number of aligner processes run at once
    #[arg(long, value_name = "ALIGNER_JOBS")]
    pub aligner_jobs: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum LogLevel {
    Info,
    Debug,
}

impl ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogLevel::Info, LogLevel::Debug]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            LogLevel::Info => PossibleValue::new("info"),
            LogLevel::Debug => PossibleValue::new("debug"),
        })
    }
}

/// An alignment and the tree paired with it
#[derive(Debug, Clone, PartialEq)]
pub struct OgJob {
    pub name: String,
    pub alignment: PathBuf,
    pub tree: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OgStatus {
    Selected,
    Concatenated,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OgReport {
    pub og: String,
    pub status: OgStatus,
    pub rooting: Option<String>,
    pub taxa: usize,
    pub width: Option<usize>,
    pub reason: Option<String>,
}

impl OgReport {
    fn skipped(og: &str, reason: String) -> Self {
        warn!("Skipping {og}: {reason}");
        OgReport {
            og: og.to_string(),
            status: OgStatus::Skipped,
            rooting: None,
            taxa: 0,
            width: None,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Serialize)]
struct SelectionRow<'a> {
    og: &'a str,
    taxon: &'a str,
    sequence: &'a str,
    reason: String,
    clade_taxa: Option<usize>,
    score: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SupermatrixSummary {
    path: PathBuf,
    taxa: usize,
    width: usize,
    ogs: usize,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    started: String,
    finished: String,
    ogs: Vec<OgReport>,
    supermatrix: Option<SupermatrixSummary>,
}

/// A gene family after tree work and selection
#[derive(Debug)]
pub struct SelectedOg {
    pub name: String,
    pub rooting: String,
    pub selection: SelectionResult,
}

/// Everything resolved before any OG is touched
#[derive(Debug)]
pub struct Prepared {
    pub config: Config,
    pub targets: Targets,
    pub jobs: Vec<OgJob>,
    pub unpaired: Vec<OgReport>,
}

// --------------------------------------------------
pub fn select(outdir: &Path, args: &SelectArgs) -> Result<()> {
    let start = Instant::now();
    let started = Local::now();
    let prepared = prepare(args)?;
    info!("Selecting from {} gene families", prepared.jobs.len());

    let unaligned_dir = outdir.join("unaligned");
    fs::create_dir_all(&unaligned_dir)?;

    let (selected, mut reports) = select_all(&prepared)?;
    for og in &selected {
        let mut report = selected_report(og);
        match write_selection(&og.name, &og.selection, &unaligned_dir) {
            Ok(path) => debug!("Wrote {}", path.display()),
            Err(e) => report = OgReport::skipped(&og.name, e.to_string()),
        }
        reports.push(report);
    }

    reports.sort_by(|a, b| a.og.cmp(&b.og));
    write_selections(&outdir.join("selected-sequences.tsv"), &selected)?;
    write_summary(outdir, started, reports, None)?;

    println!(
        r#"Selected sequences for {} gene families in {} seconds, see output in "{}""#,
        selected.len(),
        start.elapsed().as_secs(),
        outdir.display()
    );
    Ok(())
}

// --------------------------------------------------
pub fn concat(outdir: &Path, args: &ConcatArgs) -> Result<()> {
    let mut prepared = prepare(&args.select)?;
    if let Some(program) = &args.aligner {
        prepared.config.aligner.program = program.clone();
    }
    if let Some(aligner_args) = &args.aligner_args {
        prepared.config.aligner.args = aligner_args.clone();
    }
    if let Some(jobs) = args.aligner_jobs {
        prepared.config.aligner.jobs = jobs;
    }

    let aligner = ExternalAligner::new(
        &prepared.config.aligner.program,
        &prepared.config.aligner.args,
    )?;
    info!("Aligner = {}", aligner.program.display());

    run_concat(outdir, &prepared, &aligner)
}

// --------------------------------------------------
/// Select, realign and concatenate with the given aligner
pub fn run_concat(
    outdir: &Path,
    prepared: &Prepared,
    aligner: &dyn Aligner,
) -> Result<()> {
    let start = Instant::now();
    let started = Local::now();
    info!("Concatenating {} gene families", prepared.jobs.len());

    let unaligned_dir = outdir.join("unaligned");
    let aligned_dir = outdir.join("aligned");
    fs::create_dir_all(&unaligned_dir)?;
    fs::create_dir_all(&aligned_dir)?;

    let (selected, mut reports) = select_all(prepared)?;
    write_selections(&outdir.join("selected-sequences.tsv"), &selected)?;

    // The aligner is the slow part, so it gets its own bound
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(prepared.config.aligner.jobs.max(1))
        .build()?;
    let realigned: Vec<(&SelectedOg, Result<RealignedOg>)> = pool.install(|| {
        selected
            .par_iter()
            .map(|og| {
                let res = realign(
                    &og.name,
                    &og.selection,
                    &unaligned_dir,
                    &aligned_dir,
                    aligner,
                );
                (og, res)
            })
            .collect()
    });

    // Barrier: every OG has finished; join in name order
    let mut ogs = vec![];
    for (og, res) in realigned {
        match res {
            Ok(aligned) => {
                let mut report = selected_report(og);
                report.status = OgStatus::Concatenated;
                report.width = Some(aligned.width);
                reports.push(report);
                ogs.push(aligned);
            }
            Err(e) => reports.push(OgReport::skipped(&og.name, format!("{e:#}"))),
        }
    }
    reports.sort_by(|a, b| a.og.cmp(&b.og));

    if ogs.is_empty() {
        write_summary(outdir, started, reports, None)?;
        bail!("No gene families could be concatenated");
    }

    let matrix = Supermatrix::build(&ogs)?;
    let matrix_path = outdir.join("concatenated.fasta");
    matrix.write(&matrix_path)?;
    matrix.write_partitions(
        &outdir.join("partitions.txt"),
        &prepared.config.partition_model,
    )?;

    write_summary(
        outdir,
        started,
        reports,
        Some(SupermatrixSummary {
            path: matrix_path.clone(),
            taxa: matrix.taxa.len(),
            width: matrix.width,
            ogs: ogs.len(),
        }),
    )?;

    println!(
        r#"Concatenated {} gene families ({} taxa, {} positions) in {} seconds, see "{}""#,
        ogs.len(),
        matrix.taxa.len(),
        matrix.width,
        start.elapsed().as_secs(),
        matrix_path.display()
    );
    Ok(())
}

// --------------------------------------------------
/// Check inputs and settings, and pair every alignment with its tree
pub fn prepare(args: &SelectArgs) -> Result<Prepared> {
    for (label, dir) in [("alignments", &args.alignments), ("trees", &args.trees)] {
        if !dir.is_dir() {
            bail!(r#"Cannot find {label} directory "{}""#, dir.display());
        }
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    debug!("config = {config:#?}");

    let targets = Targets::resolve(args.targets.as_deref())?;
    debug!("targets = {targets:?}");

    let (jobs, unpaired) = pair_files(&args.alignments, &args.trees)?;
    Ok(Prepared {
        config,
        targets,
        jobs,
        unpaired,
    })
}

// --------------------------------------------------
/// Run tree work and selection for every paired OG in parallel.
/// Failures are reported, not fatal. Results keep OG name order.
pub fn select_all(prepared: &Prepared) -> Result<(Vec<SelectedOg>, Vec<OgReport>)> {
    let coverage = prepared.config.scoring.strategy();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(prepared.config.jobs.max(1))
        .build()?;

    let results: Vec<(&OgJob, Result<SelectedOg>)> = pool.install(|| {
        prepared
            .jobs
            .par_iter()
            .map(|job| (job, process_og(job, prepared, coverage.as_ref())))
            .collect()
    });

    let mut selected = vec![];
    let mut reports = prepared.unpaired.clone();
    for (job, res) in results {
        match res {
            Ok(og) => selected.push(og),
            Err(e) => reports.push(OgReport::skipped(&job.name, format!("{e:#}"))),
        }
    }

    Ok((selected, reports))
}

// --------------------------------------------------
/// Load, reroot, find clades and select for one OG
pub fn process_og(
    job: &OgJob,
    prepared: &Prepared,
    coverage: &dyn CoverageStrategy,
) -> Result<SelectedOg> {
    let text = fs::read_to_string(&job.tree)
        .map_err(|e| anyhow!("Cannot read {}: {e}", job.tree.display()))?;
    let tree = PhyloTree::from_newick(&extract_newick(&text)?)?;
    let alignment = Alignment::from_path(&job.alignment)?;
    debug!(
        "{}: {} leaves, {} aligned sequences",
        job.name,
        tree.leaf_count(tree.root()),
        alignment.len()
    );

    let (tree, rooting) = match reroot(&tree, &prepared.config.outgroups) {
        Ok((rerooted, RerootOutcome::Rerooted { group, .. })) => {
            (rerooted, group.join("/"))
        }
        Ok((tree, RerootOutcome::Unchanged)) => (tree, "original".to_string()),
        Err(e) => {
            warn!(
                "Unable to reroot the tree for {} ({e}), keeping the original root",
                job.name
            );
            (tree, "original (reroot failed)".to_string())
        }
    };

    let groups = prepared.targets.groups(tree.leaf_ids());
    let clades = find_clades(&tree, &groups);
    debug!("{}: {} clades for {} groups", job.name, clades.len(), groups.len());

    let selection = select_sequences(
        &tree,
        &alignment,
        &prepared.targets,
        &clades,
        coverage,
    )?;

    Ok(SelectedOg {
        name: job.name.clone(),
        rooting,
        selection,
    })
}

// --------------------------------------------------
/// Alignments in name order, each with its tree or a skip report
pub fn pair_files(
    alignments_dir: &Path,
    trees_dir: &Path,
) -> Result<(Vec<OgJob>, Vec<OgReport>)> {
    let tree_names: Vec<String> = list_files(trees_dir)?
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .collect();

    let mut jobs: Vec<OgJob> = vec![];
    let mut unpaired = vec![];
    for alignment in list_files(alignments_dir)? {
        let is_alignment = alignment
            .extension()
            .map_or(false, |ext| ALIGNMENT_EXTENSIONS.iter().any(|e| ext == *e));
        if !is_alignment {
            continue;
        }

        let file_name = alignment
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = alignment
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();

        // Output files are keyed by OG name, so a second file with the
        // same stem would clobber the first
        if let Some(taken) = jobs.iter().find(|job| job.name == name) {
            unpaired.push(OgReport::skipped(
                &file_name,
                format!(
                    "OG name {name} is already used by {}",
                    taken.alignment.display()
                ),
            ));
            continue;
        }

        match pair_tree(&file_name, &tree_names) {
            Ok(tree) => jobs.push(OgJob {
                name,
                tree: trees_dir.join(tree),
                alignment,
            }),
            Err(reason) => unpaired.push(OgReport::skipped(&name, reason)),
        }
    }

    Ok((jobs, unpaired))
}

// --------------------------------------------------
/// The single tree file sharing the alignment's prefix. Tries the name
/// without its extension, then the part before the first ".", then the
/// first 10 characters.
pub fn pair_tree<'a>(file_name: &str, trees: &'a [String]) -> Result<&'a str, String> {
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _)| stem);
    let first = stem.split('.').next().unwrap_or(stem);
    let short: String = file_name.chars().take(TAXON_CODE_LEN).collect();

    for prefix in [stem, first, short.as_str()] {
        let matches: Vec<&String> =
            trees.iter().filter(|tree| tree.starts_with(prefix)).collect();
        match matches[..] {
            [] => continue,
            [tree] => return Ok(tree.as_str()),
            _ => {
                return Err(format!(
                    r#"{} tree files match "{prefix}" ({}); give each alignment a tree with a unique prefix"#,
                    matches.len(),
                    matches.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
                ))
            }
        }
    }

    Err(format!("No tree file found for {file_name}"))
}

// --------------------------------------------------
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

// --------------------------------------------------
fn selected_report(og: &SelectedOg) -> OgReport {
    OgReport {
        og: og.name.clone(),
        status: OgStatus::Selected,
        rooting: Some(og.rooting.clone()),
        taxa: og.selection.len(),
        width: None,
        reason: None,
    }
}

// --------------------------------------------------
fn write_selections(path: &Path, selected: &[SelectedOg]) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_path(path)?;

    for og in selected {
        for sel in &og.selection.selections {
            let (clade_taxa, score) = match sel.reason {
                Reason::Single => (None, None),
                Reason::Clade { taxa } => (Some(taxa), None),
                Reason::Score { clade_taxa, score } => {
                    ((clade_taxa > 0).then_some(clade_taxa), Some(score))
                }
            };
            wtr.serialize(SelectionRow {
                og: &og.name,
                taxon: sel.taxon.as_str(),
                sequence: sel.id.as_str(),
                reason: sel.reason.to_string(),
                clade_taxa,
                score,
            })?;
        }
    }

    wtr.flush()?;
    Ok(())
}

// --------------------------------------------------
fn write_summary(
    outdir: &Path,
    started: chrono::DateTime<Local>,
    ogs: Vec<OgReport>,
    supermatrix: Option<SupermatrixSummary>,
) -> Result<()> {
    let summary = RunSummary {
        started: started.to_rfc3339(),
        finished: Local::now().to_rfc3339(),
        ogs,
        supermatrix,
    };
    let path = outdir.join("run-summary.json");
    fs::write(&path, serde_json::to_string_pretty(&summary)?)
        .map_err(|e| anyhow!("Cannot write {}: {e}", path.display()))?;
    Ok(())
}
