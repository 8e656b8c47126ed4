#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use ahash::AHashMap;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;

use gauge::als::{AlsSolver, SolverResult};
use gauge::anchor::{AnchorSet, RefreshPolicy};
use gauge::bank::{Bank, ConstructSource, build_construct};
use gauge::config::EngineConfig;
use gauge::dimension::{DimensionSearchResult, DimensionSelector};
use gauge::progress::{SolverProgressObserver, SolverStage};
use gauge::seed::SeedSelector;
use gauge::types::{Facet, MISSING, ObservationMatrix};
use gauge::variance::ErrorEstimator;

#[derive(Clone, Copy, ValueEnum)]
enum FacetCli {
    Rows,
    Columns,
}

impl From<FacetCli> for Facet {
    fn from(value: FacetCli) -> Self {
        match value {
            FacetCli::Rows => Facet::Rows,
            FacetCli::Columns => Facet::Columns,
        }
    }
}

#[derive(Args)]
struct FitArgs {
    /// Delimited table: header row of column keys, first column of row keys
    #[arg(value_name = "DATA_PATH")]
    data: PathBuf,

    /// Value that marks a missing cell, in addition to empty cells and "NA"
    #[arg(long, value_name = "VALUE", allow_hyphen_values = true)]
    missing: Option<f64>,

    /// TOML engine configuration; defaults are used when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Fit this many dimensions instead of searching for them
    #[arg(long, value_name = "N")]
    ndim: Option<usize>,

    /// Try several random starts and keep the most objective one
    #[arg(long)]
    seed_search: bool,

    /// Skip the EAR and standard error model
    #[arg(long)]
    no_errors: bool,

    /// Bank whose coordinates anchor the shared entities of --anchor-facet
    #[arg(long, value_name = "PATH")]
    bank: Option<PathBuf>,

    /// Facet anchored from --bank
    #[arg(long, value_enum, default_value_t = FacetCli::Columns, requires = "bank")]
    anchor_facet: FacetCli,

    /// Banked entities of --anchor-facet to re-estimate rather than hold fixed
    #[arg(long, value_delimiter = ',', value_name = "KEYS", requires = "bank")]
    refresh: Vec<String>,

    /// Write the fitted coordinates to this bank (merged into --bank when both are given)
    #[arg(long, value_name = "PATH")]
    bank_out: Option<PathBuf>,

    /// Prefix for the output tables
    #[arg(long, default_value = "gauge")]
    out_prefix: String,
}

#[derive(Args)]
struct ConstructArgs {
    /// Bank to read member coordinates from
    #[arg(value_name = "BANK_PATH")]
    bank: PathBuf,

    /// Facet the members belong to
    #[arg(long, value_enum, default_value_t = FacetCli::Columns)]
    facet: FacetCli,

    /// Comma-separated member keys
    #[arg(long, value_delimiter = ',', required = true, value_name = "KEYS")]
    members: Vec<String>,

    /// Name under which the construct is scored and stored
    #[arg(long)]
    label: String,

    /// Store the construct in the bank and write it here
    #[arg(long, value_name = "PATH")]
    bank_out: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "gauge",
    about = "Coordinate decomposition and dimensionality selection for sparse two-facet data",
    long_about = "Decomposes a persons-by-items style matrix into low-dimensional coordinates, \
                 selects the dimensionality that best predicts withheld cells, estimates \
                 per-cell error, and maintains a bank of coordinates for anchoring later fits."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit coordinates to a data table
    #[command(about = "Fit coordinates (outputs: estimates, coordinates, EAR and SE tables)")]
    Fit(FitArgs),

    /// Build a construct from banked entities and score it
    #[command(about = "Build and score a construct from a bank (outputs: <label>.scores.tsv)")]
    Construct(ConstructArgs),

    /// Write the default engine configuration
    #[command(about = "Write the default engine configuration as TOML")]
    Config {
        #[arg(value_name = "OUTPUT_PATH", default_value = "gauge.toml")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Construct(args)) => run_construct(args),
        Some(Commands::Config { output }) => EngineConfig::default()
            .save(&output)
            .map(|()| println!("Default configuration written to: {}", output.display()))
            .map_err(Into::into),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

/// One progress bar per active stage.
#[derive(Default)]
struct BarProgress {
    bars: AHashMap<SolverStage, ProgressBar>,
}

impl SolverProgressObserver for BarProgress {
    fn on_stage_start(&mut self, stage: SolverStage, total: usize) {
        let message = format!("{stage}: {}", stage.unit());
        self.bars
            .insert(stage, create_progress_bar(total as u64, &message));
    }

    fn on_stage_advance(&mut self, stage: SolverStage, done: usize) {
        if let Some(bar) = self.bars.get(&stage) {
            bar.set_position(done as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: SolverStage) {
        if let Some(bar) = self.bars.remove(&stage) {
            bar.finish_and_clear();
        }
    }
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            EngineConfig::from_toml_file(path)?
        }
        None => EngineConfig::default(),
    };

    println!("Loading data from: {}", args.data.display());
    let matrix = load_matrix(&args.data, args.missing)?;
    println!(
        "Loaded {} rows x {} columns ({} observed cells)",
        matrix.n_rows(),
        matrix.n_cols(),
        matrix.observed_count()
    );

    let bank = args.bank.as_deref().map(Bank::load_from_path).transpose()?;
    let anchor_facet = Facet::from(args.anchor_facet);
    let mut progress = BarProgress::default();

    let mut search: Option<DimensionSearchResult> = None;
    let ndim = match (args.ndim, &bank) {
        (Some(ndim), _) => ndim,
        (None, Some(bank)) => {
            println!("Using the bank's dimensionality: {}", bank.ndim);
            bank.ndim
        }
        (None, None) => {
            let result = DimensionSelector::new(&config.search, &config.solver)
                .with_observer(&mut progress)
                .run(&matrix)?;
            for warning in &result.warnings {
                log::warn!("{warning}");
            }
            println!("Selected dimensionality: {}", result.ndim);
            let ndim = result.ndim;
            search = Some(result);
            ndim
        }
    };
    let solver = config.solver.with_ndim(ndim);

    let anchors = match &bank {
        Some(bank) => {
            let unknown: Vec<&String> = args
                .refresh
                .iter()
                .filter(|key| !bank.contains(anchor_facet, key))
                .collect();
            if !unknown.is_empty() {
                return Err(format!("--refresh names entities missing from the bank: {unknown:?}").into());
            }
            let mut facet_anchors = bank.anchors_for_matrix(anchor_facet, &matrix, ndim)?;
            if !args.refresh.is_empty() {
                facet_anchors = facet_anchors
                    .with_refresh(RefreshPolicy::Only(args.refresh.iter().cloned().collect()));
            }
            AnchorSet::for_facet(anchor_facet, facet_anchors)
        }
        None => AnchorSet::default(),
    };

    let fit = match &search {
        // The search already produced an unmasked fit at the chosen D.
        Some(result) if !args.seed_search && !result.homogenized => result.fit.clone(),
        _ if args.seed_search => {
            let outcome = SeedSelector::new(&config.seed, &solver)
                .with_anchors(&anchors)
                .with_observer(&mut progress)
                .run(&matrix)?;
            println!(
                "Best of {} starts: seed {} (objectivity {:.4})",
                outcome.attempts.len(),
                outcome.best_seed,
                outcome.best.stats.objectivity.unwrap_or(f64::NAN)
            );
            outcome.fit
        }
        _ => AlsSolver::new(&solver)
            .with_anchors(&anchors)
            .with_observer(&mut progress)
            .run(&matrix)?,
    };
    for warning in &fit.warnings {
        log::warn!("{warning}");
    }
    println!(
        "Fit {} dimensions in {} sweeps (converged: {})",
        fit.ndim,
        fit.sweeps_used(),
        fit.converged
    );

    let errors = if args.no_errors {
        None
    } else {
        Some(
            ErrorEstimator::new(&config.variance, &solver)
                .with_observer(&mut progress)
                .run(&matrix, &fit)?,
        )
    };

    let prefix = &args.out_prefix;
    write_matrix_tsv(
        &format!("{prefix}.estimates.tsv"),
        &fit.row_keys,
        &fit.col_keys,
        &fit.estimates,
    )?;
    write_coordinates_tsv(&format!("{prefix}.rows.tsv"), &fit, Facet::Rows)?;
    write_coordinates_tsv(&format!("{prefix}.cols.tsv"), &fit, Facet::Columns)?;
    if let Some(errors) = &errors {
        write_matrix_tsv(
            &format!("{prefix}.ear.tsv"),
            &errors.row_keys,
            &errors.col_keys,
            &errors.ear,
        )?;
        write_matrix_tsv(
            &format!("{prefix}.se.tsv"),
            &errors.row_keys,
            &errors.col_keys,
            &errors.se,
        )?;
    }
    if let Some(result) = &search {
        write_dimension_table(&format!("{prefix}.dimensions.tsv"), result)?;
    }
    println!("Results written with prefix: {prefix}");

    if let Some(path) = &args.bank_out {
        let bank = match bank {
            Some(mut bank) => {
                bank.merge_fit(&fit, errors.as_ref())?;
                bank
            }
            None => Bank::from_fit(&fit, errors.as_ref())?,
        };
        bank.save_to_path(path)?;
        println!("Bank saved to: {}", path.display());
    }

    Ok(())
}

fn run_construct(args: ConstructArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut bank = Bank::load_from_path(&args.bank)?;
    let facet = Facet::from(args.facet);
    let construct = build_construct(
        &ConstructSource::Bank(&bank),
        facet,
        &args.members,
        args.label.clone(),
    )?;
    let scores = construct.score(&ConstructSource::Bank(&bank));

    let output_path = format!("{}.scores.tsv", args.label);
    let mut file = BufWriter::new(File::create(&output_path)?);
    writeln!(file, "{}\tscore\tear\tse", facet.opposite())?;
    for (idx, key) in scores.keys.iter().enumerate() {
        let error = |values: &Option<Vec<f64>>| values.as_ref().map_or(MISSING, |v| v[idx]);
        writeln!(
            file,
            "{key}\t{}\t{}\t{}",
            format_value(scores.estimates[idx]),
            format_value(error(&scores.ear)),
            format_value(error(&scores.se))
        )?;
    }
    file.flush()?;
    println!("Construct scores saved to: {output_path}");

    if let Some(path) = &args.bank_out {
        bank.store_construct(&construct)?;
        bank.save_to_path(path)?;
        println!("Bank with construct '{}' saved to: {}", construct.label, path.display());
    }
    Ok(())
}

/// Reads a delimited table. Tab-delimited when the extension is `.tsv` or `.txt`,
/// comma-delimited otherwise.
fn load_matrix(
    path: &Path,
    marker: Option<f64>,
) -> Result<ObservationMatrix, Box<dyn std::error::Error>> {
    let delimiter = match path.extension().and_then(|ext| ext.to_str()) {
        Some("tsv" | "txt") => b'\t',
        _ => b',',
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)?;

    let col_keys: Vec<String> = reader
        .headers()?
        .iter()
        .skip(1)
        .map(|key| key.trim().to_string())
        .collect();

    let mut row_keys = Vec::new();
    let mut values = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != col_keys.len() + 1 {
            return Err(format!(
                "Row {} has {} fields; expected {}",
                line + 2,
                record.len(),
                col_keys.len() + 1
            )
            .into());
        }
        row_keys.push(record[0].trim().to_string());
        for field in record.iter().skip(1) {
            let field = field.trim();
            let value = if field.is_empty() || field.eq_ignore_ascii_case("na") {
                MISSING
            } else {
                field.parse::<f64>().map_err(|e| {
                    format!("Row {}: could not parse '{field}' as a number: {e}", line + 2)
                })?
            };
            values.push(value);
        }
    }

    let values = Array2::from_shape_vec((row_keys.len(), col_keys.len()), values)?;
    let matrix = match marker {
        Some(marker) => ObservationMatrix::with_marker(values, row_keys, col_keys, marker)?,
        None => ObservationMatrix::new(values, row_keys, col_keys)?,
    };
    Ok(matrix)
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NA".to_string()
    } else {
        value.to_string()
    }
}

fn write_matrix_tsv(
    output_path: &str,
    row_keys: &[String],
    col_keys: &[String],
    values: &Array2<f64>,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);
    writeln!(file, "id\t{}", col_keys.iter().join("\t"))?;
    for (key, row) in row_keys.iter().zip(values.rows()) {
        writeln!(file, "{key}\t{}", row.iter().map(|v| format_value(*v)).join("\t"))?;
    }
    file.flush()
}

fn write_coordinates_tsv(
    output_path: &str,
    fit: &SolverResult,
    facet: Facet,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);
    writeln!(
        file,
        "id\t{}\tobservations\tanchored",
        (1..=fit.ndim).map(|k| format!("dim{k}")).join("\t")
    )?;
    let coords = fit.coords(facet);
    for (idx, key) in fit.keys(facet).iter().enumerate() {
        writeln!(
            file,
            "{key}\t{}\t{}\t{}",
            coords.row(idx).iter().map(|v| format_value(*v)).join("\t"),
            fit.observations(facet)[idx],
            fit.anchored(facet)[idx]
        )?;
    }
    file.flush()
}

fn write_dimension_table(
    output_path: &str,
    result: &DimensionSearchResult,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);
    writeln!(file, "ndim\taccuracy\tstability\tobjectivity\tsweeps\tconverged\tselected")?;
    for row in &result.table {
        let optional = |v: Option<f64>| format_value(v.unwrap_or(f64::NAN));
        writeln!(
            file,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.ndim,
            optional(row.accuracy),
            optional(row.stability),
            optional(row.objectivity),
            row.sweeps,
            row.converged,
            row.ndim == result.ndim
        )?;
    }
    file.flush()
}
