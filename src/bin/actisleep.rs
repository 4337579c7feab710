//! actisleep CLI - Command-line interface for actisleep
//!
//! Commands:
//! - score: Classify an epoch series as sleep/wake
//! - nonwear: Detect nonwear periods in an epoch series
//! - import-diary: Create periods from sleep diary entries in a workspace
//! - export: Export sleep metrics rows for files and dates in a workspace
//! - doctor: Diagnose workspace and configuration
//! - config: Print the default engine configuration
//!
//! A workspace directory holds `epochs/<file_id>.json` (an epoch series) and
//! `days/<file_id>/<date>.json` (persisted periods and metrics).

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use actisleep::persistence::{EpochProvider, PersistedDay, RowStore};
use actisleep::types::{AnalysisWindow, DateRange, SleepState, WearState};
use actisleep::{
    parse_diary, AlgorithmId, ColumnSet, ComputeError, EngineConfig, EpochClassifier,
    EpochSeries, FailedUnit, NonwearDetector, SleepEngine, ACTISLEEP_VERSION,
};

/// actisleep - Sleep-period detection and metrics for actigraphy data
#[derive(Parser)]
#[command(name = "actisleep")]
#[command(version = ACTISLEEP_VERSION)]
#[command(about = "Score actigraphy epochs and export sleep metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify each epoch of a series as sleep or wake
    Score {
        /// Epoch series JSON (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Engine config JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured algorithm
        #[arg(long)]
        algorithm: Option<AlgorithmArg>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,
    },

    /// Detect nonwear periods in an epoch series
    Nonwear {
        /// Epoch series JSON (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Engine config JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,
    },

    /// Create periods from sleep diary entries and save them to the workspace
    ImportDiary {
        /// Workspace directory
        #[arg(short, long)]
        workspace: PathBuf,

        /// Diary JSON (array of entries)
        #[arg(short, long)]
        diary: PathBuf,

        /// Also add detected nonwear periods for each imported day
        #[arg(long)]
        detect_nonwear: bool,

        /// Engine config JSON
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Export sleep metrics rows
    Export {
        /// Workspace directory
        #[arg(short, long)]
        workspace: PathBuf,

        /// File ids to export (repeatable)
        #[arg(short, long = "file", required = true)]
        files: Vec<String>,

        /// First analysis date (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last analysis date, inclusive (defaults to --from)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Comma-separated metric columns (defaults to all)
        #[arg(long)]
        columns: Option<String>,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Engine config JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,
    },

    /// Diagnose workspace and configuration
    Doctor {
        /// Workspace directory to check
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Engine config JSON to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default engine configuration
    Config,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one record per line)
    Ndjson,
    /// JSON array of records
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    Sadeh,
    SadehActilife,
    ColeKripke,
    ColeKripkeActilife,
}

impl From<AlgorithmArg> for AlgorithmId {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Sadeh => AlgorithmId::Sadeh,
            AlgorithmArg::SadehActilife => AlgorithmId::SadehActiLife,
            AlgorithmArg::ColeKripke => AlgorithmId::ColeKripke,
            AlgorithmArg::ColeKripkeActilife => AlgorithmId::ColeKripkeActiLife,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), SleepCliError> {
    match cli.command {
        Commands::Score {
            input,
            output,
            config,
            algorithm,
            output_format,
        } => cmd_score(&input, &output, config.as_deref(), algorithm, output_format),

        Commands::Nonwear {
            input,
            output,
            config,
            output_format,
        } => cmd_nonwear(&input, &output, config.as_deref(), output_format),

        Commands::ImportDiary {
            workspace,
            diary,
            detect_nonwear,
            config,
        } => cmd_import_diary(&workspace, &diary, detect_nonwear, config.as_deref()),

        Commands::Export {
            workspace,
            files,
            from,
            to,
            columns,
            output,
            config,
            output_format,
        } => cmd_export(
            &workspace,
            &files,
            DateRange::new(from, to.unwrap_or(from))?,
            columns.as_deref(),
            &output,
            config.as_deref(),
            output_format,
        ),

        Commands::Doctor {
            workspace,
            config,
            json,
        } => cmd_doctor(workspace.as_deref(), config.as_deref(), json),

        Commands::Config => {
            println!("{}", EngineConfig::default().to_json()?);
            Ok(())
        }
    }
}

fn cmd_score(
    input: &Path,
    output: &Path,
    config: Option<&Path>,
    algorithm: Option<AlgorithmArg>,
    output_format: OutputFormat,
) -> Result<(), SleepCliError> {
    let mut config = load_config(config)?;
    if let Some(algorithm) = algorithm {
        config.algorithm.algorithm = algorithm.into();
    }

    let series = read_series(input)?;
    let result = EpochClassifier::score(&series, &config.algorithm);

    let records: Vec<EpochScore> = series
        .epochs()
        .iter()
        .zip(&result.states)
        .map(|(epoch, state)| EpochScore {
            timestamp: epoch.timestamp,
            algorithm: result.algorithm,
            state: *state,
        })
        .collect();

    write_output(output, &format_output(&records, &output_format)?)
}

fn cmd_nonwear(
    input: &Path,
    output: &Path,
    config: Option<&Path>,
    output_format: OutputFormat,
) -> Result<(), SleepCliError> {
    let config = load_config(config)?;
    let series = read_series(input)?;

    let mask = NonwearDetector::detect(&series, &config.nonwear);
    let flagged = mask.iter().filter(|m| **m == WearState::Nonwear).count();
    let records: Vec<NonwearRecord> = NonwearDetector::detect_periods(&series, &config.nonwear)
        .into_iter()
        .map(|(start, end)| NonwearRecord {
            start,
            end,
            minutes: (end - start).num_minutes(),
        })
        .collect();
    info!("{} of {} epochs flagged as nonwear", flagged, mask.len());

    write_output(output, &format_output(&records, &output_format)?)
}

fn cmd_import_diary(
    workspace: &Path,
    diary: &Path,
    detect_nonwear: bool,
    config: Option<&Path>,
) -> Result<(), SleepCliError> {
    let config = load_config(config)?;
    let entries = parse_diary(&read_input(diary)?)?;
    let mut engine = SleepEngine::new(
        WorkspaceEpochs::new(workspace),
        WorkspaceRows::new(workspace),
        config,
    )?;

    let import = engine.import_diary(&entries, detect_nonwear);
    let report = ImportReport {
        days: import
            .days
            .into_iter()
            .map(|day| ImportSummary {
                file_id: day.file_id,
                date: day.date,
                created: day.diary.created.len(),
                already_present: day.diary.existing.len(),
                detected_nonwear: day.detected_nonwear.len(),
                skipped: day.diary.skipped,
            })
            .collect(),
        failed_count: import.failed_units.len(),
        failed_units: import.failed_units,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed_count > 0 {
        Err(SleepCliError::ImportIncomplete(report.failed_count))
    } else {
        Ok(())
    }
}

fn cmd_export(
    workspace: &Path,
    files: &[String],
    range: DateRange,
    columns: Option<&str>,
    output: &Path,
    config: Option<&Path>,
    output_format: OutputFormat,
) -> Result<(), SleepCliError> {
    let config = load_config(config)?;
    let columns = match columns {
        Some(list) => ColumnSet::from_names(&list.split(',').collect::<Vec<_>>())?,
        None => ColumnSet::all(),
    };
    let engine = SleepEngine::new(
        WorkspaceEpochs::new(workspace),
        WorkspaceRows::new(workspace),
        config,
    )?;

    let export = engine.export_rows(files, range, &columns);
    write_output(output, &format_output(&export.rows, &output_format)?)?;

    let summary = ExportSummary {
        run_id: export.run_id.to_string(),
        rows: export.rows.len(),
        succeeded_units: export.succeeded_units,
        failed_count: export.failed_count(),
        failed_units: export
            .failed_units
            .iter()
            .map(|u| format!("{} {}: {}", u.file_id, u.date, u.error))
            .collect(),
        warnings: export.warnings.iter().map(|w| w.message()).collect(),
    };
    eprintln!("{}", serde_json::to_string(&summary)?);

    if export.failed_count() > 0 {
        Err(SleepCliError::ExportIncomplete(export.failed_count()))
    } else {
        Ok(())
    }
}

fn cmd_doctor(
    workspace: Option<&Path>,
    config: Option<&Path>,
    json: bool,
) -> Result<(), SleepCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("actisleep version {}", ACTISLEEP_VERSION),
    });

    if let Some(config_path) = config {
        checks.push(match load_config(Some(config_path)) {
            Ok(config) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "Config valid ({}, day starts {:02}:00)",
                    config.algorithm.fingerprint(),
                    config.day_start_hour
                ),
            },
            Err(e) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: CliError::from(e).message,
            },
        });
    }

    if let Some(workspace) = workspace {
        checks.push(check_workspace_dir(workspace, "epochs", CheckStatus::Error));
        checks.push(check_workspace_dir(workspace, "days", CheckStatus::Warning));
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (pass --input <file>)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (--input - ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        version: ACTISLEEP_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("actisleep Doctor Report");
        println!("=======================");
        println!("Version: {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(SleepCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn check_workspace_dir(workspace: &Path, name: &str, missing: CheckStatus) -> DoctorCheck {
    let dir = workspace.join(name);
    match fs::read_dir(&dir) {
        Ok(entries) => DoctorCheck {
            name: format!("workspace_{name}"),
            status: CheckStatus::Ok,
            message: format!("{} ({} entries)", dir.display(), entries.count()),
        },
        Err(e) => DoctorCheck {
            name: format!("workspace_{name}"),
            status: missing,
            message: format!("Cannot read {}: {}", dir.display(), e),
        },
    }
}

// Workspace storage

/// Epoch series stored as `epochs/<file_id>.json`
struct WorkspaceEpochs {
    dir: PathBuf,
}

impl WorkspaceEpochs {
    fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join("epochs"),
        }
    }
}

impl EpochProvider for WorkspaceEpochs {
    fn load(&self, file_id: &str, window: &AnalysisWindow) -> Result<EpochSeries, ComputeError> {
        let path = self.dir.join(format!("{file_id}.json"));
        let json = fs::read_to_string(&path)
            .map_err(|e| ComputeError::Storage(format!("{}: {}", path.display(), e)))?;
        let series: EpochSeries = serde_json::from_str(&json)?;
        debug!("loaded {} epochs from {}", series.len(), path.display());
        Ok(series.restricted_to(window))
    }
}

/// Persisted days stored as `days/<file_id>/<date>.json`
struct WorkspaceRows {
    dir: PathBuf,
}

impl WorkspaceRows {
    fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join("days"),
        }
    }

    fn path(&self, file_id: &str, date: NaiveDate) -> PathBuf {
        self.dir.join(file_id).join(format!("{date}.json"))
    }
}

impl RowStore for WorkspaceRows {
    fn read(&self, file_id: &str, date: NaiveDate) -> Result<Option<PersistedDay>, ComputeError> {
        let path = self.path(file_id, date);
        match fs::read_to_string(&path) {
            Ok(json) => PersistedDay::from_json(&json).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ComputeError::Storage(format!("{}: {}", path.display(), e))),
        }
    }

    fn write(
        &mut self,
        file_id: &str,
        date: NaiveDate,
        day: PersistedDay,
    ) -> Result<(), ComputeError> {
        let path = self.path(file_id, date);
        let storage = |e: io::Error| ComputeError::Storage(format!("{}: {}", path.display(), e));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(storage)?;
        }
        // Write then rename so readers never see a partial day
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, day.to_json()?).map_err(storage)?;
        fs::rename(&tmp, &path).map_err(storage)?;
        Ok(())
    }
}

// Helper functions

fn load_config(path: Option<&Path>) -> Result<EngineConfig, SleepCliError> {
    match path {
        Some(path) => Ok(EngineConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(EngineConfig::default()),
    }
}

fn read_input(input: &Path) -> Result<String, SleepCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn read_series(input: &Path) -> Result<EpochSeries, SleepCliError> {
    let series: EpochSeries = serde_json::from_str(&read_input(input)?)?;
    if series.is_empty() {
        return Err(SleepCliError::NoEpochs);
    }
    Ok(series)
}

fn write_output(output: &Path, data: &str) -> Result<(), SleepCliError> {
    if output.to_string_lossy() == "-" {
        let mut stdout = io::stdout();
        stdout.write_all(data.as_bytes())?;
        stdout.flush()?;
    } else {
        fs::write(output, data)?;
    }
    Ok(())
}

fn format_output<T: serde::Serialize>(
    records: &[T],
    format: &OutputFormat,
) -> Result<String, SleepCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut out = String::new();
            for record in records {
                out.push_str(&serde_json::to_string(record)?);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Json => Ok(serde_json::to_string(records)? + "\n"),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(records)? + "\n"),
    }
}

// Error types

#[derive(Debug)]
enum SleepCliError {
    Io(io::Error),
    Compute(ComputeError),
    Json(serde_json::Error),
    NoEpochs,
    ImportIncomplete(usize),
    ExportIncomplete(usize),
    DoctorFailed,
}

impl From<io::Error> for SleepCliError {
    fn from(e: io::Error) -> Self {
        SleepCliError::Io(e)
    }
}

impl From<ComputeError> for SleepCliError {
    fn from(e: ComputeError) -> Self {
        SleepCliError::Compute(e)
    }
}

impl From<serde_json::Error> for SleepCliError {
    fn from(e: serde_json::Error) -> Self {
        SleepCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<SleepCliError> for CliError {
    fn from(e: SleepCliError) -> Self {
        match e {
            SleepCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            SleepCliError::Compute(e) => {
                let (code, hint) = match &e {
                    ComputeError::Validation(_) => ("VALIDATION_ERROR", "Check input values"),
                    ComputeError::IncompleteData(_) => {
                        ("INCOMPLETE_DATA", "The requested window has epoch gaps")
                    }
                    ComputeError::OutOfRangeBoundary { .. } => (
                        "OUT_OF_RANGE",
                        "Boundaries must fall inside the recorded data",
                    ),
                    ComputeError::EpochDurationMismatch { .. } => (
                        "EPOCH_DURATION_MISMATCH",
                        "Re-import the file; saved periods use another epoch length",
                    ),
                    ComputeError::UnknownPeriod(_) => ("UNKNOWN_PERIOD", "Reload the day"),
                    ComputeError::Json(_) => ("JSON_ERROR", "Check JSON syntax"),
                    ComputeError::Storage(_) => {
                        ("STORAGE_ERROR", "Run 'actisleep doctor --workspace <dir>'")
                    }
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            SleepCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            SleepCliError::NoEpochs => CliError {
                code: "NO_EPOCHS".to_string(),
                message: "No epochs found in input".to_string(),
                hint: Some("Ensure the series has at least one epoch".to_string()),
            },
            SleepCliError::ImportIncomplete(count) => CliError {
                code: "IMPORT_INCOMPLETE".to_string(),
                message: format!("{} file/date units failed to import", count),
                hint: Some("See failed_units in the import report".to_string()),
            },
            SleepCliError::ExportIncomplete(count) => CliError {
                code: "EXPORT_INCOMPLETE".to_string(),
                message: format!("{} file/date units failed to export", count),
                hint: Some("See failed_units in the export summary".to_string()),
            },
            SleepCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct EpochScore {
    timestamp: DateTime<Utc>,
    algorithm: AlgorithmId,
    state: SleepState,
}

#[derive(serde::Serialize)]
struct NonwearRecord {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    minutes: i64,
}

#[derive(serde::Serialize)]
struct ImportSummary {
    file_id: String,
    date: NaiveDate,
    created: usize,
    already_present: usize,
    detected_nonwear: usize,
    skipped: Vec<String>,
}

#[derive(serde::Serialize)]
struct ImportReport {
    days: Vec<ImportSummary>,
    failed_count: usize,
    failed_units: Vec<FailedUnit>,
}

#[derive(serde::Serialize)]
struct ExportSummary {
    run_id: String,
    rows: usize,
    succeeded_units: usize,
    failed_count: usize,
    failed_units: Vec<String>,
    warnings: Vec<String>,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
