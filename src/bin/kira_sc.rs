use std::fs;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use kira_sc_reader::archive;
use kira_sc_reader::config;
use kira_sc_reader::dataset::artifactdb::{DATASET_NAME_KEY, DATASET_PREFIX_KEY};
use kira_sc_reader::dataset::{Dataset, DatasetFile, Persistable, ReaderMode};
use kira_sc_reader::domain::FormatTag;
use kira_sc_reader::engine::Engines;
use kira_sc_reader::error::ScError;
use kira_sc_reader::file_ref::FileRef;
use kira_sc_reader::output::{JsonOutput, LoadReport};
use kira_sc_reader::project;
use kira_sc_reader::registry;
use kira_sc_reader::serialize::{self, EmbeddedBuffer, FileStore};

#[derive(Parser)]
#[command(name = "kira-sc")]
#[command(about = "Inspect single-cell datasets: 10X HDF5, H5AD, Matrix Market, RDS and zipped projects")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Print features, cells and assay names as JSON")]
    Summary(InputArgs),
    #[command(about = "Print file names, sizes and options")]
    Abbreviate(InputArgs),
    #[command(about = "Load matrices and print their dimensions")]
    Load(InputArgs),
    #[command(about = "Embed the input files in one buffer and print the reader record")]
    Serialize(SerializeArgs),
    #[command(about = "List the experiments inside a zipped project")]
    Search(SearchArgs),
}

#[derive(Args)]
struct InputArgs {
    #[arg(long)]
    format: FormatTag,

    /// Read analysis results instead of raw counts.
    #[arg(long)]
    result: bool,

    /// JSON file with reader options.
    #[arg(long)]
    options: Option<String>,

    /// Experiment inside a zipped project (document name or directory prefix).
    #[arg(long)]
    dataset: Option<String>,

    /// Input files; Matrix Market takes the matrix, then optional feature
    /// and barcode files.
    #[arg(required = true)]
    files: Vec<String>,
}

#[derive(Args)]
struct SerializeArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Where to write the concatenated file bodies.
    #[arg(long)]
    out: String,
}

#[derive(Args)]
struct SearchArgs {
    #[arg(long)]
    format: FormatTag,

    file: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ScError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ScError) -> u8 {
    match error {
        ScError::FormatMismatch(_) | ScError::Config(_) | ScError::InvalidFile(_) => 2,
        ScError::SchemaUnknown(_)
        | ScError::RequiredFieldMissing(_)
        | ScError::DimensionMismatch(_)
        | ScError::SelectorInvalid(_)
        | ScError::DelayedUnsupported(_) => 3,
        ScError::Resource(_) | ScError::Filesystem(_) | ScError::Archive(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Summary(args) => {
            let mut reader = open_reader(&args)?;
            let summary = reader.summary(false)?;
            JsonOutput::print_summary(&summary).into_diagnostic()
        }
        Commands::Abbreviate(args) => {
            let reader = open_reader(&args)?;
            JsonOutput::print_abbreviated(&reader.abbreviate()?).into_diagnostic()
        }
        Commands::Load(args) => {
            let mut reader = open_reader(&args)?;
            let loaded = reader.load(false)?;
            let report = LoadReport::new(&loaded);
            loaded.free()?;
            JsonOutput::print_load(&report).into_diagnostic()
        }
        Commands::Serialize(args) => {
            let reader = open_reader(&args.input)?;
            let mut buffer = EmbeddedBuffer::new();
            let record = serialize::serialize_dataset(reader.as_ref(), &mut FileStore::Embedded(&mut buffer))?;
            let out = Utf8PathBuf::from(args.out);
            fs::write(&out, buffer.as_bytes())
                .map_err(|err| ScError::Filesystem(format!("write {out}: {err}")))?;
            tracing::info!(path = %out, bytes = buffer.as_bytes().len(), "wrote embedded files");
            JsonOutput::print_serialized(&record).into_diagnostic()
        }
        Commands::Search(args) => {
            let file = FileRef::from_path(Utf8PathBuf::from(args.file));
            let shared = archive::open_archive(&file)?;
            let found = match args.format {
                FormatTag::ZippedArtifactdb => project::search_zipped_artifactdb(&shared)?,
                FormatTag::ZippedAlabaster => project::search_zipped_alabaster(&shared)?,
                other => {
                    return Err(ScError::FormatMismatch(format!("{other} is not a zipped project format")).into());
                }
            };
            let listing: Map<String, Value> = found
                .iter()
                .map(|(name, dims)| (name.to_string(), serde_json::json!([dims.rows, dims.columns])))
                .collect();
            println!("{}", Value::Object(listing));
            Ok(())
        }
    }
}

fn open_reader(args: &InputArgs) -> Result<Box<dyn Persistable>, ScError> {
    let mode = if args.result {
        ReaderMode::Result
    } else {
        ReaderMode::Dataset
    };
    let mut options = match &args.options {
        Some(path) => config::read_options_file(&Utf8PathBuf::from(path))?,
        None => Value::Object(Map::new()),
    };
    if let Some(name) = &args.dataset {
        let key = match args.format {
            FormatTag::ZippedArtifactdb => DATASET_NAME_KEY,
            FormatTag::ZippedAlabaster => DATASET_PREFIX_KEY,
            other => return Err(ScError::Config(format!("--dataset does not apply to {other}"))),
        };
        if let Value::Object(map) = &mut options {
            map.insert(key.to_string(), Value::String(name.clone()));
        }
    }
    let files = input_files(args.format, &args.files)?;
    registry::unserialize(args.format, mode, files, &options, Engines::reference())
}

fn input_files(format: FormatTag, paths: &[String]) -> Result<Vec<DatasetFile>, ScError> {
    let roles: &[&str] = match format {
        FormatTag::TenxHdf5 | FormatTag::H5ad => &["h5"],
        FormatTag::MatrixMarket => &["mtx", "genes", "annotations"],
        FormatTag::SummarizedExperiment => &["rds"],
        FormatTag::ZippedArtifactdb | FormatTag::ZippedAlabaster => &["zip"],
    };
    if paths.len() > roles.len() {
        return Err(ScError::FormatMismatch(format!(
            "{format} takes at most {} files, got {}",
            roles.len(),
            paths.len()
        )));
    }
    Ok(roles
        .iter()
        .zip(paths)
        .map(|(role, path)| DatasetFile::new(*role, FileRef::from_path(Utf8PathBuf::from(path.as_str()))))
        .collect())
}
