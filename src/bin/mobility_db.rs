use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use mobility_db::catalog::{CatalogClient, MobilityCatalogClient};
use mobility_db::client::{DownloadOptions, MobilityClient, NopCatalog};
use mobility_db::csv_catalog::CsvCatalog;
use mobility_db::domain::{ProviderId, ProviderInfo};
use mobility_db::error::MobilityError;
use mobility_db::external::{self, ImportOptions};
use mobility_db::metadata::MissingPathPolicy;

#[derive(Parser)]
#[command(name = "mobility-db")]
#[command(about = "Download and manage GTFS datasets from the Mobility Database")]
#[command(version, author)]
struct Cli {
    /// Directory where datasets and their metadata are stored.
    #[arg(long, global = true, default_value = "mobility_datasets")]
    data_dir: Utf8PathBuf,

    /// Drop records whose extracted contents are missing instead of flagging them.
    #[arg(long, global = true)]
    prune_missing: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search catalog providers")]
    Providers(ProvidersArgs),
    #[command(about = "Download the latest dataset for a provider")]
    Download(DownloadArgs),
    #[command(about = "Import an external GTFS zip")]
    Import(ImportArgs),
    #[command(about = "List downloaded datasets")]
    List,
    #[command(about = "Delete a downloaded dataset")]
    Delete(DeleteArgs),
}

#[derive(Args)]
struct ProvidersArgs {
    /// Two-letter ISO country code, e.g. HU.
    #[arg(long)]
    country: Option<String>,

    /// Provider name or part of it (case-insensitive).
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct DownloadArgs {
    provider_id: String,

    /// Fetch from the provider's own endpoint instead of the hosted mirror.
    #[arg(long)]
    direct: bool,
}

#[derive(Args)]
struct ImportArgs {
    zip: Utf8PathBuf,

    /// Reuse an existing external provider id (e.g. ext-1).
    #[arg(long)]
    provider_id: Option<String>,

    /// Provider name; otherwise taken from agency.txt.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct DeleteArgs {
    provider_id: String,

    /// Specific dataset id; defaults to the provider's newest dataset.
    #[arg(long)]
    dataset: Option<String>,

    /// Delete every dataset of this provider.
    #[arg(long)]
    all: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<MobilityError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MobilityError) -> u8 {
    match error {
        MobilityError::RecordNotFound(_) | MobilityError::NoDataset(_) => 2,
        MobilityError::CatalogHttp(_)
        | MobilityError::CatalogStatus { .. }
        | MobilityError::TokenRefresh(_)
        | MobilityError::Download(_) => 3,
        MobilityError::LockTimeout { .. } => 4,
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
    let policy = if cli.prune_missing {
        MissingPathPolicy::Prune
    } else {
        MissingPathPolicy::Flag
    };

    match cli.command {
        Commands::Providers(args) => run_providers(args),
        Commands::Download(args) => run_download(args, cli.data_dir, policy),
        Commands::Import(args) => run_import(args, cli.data_dir, policy),
        Commands::List => run_list(cli.data_dir, policy),
        Commands::Delete(args) => run_delete(args, cli.data_dir, policy),
    }
}

/// Remote catalog when a refresh token is configured, CSV listing otherwise.
fn catalog_with_fallback() -> miette::Result<Box<dyn CatalogClient>> {
    match MobilityCatalogClient::new(None) {
        Ok(remote) => Ok(Box::new(remote)),
        Err(MobilityError::MissingToken) => {
            eprintln!("no refresh token configured, falling back to the CSV catalog");
            Ok(Box::new(CsvCatalog::new().into_diagnostic()?))
        }
        Err(err) => Err(err).into_diagnostic(),
    }
}

fn run_providers(args: ProvidersArgs) -> miette::Result<()> {
    let catalog = catalog_with_fallback()?;
    let providers = match (&args.country, &args.name) {
        (Some(country), _) => catalog.providers_by_country(country).into_diagnostic()?,
        (None, Some(name)) => catalog.providers_by_name(name).into_diagnostic()?,
        (None, None) => {
            return Err(miette::Report::msg("pass --country or --name"));
        }
    };
    if providers.is_empty() {
        println!("no providers found");
        return Ok(());
    }
    for provider in providers {
        print_provider(&provider);
    }
    Ok(())
}

fn print_provider(provider: &ProviderInfo) {
    let downloadable = provider
        .latest_dataset
        .as_ref()
        .and_then(|dataset| dataset.hosted_url.as_ref())
        .is_some()
        || provider
            .source_info
            .as_ref()
            .and_then(|info| info.producer_url.as_ref())
            .is_some();
    println!(
        "{}  {}  {}",
        provider.id,
        provider.display_name(),
        if downloadable { "" } else { "(no download url)" }
    );
}

fn run_download(
    args: DownloadArgs,
    data_dir: Utf8PathBuf,
    policy: MissingPathPolicy,
) -> miette::Result<()> {
    let provider_id: ProviderId = args.provider_id.parse().into_diagnostic()?;
    let catalog = catalog_with_fallback()?;
    let mut client = MobilityClient::with_policy(data_dir, catalog, policy).into_diagnostic()?;
    let path = client
        .download_latest_dataset(
            &provider_id,
            DownloadOptions {
                use_direct_source: args.direct,
            },
        )
        .into_diagnostic()?;
    println!("{path}");
    Ok(())
}

fn run_import(
    args: ImportArgs,
    data_dir: Utf8PathBuf,
    policy: MissingPathPolicy,
) -> miette::Result<()> {
    let provider_id = args
        .provider_id
        .map(|id| id.parse::<ProviderId>())
        .transpose()
        .into_diagnostic()?;
    let mut client =
        MobilityClient::with_policy(data_dir, NopCatalog, policy).into_diagnostic()?;
    let path = external::import_gtfs(
        client.store_mut(),
        args.zip.as_std_path(),
        ImportOptions {
            provider_id,
            provider_name: args.name,
        },
    )
    .into_diagnostic()?;
    println!("{path}");
    Ok(())
}

fn run_list(data_dir: Utf8PathBuf, policy: MissingPathPolicy) -> miette::Result<()> {
    let mut client =
        MobilityClient::with_policy(data_dir, NopCatalog, policy).into_diagnostic()?;
    let mut datasets = client.list_downloaded_datasets();
    if datasets.is_empty() {
        println!("no datasets downloaded");
        return Ok(());
    }
    datasets.sort_by(|a, b| {
        (a.provider_id.as_str(), &a.dataset_id).cmp(&(b.provider_id.as_str(), &b.dataset_id))
    });
    for record in datasets {
        println!(
            "{}  {}  {}  {}",
            record.provider_id,
            record.provider_name,
            record.dataset_id,
            record.download_timestamp.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn run_delete(
    args: DeleteArgs,
    data_dir: Utf8PathBuf,
    policy: MissingPathPolicy,
) -> miette::Result<()> {
    let provider_id: ProviderId = args.provider_id.parse().into_diagnostic()?;
    let mut client =
        MobilityClient::with_policy(data_dir, NopCatalog, policy).into_diagnostic()?;
    if args.all {
        let removed = client
            .delete_provider_datasets(&provider_id)
            .into_diagnostic()?;
        println!("deleted {removed} dataset(s)");
    } else {
        client
            .delete_dataset(&provider_id, args.dataset.as_deref())
            .into_diagnostic()?;
        println!("deleted");
    }
    Ok(())
}
