use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;
use facet::Facet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use prlfleet::cli::{Cli, Command, OutputFormat};
use prlfleet::cloudinit;
use prlfleet::config::{self, FleetSpec};
use prlfleet::fleet::{self, FleetScheduler};
use prlfleet::hypervisor::Hypervisor;
use prlfleet::hypervisor::prlctl::PrlctlClient;
use prlfleet::lifecycle::Provisioner;
use prlfleet::logging;
use prlfleet::observer::{self, OutputMode};
use prlfleet::seed::SeedMediaBuilder;
use prlfleet::status::{self, ProvisionResult};

#[derive(Facet)]
struct DestroyJson {
    name: String,
    destroyed: bool,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let mode = resolve_output_mode(cli.output, cli.verbose);

    // Spinners own the terminal in interactive mode; log lines would tear them.
    let terminal_filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        match mode {
            OutputMode::Interactive => EnvFilter::new("off"),
            OutputMode::Plain | OutputMode::Json => EnvFilter::from_default_env()
                .add_directive("prlfleet=info".parse().expect("valid log directive")),
        }
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always prlfleet=debug, discarded until the state dir is known
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("prlfleet=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let fleet = config::load_config(&cli.config)?;

    let log_path = logging::log_file(&fleet.settings.state_dir);
    if let Err(e) = file_handle.set_file(&log_path) {
        tracing::warn!(path = %log_path.display(), error = %e, "failed to open log file");
    }
    tracing::debug!(config = %fleet.config_path.display(), vms = fleet.vms.len(), "loaded config");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling in-flight commands");
                eprintln!("interrupted, cancelling...");
                cancel.cancel();
            }
        });
    }

    let hv: Arc<dyn Hypervisor> = Arc::new(
        PrlctlClient::new(&fleet.settings.prlctl)
            .with_command_timeout(fleet.settings.command_timeout)
            .with_cancellation(cancel.clone()),
    );

    match cli.command {
        Command::Up { names } => up(&fleet, hv, cancel, mode, &names).await,
        Command::Destroy { names } => destroy(&fleet, hv, cancel, mode, &names).await,
        Command::Status { names } => show_status(&fleet, hv, mode, &names).await,
    }
}

async fn up(
    fleet: &FleetSpec,
    hv: Arc<dyn Hypervisor>,
    cancel: CancellationToken,
    mode: OutputMode,
    names: &[String],
) -> miette::Result<()> {
    let selected = fleet::with_dependencies(&fleet.vms, names)?;
    fleet::start_order(&selected)?;

    let ssh_keys: Vec<String> = if selected.iter().any(|vm| vm.cloud_init.is_some()) {
        cloudinit::discover_public_key(fleet.settings.ssh_public_key.as_deref())
            .into_iter()
            .collect()
    } else {
        Vec::new()
    };

    let provisioner = Provisioner::new(
        hv,
        SeedMediaBuilder::detect(&fleet.settings.state_dir),
        fleet.settings.clone(),
    )
    .with_ssh_keys(ssh_keys)
    .with_cancellation(cancel);
    let progress = observer::spawn(provisioner.subscribe(), observer::observer_for(mode));

    let scheduler = FleetScheduler::new(Arc::new(provisioner));
    let report = scheduler.run(&selected).await;
    // last transition sender goes with the scheduler; the observer drains and exits
    drop(scheduler);
    let _ = progress.await;
    let report = report?;

    match mode {
        OutputMode::Json => println!("{}", report.to_json()?),
        OutputMode::Interactive | OutputMode::Plain => print!("{}", report.render_text()),
    }

    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn destroy(
    fleet: &FleetSpec,
    hv: Arc<dyn Hypervisor>,
    cancel: CancellationToken,
    mode: OutputMode,
    names: &[String],
) -> miette::Result<()> {
    let selected = fleet::named(&fleet.vms, names)?;

    let provisioner = Provisioner::new(
        hv,
        SeedMediaBuilder::new(&fleet.settings.state_dir, None),
        fleet.settings.clone(),
    )
    .with_cancellation(cancel);
    let progress = observer::spawn(provisioner.subscribe(), observer::observer_for(mode));

    let scheduler = FleetScheduler::new(Arc::new(provisioner));
    let results = scheduler.teardown(&selected).await;
    drop(scheduler);
    let _ = progress.await;
    let results = results?;

    let failed = results.iter().any(|(_, r)| r.is_err());
    match mode {
        OutputMode::Json => {
            let rows: Vec<DestroyJson> = results
                .iter()
                .map(|(name, r)| DestroyJson {
                    name: name.clone(),
                    destroyed: r.is_ok(),
                    error: r.as_ref().err().map(ToString::to_string),
                })
                .collect();
            println!(
                "{}",
                facet_json::to_string(&rows).map_err(|e| miette::miette!("{e}"))?
            );
        }
        OutputMode::Interactive | OutputMode::Plain => {
            for (name, result) in &results {
                match result {
                    Ok(()) => println!("{name}: destroyed"),
                    Err(e) => println!("{name}: failed: {e}"),
                }
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn show_status(
    fleet: &FleetSpec,
    hv: Arc<dyn Hypervisor>,
    mode: OutputMode,
    names: &[String],
) -> miette::Result<()> {
    let selected = fleet::named(&fleet.vms, names)?;

    let queries = selected.iter().map(|vm| {
        let hv = hv.clone();
        async move {
            let state = hv.query(&vm.name).await?;
            Ok::<_, prlfleet::error::FleetError>(ProvisionResult::from_state(
                &vm.name,
                vm.hardware,
                &state,
            ))
        }
    });
    let results = futures_util::future::try_join_all(queries).await?;

    match mode {
        OutputMode::Json => println!("{}", status::status_json(&results)?),
        OutputMode::Interactive | OutputMode::Plain => {
            print!("{}", status::render_status_table(&results))
        }
    }
    Ok(())
}

fn resolve_output_format(format: OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if !std::io::stdout().is_terminal() || !std::io::stdin().is_terminal() {
                OutputFormat::Plain
            } else {
                OutputFormat::Interactive
            }
        }
        other => other,
    }
}

/// `--verbose` streams log lines to stderr, which spinners cannot share.
fn resolve_output_mode(format: OutputFormat, verbose: bool) -> OutputMode {
    match resolve_output_format(format) {
        OutputFormat::Json => OutputMode::Json,
        OutputFormat::Interactive if !verbose => OutputMode::Interactive,
        _ => OutputMode::Plain,
    }
}
