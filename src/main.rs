//! seedbox-mirror - Main entry point
//!
//! Mirror completed torrents from a seedbox and verify them before they are
//! moved and labelled.

use anyhow::{Context, Result};
use seedbox_mirror::cli::print_summary;
use seedbox_mirror::control::RuTorrentClient;
use seedbox_mirror::remote::HttpChannel;
use seedbox_mirror::{CliArgs, Config, LocalChannel, MirrorSettings, Orchestrator, RemoteChannel, RunLock};
use tracing::{debug, error, info, warn};

/// Exit status after Ctrl-C
const EXIT_INTERRUPTED: i32 = 130;

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("seedbox-mirror starting");

    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };

    debug!("Exiting with status {}", code);
    std::process::exit(code);
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
        debug!("Using pretty log format (verbose mode)");
    } else {
        subscriber.compact().init();
    }
}

/// Build the configuration, take the run lock and mirror
async fn run(args: &CliArgs) -> Result<i32> {
    let config = Config::from_args(args)?;
    config.validate().context("Invalid configuration")?;
    display_config(&config);

    let lock = RunLock::acquire(config.lock_path())?;
    let control = RuTorrentClient::new(config.rutorrent_config()).context("Failed to create ruTorrent client")?;
    let settings = config.mirror_settings();

    match &config.local_source {
        Some(root) => {
            info!("Reading remote tree from {}", root.display());
            let mut channel = LocalChannel::new(root.clone()).with_max_request_size(config.max_request_size);
            mirror(&mut channel, &control, &settings, lock, config.is_quiet()).await
        }
        None => {
            info!("Reading remote tree from {}", config.downloads_url);
            let mut channel = HttpChannel::connect(config.http_channel_config())
                .context("Failed to connect to the download area")?;
            mirror(&mut channel, &control, &settings, lock, config.is_quiet()).await
        }
    }
}

/// Run the orchestrator until it finishes or Ctrl-C arrives
///
/// The lock lives inside the orchestrator, so dropping the run on interrupt
/// removes the lock file before the process exits.
async fn mirror<C: RemoteChannel>(
    channel: &mut C,
    control: &RuTorrentClient,
    settings: &MirrorSettings,
    lock: RunLock,
    quiet: bool,
) -> Result<i32> {
    let orchestrator = Orchestrator::new(channel, control, settings, Some(lock));
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = orchestrator.run() => {
            let report = result?;
            if !quiet {
                print_summary(&report);
            }
            Ok(report.exit_code())
        }
        _ = interrupted => {
            warn!("Interrupted, mirror run abandoned");
            Ok(EXIT_INTERRUPTED)
        }
    }
}

/// Log the effective configuration
fn display_config(config: &Config) {
    info!("Host: {} (user {})", config.host, config.username);
    info!("Remote directory: {}", config.remote_dir);
    info!("Local directory: {}", config.local_dir.display());
    info!("Verified torrents go to {} with label {}", config.move_to, config.label);
    debug!(
        "Resume: {}, preserve permissions: {}, preserve times: {}, strict: {}",
        config.resume, config.preserve_permissions, config.preserve_times, config.strict
    );
    debug!(
        "Timeout {:?}, keepalive {:?}, rewind margin {} bytes, max request {} bytes",
        config.timeout, config.keepalive, config.rewind_margin, config.max_request_size
    );
}
