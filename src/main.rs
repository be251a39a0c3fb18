use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use vpnctl::engine::DryRunEngine;
use vpnctl::ipc::SessionState;
use vpnctl::loader::{LibraryLoader, SearchPathLinker};
use vpnctl::service::{self, LocalBinder};
use vpnctl::session::{SessionCoordinator, SessionSettings, TileView};
use vpnctl::vpn::InterfaceConfig;
use vpnctl::{Capabilities, Config, RouteResolver, TunnelInterfaceConfigurator};

#[derive(Parser)]
#[command(name = "vpnctl")]
#[command(about = "Control plane for a split-tunnel VPN client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./vpnctl.toml, then ~/.vpnctl/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default config file
    Init,
    /// Print the route directives for the configured split-tunnel policy
    Routes {
        /// Compute routes as if the interface had no exclude-route primitive
        #[arg(long)]
        fallback: bool,
    },
    /// Print the full ordered interface directive list
    Interface,
    /// Run an in-process service and coordinator against a dry-run engine
    ///
    /// Taps once to connect and once more to disconnect, printing every
    /// indicator change.
    Simulate {
        /// Connect without a profile, as a first launch would
        #[arg(long)]
        first_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => {
            info!("Generating default config...");
            let path = Config::default_path();
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
        Commands::Routes { fallback } => {
            let config = Config::find(cli.config.as_deref())?;
            let mut caps = capabilities(&config);
            if fallback {
                caps.exclude_route = false;
            }

            let policy = config.profile().policy()?;
            let resolver = RouteResolver::for_capabilities(&caps);
            let directives = resolver.resolve(&policy);
            if directives.is_empty() {
                println!("Split tunneling disabled: default routes unchanged");
            }
            for directive in directives {
                println!("{}", directive);
            }
        }
        Commands::Interface => {
            let config = Config::find(cli.config.as_deref())?;
            let configurator = TunnelInterfaceConfigurator::new(capabilities(&config));
            let interface = InterfaceConfig::build(&config.profile(), &configurator.resolver())?;
            for directive in configurator.directives(&interface) {
                println!("{}", directive);
            }
        }
        Commands::Simulate { first_run } => {
            let config = Config::find(cli.config.as_deref())?;
            simulate(&config, first_run).await?;
        }
    }

    Ok(())
}

fn capabilities(config: &Config) -> Capabilities {
    Capabilities::detect().with_overrides(&config.capabilities)
}

async fn simulate(config: &Config, first_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let caps = capabilities(config);
    let loader = LibraryLoader::new(SearchPathLinker::default());
    let binder = LocalBinder::new(move || service::start(DryRunEngine::new(), caps, &loader));

    let mut settings = SessionSettings::from(&config.session);
    if !first_run {
        settings = settings.with_connect_profile(config.profile().to_json()?);
    }
    // Long enough for a bind timeout plus a stop timeout
    let settle = settings.bind_timeout + settings.stop_timeout + Duration::from_millis(500);

    let (coordinator, mut handle) = SessionCoordinator::new(settings, binder);
    let mut view = handle.view();
    let task = tokio::spawn(coordinator.run());

    print_view(&view.borrow_and_update());
    handle.start_listening()?;
    handle.tap()?;

    let deadline = tokio::time::Instant::now() + settle;
    let mut connected = false;
    let mut attempted = false;
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                print_view(&current);
                match current.state {
                    SessionState::Connected => {
                        connected = true;
                        break;
                    }
                    SessionState::Connecting => attempted = true,
                    SessionState::Disconnected | SessionState::Error if attempted => break,
                    _ => {}
                }
            }
            Some(notice) = handle.next_notice() => {
                println!("notice: {}", notice);
                vpnctl::notify::show_notice(&notice);
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("No connection outcome within {:?}", settle);
                break;
            }
        }
    }

    if connected {
        handle.tap()?;
        let deadline = tokio::time::Instant::now() + settle;
        while let Ok(Ok(())) = tokio::time::timeout_at(deadline, view.changed()).await {
            let current = view.borrow_and_update().clone();
            print_view(&current);
            if current.state == SessionState::Disconnected {
                break;
            }
        }
    }

    handle.shutdown()?;
    task.await?;
    Ok(())
}

fn print_view(view: &TileView) {
    println!(
        "[{}] {} ({:?})",
        if view.active { "on " } else { "off" },
        view.label,
        view.state
    );
}
