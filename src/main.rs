use clap::{Parser, Subcommand};
use saml_vpn::auth::{CommandBrowserDriver, GatewayPrelogin, SsoAuthenticator};
use saml_vpn::config::Config;
use saml_vpn::ipc::client::IpcClient;
use saml_vpn::ipc::protocol::{Request, Response};
use saml_vpn::ipc::server::IpcServer;
use saml_vpn::launcher::OpenconnectLauncher;
use saml_vpn::profile::{default_store_toml, ProfileStore};
use saml_vpn::routes::{RouteManager, RouteTable, SystemRouteTable};
use saml_vpn::session::{Orchestrator, SessionState, StatusEvent};
use saml_vpn::state;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "saml-vpn")]
#[command(about = "SSO session orchestrator for OpenConnect-style VPN clients")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.saml-vpn/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator service
    Serve,
    /// Start a VPN session for the named profile and follow it until settled
    Connect {
        /// Profile name from the profile store
        profile: String,
    },
    /// Tear down the active session
    Disconnect,
    /// Show the current session status
    Status,
    /// Follow the status event stream
    Watch,
    /// List configured profiles
    Profiles,
    /// Generate default config and profile files
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays parseable
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

    if matches!(cli.command, Commands::Init) {
        return init(cli.config.as_ref());
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Connect { profile } => connect(&config, &profile).await?,
        Commands::Disconnect => disconnect(&config).await?,
        Commands::Status => status(&config).await?,
        Commands::Watch => watch(&config).await?,
        Commands::Profiles => profiles(&config).await?,
        Commands::Init => unreachable!(),
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None => {
            let default_path = Config::default_path()?;
            if default_path.exists() {
                Ok(Config::load(&default_path)?)
            } else {
                Ok(Config::default())
            }
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let table: Arc<dyn RouteTable> = Arc::new(SystemRouteTable::new());
    let grace = Duration::from_secs(config.stop_grace_secs);

    // Clean up anything a crashed previous run left behind
    state::recover(&config.state_dir, table.clone(), grace).await?;

    let store = ProfileStore::load(&config.profiles_file).map_err(|e| {
        format!(
            "Cannot load profiles from {} ({}); run `saml-vpn init` first",
            config.profiles_file.display(),
            e
        )
    })?;

    let authenticator = SsoAuthenticator::new(
        Arc::new(GatewayPrelogin),
        Arc::new(CommandBrowserDriver::new(config.browser_command.clone())),
        Duration::from_secs(config.auth_timeout_secs),
    );
    let launcher = Arc::new(OpenconnectLauncher::new(config.client_binary.clone(), grace));

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        authenticator,
        launcher,
        RouteManager::new(table),
        config.physical_interface.clone(),
        config.state_dir.clone(),
    ));

    let server = IpcServer::new(orchestrator.clone(), config.socket_path.clone());
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        token.cancel();
    });

    server.run(shutdown).await?;

    // Tear down an active session before exiting so no routes outlive us
    if orchestrator.disconnect().await {
        let mut events = orchestrator.subscribe();
        let _ = timeout(Duration::from_secs(10), async {
            while let Ok(event) = events.recv().await {
                if event.state.is_terminal() {
                    break;
                }
            }
        })
        .await;
    }

    Ok(())
}

async fn connect(config: &Config, profile: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Subscribe before asking, so a fast failure is not missed
    let watcher = IpcClient::connect(&config.socket_path).await?;
    let mut watcher = watcher.subscribe().await?;

    let mut client = IpcClient::connect(&config.socket_path).await?;
    let response = client
        .call(&Request::Connect {
            profile: profile.to_string(),
        })
        .await?;

    match response {
        Response::Ack { message } => println!("{}", message),
        Response::Error { message, .. } => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
        other => {
            eprintln!("Unexpected response: {:?}", other);
            std::process::exit(1);
        }
    }

    while let Some(event) = watcher.next_event().await {
        print_event(&event);
        match event.state {
            SessionState::Connected => return Ok(()),
            SessionState::Failed | SessionState::Disconnected => std::process::exit(1),
            _ => {}
        }
    }
    Ok(())
}

async fn disconnect(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = IpcClient::connect(&config.socket_path).await?;
    match client.call(&Request::Disconnect).await? {
        Response::Ack { message } => println!("{}", message),
        other => eprintln!("Unexpected response: {:?}", other),
    }
    Ok(())
}

async fn status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = IpcClient::connect(&config.socket_path).await?;
    match client.call(&Request::Status).await? {
        Response::Status { event } => {
            println!("Status: {}", event.state);
            println!("  {}", event.message);
            if let Some(kind) = event.error {
                println!("  Error: {}", kind);
            }
        }
        other => eprintln!("Unexpected response: {:?}", other),
    }
    Ok(())
}

async fn watch(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = IpcClient::connect(&config.socket_path).await?;
    let mut stream = client.subscribe().await?;

    print_event(stream.snapshot());
    while let Some(event) = stream.next_event().await {
        print_event(&event);
    }
    Ok(())
}

async fn profiles(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = IpcClient::connect(&config.socket_path).await?;
    match client.call(&Request::Profiles).await? {
        Response::Profiles { profiles } => {
            for profile in profiles {
                println!("{} ({})", profile.name, profile.server);
            }
        }
        other => eprintln!("Unexpected response: {:?}", other),
    }
    Ok(())
}

fn init(config_path: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
    } else {
        config.save(&config_path)?;
        println!("Created default config: {}", config_path.display());
    }

    if config.profiles_file.exists() {
        println!("Profile store already exists: {}", config.profiles_file.display());
    } else {
        if let Some(parent) = config.profiles_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config.profiles_file, default_store_toml())?;
        println!("Created profile store: {}", config.profiles_file.display());
    }

    Ok(())
}

fn print_event(event: &StatusEvent) {
    match event.error {
        Some(kind) => println!("[{}] {} ({})", event.state, event.message, kind),
        None => println!("[{}] {}", event.state, event.message),
    }
}
