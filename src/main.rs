use anyhow::{Context, Result, bail};
use distributed_storage::client::{CoordinatorClient, DownloadReply};
use distributed_storage::config::{CoordinatorConfig, StorageNodeConfig, TimeoutConfig, load_json};
use distributed_storage::coordinator::server::Coordinator;
use distributed_storage::discovery::types::StorageNodeAddress;
use distributed_storage::storage::server::StorageNode;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

fn print_usage(program: &str) {
    eprintln!("Usage:");
    eprintln!("  {} coordinator [--config <file>] [--bind <addr:port>] [--work-dir <dir>]", program);
    eprintln!(
        "  {} storage [--config <file>] [--bind <addr:port>] [--storage-dir <dir>] [--peer <host:port>]...",
        program
    );
    eprintln!(
        "          [--coordinator <host:port>] [--advertise-host <host>] [--discovery-port <port>] [--response-port <port>]"
    );
    eprintln!("  {} client <host:port> list", program);
    eprintln!("  {} client <host:port> upload <path> [name]", program);
    eprintln!("  {} client <host:port> download <name> [dest]", program);
    eprintln!("  {} client <host:port> delete <name>", program);
    eprintln!();
    eprintln!("Example: {} coordinator --work-dir ./primary", program);
    eprintln!(
        "Example: {} storage --bind 0.0.0.0:5004 --peer 127.0.0.1:5003",
        program
    );
}

/// Splits `--flag value` pairs. Every flag takes exactly one value.
fn parse_flags(args: &[String]) -> Result<Vec<(String, String)>> {
    let mut flags = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let flag = &args[i];
        if !flag.starts_with("--") {
            bail!("unexpected argument '{}'", flag);
        }
        let value = args
            .get(i + 1)
            .with_context(|| format!("{} needs a value", flag))?;
        flags.push((flag.clone(), value.clone()));
        i += 2;
    }
    Ok(flags)
}

fn config_path(flags: &[(String, String)]) -> Option<PathBuf> {
    flags
        .iter()
        .find(|(flag, _)| flag == "--config")
        .map(|(_, value)| PathBuf::from(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "coordinator" => run_coordinator(&args[2..]).await,
        "storage" => run_storage_node(&args[2..]).await,
        "client" => run_client(&args[2..]).await,
        _ => {
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }
}

async fn run_coordinator(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let mut config: CoordinatorConfig = load_json(config_path(&flags).as_deref())?;

    for (flag, value) in flags.iter() {
        match flag.as_str() {
            "--config" => {}
            "--bind" => config.bind_addr = value.parse()?,
            "--work-dir" => config.work_dir = PathBuf::from(value),
            _ => bail!("unknown coordinator flag {}", flag),
        }
    }

    tracing::info!("Starting coordinator on {}", config.bind_addr);
    tracing::info!("Work directory: {}", config.work_dir.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 1. Persisted state:
    let coordinator = Coordinator::new(config).await?;

    // 2. Discovery (UDP):
    coordinator.start_discovery(shutdown_rx.clone()).await?;

    // 3. Client port (TCP):
    let listener = coordinator.bind().await?;
    let server = tokio::spawn(coordinator.clone().serve(listener, shutdown_rx));

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true)?;

    server.await?
}

async fn run_storage_node(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let mut config: StorageNodeConfig = load_json(config_path(&flags).as_deref())?;

    let mut peers: Vec<StorageNodeAddress> = Vec::new();
    for (flag, value) in flags.iter() {
        match flag.as_str() {
            "--config" => {}
            "--bind" => config.bind_addr = value.parse()?,
            "--storage-dir" => config.storage_dir = PathBuf::from(value),
            "--peer" => peers.push(value.parse()?),
            "--coordinator" => config.coordinator_addr = value.parse()?,
            "--advertise-host" => config.advertise_host = value.clone(),
            "--discovery-port" => {
                let port: u16 = value.parse()?;
                config.discovery_addr = SocketAddr::new(config.discovery_addr.ip(), port);
            }
            "--response-port" => config.response_port = value.parse()?,
            _ => bail!("unknown storage flag {}", flag),
        }
    }
    if !peers.is_empty() {
        config.replication.peers = peers;
    }

    tracing::info!("Starting storage node on {}", config.bind_addr);
    tracing::info!(
        "Replication peers: {:?} ({:?})",
        config.replication.peers,
        config.replication.policy
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 1. Part directory + TCP port:
    let (node, listener) = StorageNode::bind(config).await?;

    // 2. Discovery responder (UDP):
    let discovery_addr = node.start_discovery(shutdown_rx.clone()).await?;
    tracing::info!("Discovery responder on {}", discovery_addr);

    // 3. Serve:
    let server = tokio::spawn(node.clone().serve(listener, shutdown_rx));

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true)?;

    server.await?
}

async fn run_client(args: &[String]) -> Result<()> {
    let (Some(addr), Some(command)) = (args.first(), args.get(1)) else {
        bail!("client needs <host:port> and a command");
    };
    let addr: StorageNodeAddress = addr.parse()?;
    let mut client = CoordinatorClient::connect(&addr, TimeoutConfig::default()).await?;

    match (command.as_str(), &args[2..]) {
        ("list", []) => {
            println!("{}", client.list().await?);
        }
        ("upload", [path, rest @ ..]) => {
            let path = Path::new(path);
            let name = match rest.first() {
                Some(name) => name.clone(),
                None => path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .with_context(|| format!("{} has no file name", path.display()))?,
            };
            println!("{}", client.upload_file(&name, path).await?);
        }
        ("download", [name, rest @ ..]) => {
            let dest = PathBuf::from(rest.first().unwrap_or(name));
            let partial = dest.with_extension("download");
            let mut file = tokio::fs::File::create(&partial)
                .await
                .with_context(|| format!("creating {}", partial.display()))?;

            match client.download_into(name, &mut file).await? {
                DownloadReply::Received(size) => {
                    file.sync_all().await?;
                    drop(file);
                    tokio::fs::rename(&partial, &dest).await?;
                    println!("Downloaded {} ({} bytes) to {}", name, size, dest.display());
                }
                DownloadReply::Refused(message) => {
                    drop(file);
                    tokio::fs::remove_file(&partial).await?;
                    println!("{}", message);
                }
            }
        }
        ("delete", [name]) => {
            println!("{}", client.delete(name).await?);
        }
        _ => bail!("unknown client command '{}'", command),
    }

    Ok(())
}
