use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use cmpnode::{
    Contact, Dispatcher, FsStore, Keypair, MeshTransport, Node, NodeConfig, NodeState, StdConsole,
};

#[derive(Subcommand, Debug, Clone)]
enum Exchange {
    /// Trace the path from the first node to the last.
    Traceroute,
    /// Ping the last node from the first.
    Ping {
        #[arg(short, long, default_value = "1")]
        count: u64,
    },
    /// Send a text message from the first node to the last.
    Message { text: String },
    /// Push a local file from the first node into the last node's FTP root.
    File { path: PathBuf },
    /// Advertise a subscription covering every node.
    Advertise {
        #[arg(default_value = "demo")]
        subscription: String,
    },
    /// Correct the first node's clock against the last.
    Clocksync,
    /// Send an onion message through every other node.
    Onion { text: String },
}

#[derive(Parser, Debug)]
#[command(name = "cmpnode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node names, in line order.
    #[arg(short, long, value_delimiter = ',', default_value = "A,B,C")]
    nodes: Vec<String>,

    /// Round-trip timeout for ping and traceroute, in seconds.
    #[arg(short = 't', long, default_value = "5")]
    ping_timeout: u64,

    /// Directory FTP transfers are written into.
    #[arg(short, long, default_value = ".")]
    ftp_root: PathBuf,

    /// Directory holding `<node>.pem` PKCS#8 keys for onion relays. Nodes
    /// without a key file get a freshly generated one.
    #[arg(short, long)]
    key_dir: Option<PathBuf>,

    /// How long to let the exchange run before exiting, in milliseconds.
    #[arg(short, long, default_value = "500")]
    settle_ms: u64,

    #[command(subcommand)]
    exchange: Exchange,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    anyhow::ensure!(args.nodes.len() >= 2, "need at least two nodes");

    let config = NodeConfig {
        ping_timeout: Duration::from_secs(args.ping_timeout),
        ..NodeConfig::default()
    };
    let with_keys = matches!(args.exchange, Exchange::Onion { .. });

    let mesh = MeshTransport::new();
    let mut nodes = Vec::with_capacity(args.nodes.len());
    let mut public_keys = Vec::new();
    for name in &args.nodes {
        let mut state = NodeState::new(Contact::named(name), &config, 0.0);
        if with_keys {
            let keypair = load_or_generate_key(args.key_dir.as_deref(), name)?;
            info!(node = %name, fingerprint = %keypair.fingerprint(), "node key ready");
            public_keys.push((Contact::named(name), keypair.public_key()));
            state = state.with_keypair(keypair);
        }
        let dispatcher = Dispatcher::new(Arc::new(StdConsole), Arc::new(FsStore));
        nodes.push(mesh.join(state, dispatcher, &config).await?);
    }

    let (first, last) = match (nodes.first(), nodes.last()) {
        (Some(first), Some(last)) => (first.clone(), last.contact().clone()),
        _ => anyhow::bail!("no nodes"),
    };
    info!(nodes = ?args.nodes, "mesh up");

    run(&first, last, &args, public_keys).await?;

    time::sleep(Duration::from_millis(args.settle_ms)).await;
    first.check_timeouts().await?;
    mesh.shutdown().await;
    Ok(())
}

fn load_or_generate_key(key_dir: Option<&Path>, name: &str) -> Result<Keypair> {
    if let Some(path) = key_dir.map(|dir| dir.join(format!("{}.pem", name)))
        && path.exists()
    {
        let pem = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return Keypair::from_pkcs8_pem(&pem)
            .with_context(|| format!("invalid key in {}", path.display()));
    }
    Keypair::generate().context("failed to generate node key")
}

async fn run(
    first: &Node,
    last: Contact,
    args: &Args,
    public_keys: Vec<(Contact, rsa::RsaPublicKey)>,
) -> Result<()> {
    match &args.exchange {
        Exchange::Traceroute => {
            first.traceroute(last).await?;
        }
        Exchange::Ping { count } => {
            for seq_id in 1..=*count {
                first.ping(last.clone(), seq_id).await?;
            }
        }
        Exchange::Message { text } => {
            first.send_message(last, text.clone()).await?;
        }
        Exchange::File { path } => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("file path has no usable name")?;
            let fpath = args.ftp_root.to_string_lossy().into_owned();
            first.send_file(last, fpath, file_name, bytes).await?;
        }
        Exchange::Advertise { subscription } => {
            first.advertise(subscription.clone(), args.nodes.clone()).await?;
        }
        Exchange::Clocksync => {
            first.clocksync(last).await?;
        }
        Exchange::Onion { text } => {
            let relays = public_keys.into_iter().skip(1).collect();
            first.onion(relays, text.clone()).await?;
        }
    }
    Ok(())
}
