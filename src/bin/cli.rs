//! Medchain CLI application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medchain::{ChainPolicy, MedicalRecord, Node, NodeConfig};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "medchain-cli")]
#[command(about = "Peer-to-peer ledger for medical records")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address this node is reachable at (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Existing node to join; omit to start a new network
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Only accept blocks and chains that validate
    #[arg(long)]
    verified: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Set verbosity level (0-4)
    #[arg(short, long, default_value_t = 2)]
    verbosity: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and open the record menu
    Start,
    /// Show version information
    Version,
}

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        match cli.verbosity {
            0 => Level::ERROR,
            1 => Level::WARN,
            2 => Level::INFO,
            3 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Some(Commands::Start) | None => run(cli).await,
        Some(Commands::Version) => {
            println!("{} v{}", medchain::NAME, medchain::VERSION);
            Ok(())
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    let mut input: Input = BufReader::new(tokio::io::stdin()).lines();

    if let Some(listen) = cli.listen {
        config.local_address = listen;
    } else if cli.config.is_none() {
        config.local_address = prompt_line(&mut input, "Enter your host: ").await?;
    }
    if cli.bootstrap.is_some() {
        config.bootstrap = cli.bootstrap;
    } else if cli.config.is_none() {
        let dest =
            prompt_line(&mut input, "Enter destination host (empty to be the first node): ")
                .await?;
        config.bootstrap = (!dest.is_empty()).then_some(dest);
    }
    if cli.verified {
        config.chain_policy = ChainPolicy::Verified;
    }

    let mut node = Node::builder().with_config(config).build()?;
    node.start().await?;
    let bootstrap = node.config().bootstrap.clone();
    node.join(bootstrap.as_deref())
        .await
        .context("could not join the network")?;

    println!("Welcome to Medchain!");
    loop {
        println!("1. New Medical Record\n2. List Medical Records\n3. List Hosts\n4. Verify Chain\n5. Quit");
        let action = prompt_line(&mut input, "Enter action (1|2|3|4|5): ").await?;
        match action.as_str() {
            "1" => {
                let record = read_record(&mut input).await?;
                match node.append_record(record).await {
                    Ok((block, report)) => {
                        println!("You have registered successfully! (block {})", block.index);
                        for (peer, e) in &report.failed {
                            println!("\tCould not reach {}: {}", peer, e);
                        }
                        print_records(&node).await;
                    },
                    Err(e) => error!("Could not register record: {}", e),
                }
            },
            "2" => print_records(&node).await,
            "3" => print_hosts(&node).await,
            "4" => match node.first_invalid_index().await {
                None => println!("Chain is valid ({} blocks)", node.chain_len().await),
                Some(index) => println!("Chain is INVALID from block {}", index),
            },
            "5" | "q" | "quit" => break,
            "" => {},
            other => println!("Unknown action {:?}", other),
        }
    }

    info!("Shutting down node...");
    node.stop().await?;
    Ok(())
}

async fn prompt_line(input: &mut Input, prompt: &str) -> Result<String> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let line = input
        .next_line()
        .await?
        .context("standard input closed")?;
    Ok(line.trim().to_string())
}

async fn read_record(input: &mut Input) -> Result<MedicalRecord> {
    println!("- - - Register - - -");
    Ok(MedicalRecord {
        name: prompt_line(input, "Enter name: ").await?,
        year: prompt_line(input, "Enter year: ").await?,
        hospital: prompt_line(input, "Enter hospital: ").await?,
        doctor: prompt_line(input, "Enter doctor: ").await?,
        diagnostic: prompt_line(input, "Enter diagnostic: ").await?,
        medication: prompt_line(input, "Enter medication: ").await?,
        procedure: prompt_line(input, "Enter procedure: ").await?,
    })
}

async fn print_records(node: &Node) {
    for (i, record) in node.records().await.iter().enumerate() {
        println!("- - - Medical Record No. {} - - -", i + 1);
        print!("{}", record);
    }
}

async fn print_hosts(node: &Node) {
    println!("- - - HOSTS - - -");
    println!("\t{} (Your host)", node.local_address().await);
    for host in node.peers().await {
        println!("\t{}", host);
    }
}
