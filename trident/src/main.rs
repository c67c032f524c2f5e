use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use trident_lib::{DnsConfig, IpOption, NameServerConfig, QueryStrategy, Resolver};

#[derive(Parser)]
#[command(author, version, about = "multi-client recursive DNS resolver", long_about = None)]
struct Cli {
    /// Resolver configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a domain and print the answers
    Resolve {
        domain: String,

        /// Name server address; may repeat. Ignored when --config is given
        #[arg(short, long)]
        server: Vec<String>,

        /// Address families to ask for: 4, 6 or 46
        #[arg(long, default_value = "46")]
        family: String,

        /// Race the servers instead of walking them in order
        #[arg(long)]
        parallel: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    trident_lib::setup_logging(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("trident: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let Command::Resolve {
        domain,
        server,
        family,
        parallel,
    } = cli.command;

    // an address literal never needs the resolver
    if let Ok(ip) = domain.parse::<IpAddr>() {
        println!("{}", ip);
        return Ok(());
    }

    let mut config: DnsConfig = match &cli.config {
        Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
        None => {
            let servers = if server.is_empty() {
                vec![NameServerConfig::Address("localhost".to_string())]
            } else {
                server.into_iter().map(NameServerConfig::Address).collect()
            };
            DnsConfig {
                servers,
                ..Default::default()
            }
        }
    };
    if parallel {
        config.parallel_query = true;
    }

    let option = match family.as_str() {
        "4" => IpOption {
            ipv4: true,
            ipv6: false,
            fake_enable: false,
        },
        "6" => IpOption {
            ipv4: false,
            ipv6: true,
            fake_enable: false,
        },
        "46" => IpOption::both(),
        other => return Err(format!("bad --family value: {}", other).into()),
    };
    if config.query_strategy == QueryStrategy::default() && family != "46" {
        config.query_strategy = if family == "4" {
            QueryStrategy::UseIp4
        } else {
            QueryStrategy::UseIp6
        };
    }

    let resolver = Resolver::new(&config, None)?;
    let (ips, ttl) = resolver.lookup_ip(&domain, option).await?;
    for ip in &ips {
        println!("{}", ip);
    }
    eprintln!("; ttl {}s via {} server(s)", ttl, config.servers.len());
    Ok(())
}
