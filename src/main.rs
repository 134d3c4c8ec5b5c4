use std::error::Error;
use std::time::Duration;

use clap::Parser;
use log::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use socks_dns::{Answer, Endpoint, Lookup, DEFAULT_TIMEOUT};

#[derive(Parser)]
#[command(name = "socks-dns")]
#[command(about = "Resolve an A record, optionally through a SOCKS5 proxy")]
struct Cli {
    /// Domain to resolve; starts an interactive prompt when omitted
    #[arg(short, long)]
    domain: Option<String>,

    /// DNS server, port 53 unless given
    #[arg(short, long, default_value = "8.8.8.8:53")]
    server: String,

    /// SOCKS5 proxy, port 7890 unless given
    #[arg(short, long)]
    proxy: Option<String>,

    /// Receive timeout in milliseconds
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout: u64,
}

fn print_servers(lookup: &Lookup) {
    println!("Server: {}", lookup.server());
    println!(
        "Proxy: {}",
        lookup.proxy().map(ToString::to_string).unwrap_or_default()
    );
}

fn print_answer(lookup: &Lookup, answer: &Answer) {
    print_servers(lookup);
    println!();
    println!("Name: {}", answer.name);
    println!("Address: {}", answer.address_string());
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "warn");
    }
    pretty_env_logger::init();

    let cli = Cli::parse();
    let server = Endpoint::dns_server(&cli.server)?;
    let proxy = cli.proxy.as_deref().map(Endpoint::proxy).transpose()?;
    let timeout = Duration::from_millis(cli.timeout);
    let mut lookup = Lookup::new(server, proxy, timeout);

    println!("DNS lookup");
    println!();
    if let Some(domain) = cli.domain {
        let answer = lookup.query(&domain).await?;
        print_answer(&lookup, &answer);
        return Ok(());
    }

    print_servers(&lookup);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        println!();
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        match (command, words.next()) {
            ("exit", _) => break,
            ("server", Some(addr)) => match Endpoint::dns_server(addr) {
                Ok(server) => {
                    lookup = Lookup::new(server, lookup.proxy().cloned(), timeout);
                    print_servers(&lookup);
                }
                Err(e) => error!("{e}"),
            },
            ("server", None) => error!("Usage: server <host[:port]>"),
            ("proxy", addr) => match addr.map(Endpoint::proxy).transpose() {
                Ok(proxy) => {
                    lookup = Lookup::new(lookup.server().clone(), proxy, timeout);
                    print_servers(&lookup);
                }
                Err(e) => error!("{e}"),
            },
            (domain, _) => match lookup.query(domain).await {
                Ok(answer) => print_answer(&lookup, &answer),
                Err(e) => error!("{e}"),
            },
        }
    }
    Ok(())
}
