use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::process;
use std::sync::Arc;

use chordkv_node::{api, maintenance, ChordError, ChordNode, Config, RealNetworkClient};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

const USAGE: &str = "usage: chordkv-node <port> [<existing_ip> <existing_port>]";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Get(String),
    Put(String, String),
    Delete(String),
    Exit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let mut parts = line.splitn(3, char::is_whitespace);
        let command = parts.next().unwrap_or_default();
        let key = parts.next().map(str::to_string);
        let rest = parts.next().map(|v| v.trim().to_string());
        match (command, key, rest) {
            ("get", Some(key), None) => Ok(Command::Get(key)),
            ("put", Some(key), Some(value)) if !value.is_empty() => Ok(Command::Put(key, value)),
            ("delete", Some(key), None) => Ok(Command::Delete(key)),
            ("exit", None, None) => Ok(Command::Exit),
            _ => Err(format!(
                "unknown command {:?}; expected get <key>, put <key> <value>, delete <key> or exit",
                line
            )),
        }
    }
}

struct Args {
    port: u16,
    bootstrap: Option<String>,
}

fn parse_args(args: &[String]) -> Option<Args> {
    match args {
        [port] => Some(Args {
            port: port.parse().ok()?,
            bootstrap: None,
        }),
        [port, ip, existing_port] => {
            let ip: IpAddr = ip.parse().ok()?;
            let existing_port: u16 = existing_port.parse().ok()?;
            Some(Args {
                port: port.parse().ok()?,
                bootstrap: Some(SocketAddr::new(ip, existing_port).to_string()),
            })
        }
        _ => None,
    }
}

/// Address of the interface that routes to the outside world.
fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn print_neighbours(node: &ChordNode<RealNetworkClient>) {
    let snapshot = node.ring_snapshot();
    println!("node {} at {}", snapshot.id, snapshot.address);
    println!("  successor:   {}", snapshot.successor);
    match snapshot.predecessor {
        Some(predecessor) => println!("  predecessor: {}", predecessor),
        None => println!("  predecessor: unknown"),
    }
}

async fn run_command(node: &ChordNode<RealNetworkClient>, command: Command) -> Result<(), ChordError> {
    match command {
        Command::Get(key) => match node.get(&key).await? {
            Some(value) => println!("{} = {}", key, String::from_utf8_lossy(&value)),
            None => println!("{} not found", key),
        },
        Command::Put(key, value) => {
            let owner = node.put(&key, value.into_bytes()).await?;
            println!("stored {} on {}", key, owner);
        }
        Command::Delete(key) => {
            if node.delete(&key).await? {
                println!("deleted {}", key);
            } else {
                println!("{} not found", key);
            }
        }
        Command::Exit => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(args) = parse_args(&args) else {
        println!("{}", USAGE);
        return;
    };

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    if env::var("CHORD_NODE_ADDRESS").is_err() {
        config.p2p_address = SocketAddr::new(local_ip(), args.port).to_string();
    }
    if config.bind_address.is_none() {
        config.bind_address =
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port).to_string());
    }

    let client = Arc::new(RealNetworkClient::new(config.rpc_timeout));
    let node = match ChordNode::from_config(&config, client) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(config.bind_address()).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {}", config.bind_address(), e);
            process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = {
        let node = node.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = node.serve(listener, shutdown).await {
                error!("RPC listener failed: {}", e);
            }
        })
    };

    match &args.bootstrap {
        Some(bootstrap) => {
            if let Err(e) = node.join(bootstrap).await {
                eprintln!("failed to join via {}: {}", bootstrap, e);
                process::exit(1);
            }
        }
        None => node.create(),
    }
    print_neighbours(&node);

    let mut tasks = maintenance::spawn(node.clone(), config.schedule, shutdown_rx);
    tasks.push(server);

    if let Some(api_address) = &config.api_address {
        match api_address.parse::<SocketAddr>() {
            Ok(addr) => {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = api::run(addr, node).await {
                        error!("API server failed: {}", e);
                    }
                });
            }
            Err(e) => warn!("ignoring API address {}: {}", api_address, e),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("failed to read stdin: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Exit) => break,
                    Ok(command) => {
                        if let Err(e) = run_command(&node, command).await {
                            println!("error: {}", e);
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down, leaving the ring");
    match tokio::time::timeout(config.leave_deadline, node.leave()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("leave did not complete cleanly: {}", e),
        Err(_) => warn!("leave exceeded {:?}", config.leave_deadline),
    }
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
}
