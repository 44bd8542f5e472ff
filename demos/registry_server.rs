//! Registry server example
//!
//! Run with: cargo run --example registry_server [BIND_ADDR] [STORE_DIR]
//!
//! Examples:
//!   cargo run --example registry_server                          # 0.0.0.0:9777, in-memory store
//!   cargo run --example registry_server localhost                # 127.0.0.1:9777
//!   cargo run --example registry_server 127.0.0.1:9800 ./data    # database in ./data/registry.db
//!
//! Connect clients with the `registry_client` example. The server registers
//! one service of its own and logs every change it sees.

use std::net::SocketAddr;

use discovery_rs::model::{Event, Node, Protocol, ServiceInfo};
use discovery_rs::server::config::DEFAULT_PORT;
use discovery_rs::{RegistryServer, ServerConfig};

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:9777
/// - "127.0.0.1" -> 127.0.0.1:9777
/// - "127.0.0.1:9800" -> 127.0.0.1:9800
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: registry_server [BIND_ADDR] [STORE_DIR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:9777)");
    eprintln!("  STORE_DIR    Directory for the registry database (default: in memory)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ServerConfig::default().name("demo-server");
    if let Some(addr) = args.get(1) {
        match parse_bind_addr(addr) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }
    if let Some(dir) = args.get(2) {
        config = config.store_dir(dir);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("discovery_rs=debug".parse()?)
                .add_directive("registry_server=debug".parse()?),
        )
        .init();

    let server = RegistryServer::start(config).await?;
    let hub = server.hub();

    hub.register_event_handler(|event: &Event| {
        let nodes = event.info.as_ref().map(|i| i.nodes.len()).unwrap_or(0);
        println!("{} {} ({} nodes)", event.event_type, event.service_id, nodes);
    });

    let own = ServiceInfo::new("registry", 0).with_node(Node::new(
        "main",
        server.local_addr().to_string(),
        Protocol::Tcp,
    ));
    hub.register_service(own).await?;

    println!("Registry server listening on {}", server.local_addr());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop();
    println!("Stopped");

    Ok(())
}
