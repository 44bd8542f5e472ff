//! Registry client example
//!
//! Run with: cargo run --example registry_client [SERVER_ADDR] [SERVICE_ID]
//!
//! Examples:
//!   cargo run --example registry_client                            # 127.0.0.1:9777, service "echo-<pid>"
//!   cargo run --example registry_client 127.0.0.1:9800 search-1
//!
//! Registers one HTTP service, prints every registry event, and lists the
//! mirror every few seconds. Stop and restart the server to watch the
//! client reconnect and re-register.

use std::time::Duration;

use discovery_rs::model::{Event, Node, Protocol, ServiceInfo};
use discovery_rs::{ClientConfig, RegistryClient};

const DEMO_SERVICE_TYPE: u32 = 42;

fn print_usage() {
    eprintln!("Usage: registry_client [SERVER_ADDR] [SERVICE_ID]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  SERVER_ADDR  Registry server (default: 127.0.0.1:9777)");
    eprintln!("  SERVICE_ID   Id of the service to register (default: echo-<pid>)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let server_addr = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:9777".to_string());
    let service_id = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| format!("echo-{}", std::process::id()));

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("discovery_rs=info".parse()?)
                .add_directive("registry_client=debug".parse()?),
        )
        .init();

    let client = RegistryClient::connect(ClientConfig::new(&server_addr).name(&service_id));

    client.register_event_handler(|event: &Event| {
        println!("[event] {} {}", event.event_type, event.service_id);
    });

    let mut state = client.connection_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let connected = *state.borrow_and_update();
            println!("[link] {}", if connected { "connected" } else { "disconnected" });
        }
    });

    client.wait_connected().await?;

    let info = ServiceInfo::new(&service_id, DEMO_SERVICE_TYPE)
        .with_node(Node::new("http", "127.0.0.1:8080", Protocol::Http))
        .with_meta("version", env!("CARGO_PKG_VERSION"));
    if let Err(e) = client.register_service(info).await {
        eprintln!("Registration not sent yet ({}); it will be re-sent on reconnect", e);
    }

    println!("Registered {} with {}", service_id, server_addr);
    println!("Press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let services = client.services()?;
                println!("[mirror] {} services", services.len());
                for service in services {
                    println!("  {} type={} nodes={}", service.id, service.service_type, service.nodes.len());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = client.deregister_service::<&str>(&service_id, &[]).await {
        eprintln!("Deregistration not sent: {}", e);
    }
    client.stop();
    println!("Stopped");

    Ok(())
}
