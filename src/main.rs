use anyhow::{Context, Result};
use dfs_node::config::{config_path, NodeConfig};
use dfs_node::networking::TransferStatus;
use dfs_node::peer::PeerClient;
use dfs_node::{Node, Terminate};
use dotenv::dotenv;
use log::{error, info};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    let path = config_path(std::env::args().nth(1))
        .context("usage: dfs-node <config.json> (or set DFS_CONFIG)")?;
    let config = NodeConfig::load(&path)?;

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str()));

    let terminate = Terminate::new();
    let t = terminate.clone();
    ctrlc::set_handler(move || {
        t.trigger();
    })?;

    let node = Node::start(&config, terminate.clone(), Some(Arc::new(report_progress))).await?;
    info!("File server listening on {}", node.file_server_addr());
    if let Some(addr) = node.dht_addr() {
        info!("DHT server listening on {}", addr);
    }

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = terminate.wait() => None,
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let (command, arg) = match input.split_once(char::is_whitespace) {
            Some((command, arg)) => (command.to_lowercase(), arg.trim()),
            None => (input.to_lowercase(), ""),
        };

        match command.as_str() {
            "help" | "h" => print_help(),
            "register" if !arg.is_empty() => match node.client().register(Path::new(arg)).await {
                Ok(report) => {
                    println!("Registered {} ({} bytes)", report.name, report.size);
                    if !report.replicated_to.is_empty() {
                        println!("  replicated to: {}", report.replicated_to.join(", "));
                    }
                    if !report.skipped.is_empty() {
                        println!("  skipped: {}", report.skipped.join(", "));
                    }
                }
                Err(e) => error!("Failed to register {}: {:#}", arg, e),
            },
            "search" if !arg.is_empty() => {
                let result = node.client().search(arg).await;
                println!("{}", PeerClient::format_search(arg, &result));
            }
            "lookup" if !arg.is_empty() => match node.client().lookup(arg).await {
                Ok(Some(path)) => println!("Downloaded {} to {}", arg, path.display()),
                Ok(None) => println!("{}: no peer could deliver the file", arg),
                Err(e) => error!("Lookup of {} failed: {:#}", arg, e),
            },
            "list" => match node.client().list().await {
                Ok(names) if names.is_empty() => println!("The index is empty"),
                Ok(names) => names.iter().for_each(|name| println!("  {}", name)),
                Err(e) => error!("Failed to list the index: {}", e),
            },
            "ls" => {
                let files = node.client().local_files().await;
                if files.is_empty() {
                    println!("No local files registered");
                }
                for (name, size) in files {
                    println!("  {:<40} {:>12} bytes", name, size);
                }
            }
            "exit" | "quit" | "q" => break,
            _ => {
                error!("Unknown command or missing argument: {}", input);
                print_help();
            }
        }
    }

    info!("Shutting down...");
    node.shutdown().await;
    Ok(())
}

fn print_help() {
    println!("\nAvailable commands:");
    println!("  register <path>  - Register a local file and replicate it");
    println!("  search <name>    - Show which peers hold a file");
    println!("  lookup <name>    - Download a file from a peer");
    println!("  list             - List every file in the index");
    println!("  ls               - List files served by this peer");
    println!("  help, h          - Show this help");
    println!("  exit, quit, q    - Leave the network and exit");
    println!();
}

// Progress reporting for replicas pushed to us
fn report_progress(status: TransferStatus) {
    match status {
        TransferStatus::Started { file_name, file_size, .. } => {
            let size_mb = file_size as f64 / (1024.0 * 1024.0);
            info!("Receiving replica {} ({:.2} MB)", file_name, size_mb);
        }
        TransferStatus::Progress { .. } => {}
        TransferStatus::Completed {
            bytes_transferred,
            elapsed_seconds,
            throughput_mbps,
            ..
        } => {
            let size_mb = bytes_transferred as f64 / (1024.0 * 1024.0);
            info!(
                "Replica received: {:.2} MB in {:.2}s ({:.2} MB/s)",
                size_mb, elapsed_seconds, throughput_mbps
            );
        }
        TransferStatus::Failed { error, .. } => {
            error!("Replica transfer failed: {}", error);
        }
    }
}
