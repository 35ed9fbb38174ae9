use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use env_logger::Env;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use ring_dht::client::{scripted_request, Client};
use ring_dht::config::{Config, Role};
use ring_dht::coordinator::Coordinator;
use ring_dht::node::object_log::ObjectLog;
use ring_dht::node::Node;
use ring_dht::peer_communication::{start_listener, Communicator};

/// Depth of the queue between the listener and the message handler
const INBOUND_QUEUE: usize = 1024;

fn config_path_from_command_line_arguments() -> Result<PathBuf> {
    let args = env::args().collect::<Vec<String>>();
    match args.as_slice() {
        [_, flag, path] if flag == "-c" => Ok(PathBuf::from(path)),
        _ => Err(anyhow!(
            "Usage: {} -c <config>",
            args.first().map(String::as_str).unwrap_or("ring_dht")
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::load(&config_path_from_command_line_arguments()?)?;
    if !config.delay.is_zero() {
        info!("Waiting {:?} before starting", config.delay);
        sleep(config.delay).await;
    }

    let address_book = Arc::new(config.address_book());
    let communicator = Arc::new(Communicator::over_tcp(address_book, config.retry_delay));
    let cancellation_token = CancellationToken::new();
    let (sender, inbound) = mpsc::channel(INBOUND_QUEUE);
    let (_, listener) = start_listener(config.listen_address, sender, cancellation_token.clone())
        .await
        .context("Failed to start listener")?;

    {
        let cancellation_token = cancellation_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                cancellation_token.cancel();
            }
        });
    }

    match config.role {
        Role::Coordinator => {
            info!("Coordinator started");
            Coordinator::new(communicator, config.client)
                .run(inbound, cancellation_token)
                .await;
        }
        Role::Node(peer_id) => {
            let node = Node::new(
                peer_id,
                config.coordinator,
                ObjectLog::new(config.object_file),
                communicator,
            );
            let running = tokio::spawn(node.clone().run(inbound, cancellation_token.clone()));
            node.join().await?;
            running.await?;
        }
        Role::Client {
            client_id,
            testcase,
        } => {
            let client = Client::new(client_id, config.coordinator, communicator);
            info!("Client {} started", client.client_id());
            let running = tokio::spawn(client.clone().run(inbound, None, cancellation_token));
            match testcase.and_then(scripted_request) {
                Some((operation, object_id)) => {
                    client.request(operation, object_id).await?;
                }
                None => warn!("No scripted request for test case {:?}", testcase),
            }
            running.await?;
        }
    }

    listener.await?;
    Ok(())
}
