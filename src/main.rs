mod accounts;
mod commands;
mod config;
mod error;
mod files;
mod messages;
mod relay;
mod routes;
mod server;
mod store;

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use commands::Command;
use config::{Cli, NodeConfig};
use error::ChatError;
use files::FileManager;
use messages::{Message, MessageKind};
use relay::Relay;
use server::Server;
use store::Store;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ChatError> {
    let config = NodeConfig::resolve(cli)?;
    accounts::validate_username(&config.username)?;

    let store = Arc::new(Store::open(config.database_path())?);
    store.create_user(&config.username)?;
    let files = FileManager::new(&config.uploads_dir, config.max_upload_bytes).await?;

    let (relay, inbound) = Relay::new(config.username.clone(), store.clone());
    relay.listen(config.p2p_addr()).await?;
    for peer in &config.peers {
        if let Err(e) = relay.connect(peer).await {
            log::error!("Failed to connect to peer {peer}: {e}");
        }
    }

    let server = Server::new(config.username.clone(), store, relay, Arc::new(files));
    tokio::spawn(server.clone().run_inbound(inbound));
    let feed = server.clone();
    tokio::spawn(async move {
        if let Err(e) = show_incoming(feed).await {
            log::error!("Console feed stopped: {e}");
        }
    });

    tokio::select! {
        () = serve(server.clone(), &config) => {}
        () = console(server) => {}
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    println!("Goodbye {}…", config.username);
    Ok(())
}

async fn serve(server: Server, config: &NodeConfig) {
    let routes = routes::routes(server, config.static_dir.clone());
    let addr = config.api_addr();
    match &config.tls {
        Some(tls) => {
            log::info!("Starting secure API (HTTPS/WSS) on {addr}...");
            warp::serve(routes)
                .tls()
                .cert_path(&tls.cert)
                .key_path(&tls.key)
                .run(addr)
                .await;
        }
        None => {
            log::info!("API listening on {addr}...");
            warp::serve(routes).run(addr).await;
        }
    }
}

/// Prints what reaches the node user: relayed and local messages it can
/// see, plus presence notices. Its own chat is not echoed back.
async fn show_incoming(server: Server) -> Result<(), ChatError> {
    let node = server.node_name().to_string();
    let mut feed = server.event_stream(node.clone()).await?;
    while let Some(message) = feed.next().await {
        if message.sender == node && message.kind != MessageKind::Notification {
            continue;
        }
        println!("{message}");
    }
    Ok(())
}

/// Reads commands for the node user from stdin until `/exit`.
async fn console(server: Server) {
    let node = server.node_name().to_string();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // Detached from a terminal: keep serving.
            Ok(None) => return std::future::pending().await,
            Err(e) => {
                log::error!("Failed to read stdin: {e}");
                return std::future::pending().await;
            }
        };

        let outcome = match commands::parse(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Exit)) => return,
            Ok(Some(Command::Subscribe(topic))) => server
                .subscribe(&node, &topic)
                .await
                .map(|topic| format!("Subscribed to {topic}")),
            Ok(Some(Command::Unsubscribe(topic))) => server
                .unsubscribe(&node, &topic)
                .await
                .map(|topic| format!("Unsubscribed from {topic}")),
            Ok(Some(Command::Topic { topic, text })) => server
                .publish(Message::chat(node.as_str(), text).with_topic(topic))
                .await
                .map(|_| String::new()),
            Ok(Some(Command::Say(text))) => server
                .publish(Message::chat(node.as_str(), text))
                .await
                .map(|_| String::new()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reply) if reply.is_empty() => {}
            Ok(reply) => println!("{reply}"),
            Err(e) => println!("{e}"),
        }
    }
}
