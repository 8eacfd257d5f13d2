use clap::Parser;
use log::{error, info};
use server::config::Args;
use server::console;
use server::game::World;
use server::network::Server;
use server::transport::ServerMessage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let (config, live) = args.into_config()?;

    info!("Starting server '{}' on {}", config.name, config.bind_addr);

    let mut server = Server::new(config, live, Box::new(World::new())).await?;

    let server_tx = server.message_sender();
    console::spawn_stdin_reader(server_tx.clone());
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                let _ = server_tx.send(ServerMessage::Shutdown);
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;

    Ok(())
}
