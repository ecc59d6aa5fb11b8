use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use exchange_core::adapters::http::{self, AppState};
use exchange_core::cli;
use exchange_core::registry::Exchange;

#[derive(Parser)]
#[command(name = "exchange-cli")]
#[command(version = "0.1", about = "A demo of a limit-order-book matching engine")]
struct Cli {
    #[command(subcommand)]
    command: TopCommand,
}

#[derive(Subcommand)]
enum TopCommand {
    /// Run the HTTP/WebSocket server.
    Serve {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Run a single demo command against an ephemeral in-process exchange.
    #[command(flatten)]
    Demo(cli::Commands),
}

async fn serve(port: u16) -> anyhow::Result<()> {
    let state = AppState::new();
    let app = http::router(state);
    let endpoint = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&endpoint).await?;
    tracing::info!(%endpoint, "HTTP/WS server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    match cli.command {
        TopCommand::Serve { port } => serve(port).await?,
        TopCommand::Demo(command) => {
            let exchange = Exchange::new();
            cli::run(command, &exchange)?;
        }
    }
    Ok(())
}
