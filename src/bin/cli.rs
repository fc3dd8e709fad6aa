use clap::{Parser, Subcommand};
use reqwest::{Client, StatusCode};

#[derive(Parser)]
#[command(name = "stat-channels-cli")]
#[command(about = "CLI for the stat_channels status API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:11111")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Daemon liveness and the last metrics snapshot
    Health,
    /// Every registered guild with its last outcome
    Guilds,
    Guild {
        #[arg(short, long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.url.trim_end_matches('/');

    let path = match &cli.command {
        Commands::Health => "/health".to_string(),
        Commands::Guilds => "/guilds".to_string(),
        Commands::Guild { id } => format!("/guilds/{}", id),
    };

    let res = client.get(format!("{}{}", base, path)).send().await?;
    match res.status() {
        StatusCode::NOT_FOUND => {
            if let Commands::Guild { id } = &cli.command {
                println!("Guild {} is not registered", id);
            } else {
                println!("Not found: {}", path);
            }
        }
        status if status.is_success() => {
            let body: serde_json::Value = res.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        status => {
            println!("Request failed ({}): {}", status, res.text().await?);
        }
    }

    Ok(())
}
