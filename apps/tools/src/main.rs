use anyhow::Result;
use clap::{Parser, Subcommand};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/tree.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database, run migrations and insert the root.
    Init,
    /// Print the current tree as JSON.
    Dump {
        #[arg(long)]
        pretty: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Init => {
            if storage.ensure_root().await? {
                println!("created root in {}", cli.database_url);
            } else {
                println!("root already present in {}", cli.database_url);
            }
        }
        Command::Dump { pretty } => {
            let root = storage.fetch_tree().await?;
            let json = if pretty {
                serde_json::to_string_pretty(&root)?
            } else {
                serde_json::to_string(&root)?
            };
            println!("{json}");
        }
    }

    Ok(())
}
