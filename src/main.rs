use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use token_broker::config::{keyring_from_env, BrokerConfig};
use token_broker::security::protection::generate_key;
use token_broker::store::VaultStore;
use token_broker::utils::logging;
use token_broker::{TokenBroker, UserIdentity};

#[derive(Parser)]
#[command(name = "token-broker", version = token_broker::VERSION, about = "Per-user OAuth2 token cache and silent refresh")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "broker.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a valid access token for a user, refreshing it if needed
    Acquire {
        /// Stable user identifier (object id claim)
        #[arg(long)]
        user: String,
        /// Resource the token is for
        #[arg(long)]
        resource: String,
    },
    /// List cached entries for a user without token material
    Inspect {
        #[arg(long)]
        user: String,
    },
    /// Delete everything cached for a user
    SignOut {
        #[arg(long)]
        user: String,
    },
    /// Generate a base64 protection key
    GenKey,
}

fn build_broker(config_path: &str) -> Result<TokenBroker> {
    let config = BrokerConfig::from_file(config_path)?;
    let keyring = keyring_from_env()?;
    let store = VaultStore::from_env(config.store_timeout())?
        .context("Vault is not configured (VAULT_ADDRESS, VAULT_TOKEN, VAULT_TOKEN_CACHE_PREFIX)")?;

    info!(
        authority = %config.authority,
        client_id = %config.client_id,
        key_id = %keyring.current_key_id(),
        "token broker initialized"
    );
    Ok(TokenBroker::with_http_endpoint(&config, Arc::new(store), &keyring)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = AppCli::parse();

    match args.command {
        Commands::Acquire { user, resource } => {
            let broker = build_broker(&args.config)?;
            let token = broker
                .acquire_token(&UserIdentity::new(user), &resource)
                .await?;
            println!("{}", token.token);
        }
        Commands::Inspect { user } => {
            let broker = build_broker(&args.config)?;
            let entries = broker.cached_entries(&UserIdentity::new(user)).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::SignOut { user } => {
            let broker = build_broker(&args.config)?;
            broker.sign_out(&UserIdentity::new(user)).await?;
        }
        Commands::GenKey => {
            println!("{}", generate_key()?);
        }
    }

    Ok(())
}
