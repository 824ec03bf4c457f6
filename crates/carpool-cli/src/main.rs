mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use carpool_client::{ClientConfig, RemoteBackend};
use carpool_db::{Database, LocalBackend};
use carpool_sync::{Backend, SyncError};
use carpool_types::{Location, RoomId, UserId};

/// Taxi carpool rooms and chat from the terminal.
#[derive(Parser)]
#[command(name = "carpool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Backend project URL
    #[arg(long, env = "SUPABASE_URL", global = true)]
    url: Option<String>,

    /// Public anon key of the project
    #[arg(long, env = "SUPABASE_ANON_KEY", global = true, hide_env_values = true)]
    anon_key: Option<String>,

    /// Access token of the signed-in user. Defaults to the anon key.
    #[arg(long, env = "CARPOOL_ACCESS_TOKEN", global = true, hide_env_values = true)]
    access_token: Option<String>,

    /// Id of the signed-in user, used for membership flags and posting
    #[arg(long, env = "CARPOOL_USER_ID", global = true)]
    user_id: Option<UserId>,

    /// Use a local SQLite database instead of the hosted backend
    #[arg(long, env = "CARPOOL_DB", global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the rooms that are still recruiting
    Rooms,
    /// Follow a room's chat. Lines typed on stdin are sent as messages.
    Chat { room_id: RoomId },
    /// Create a room and take its first seat
    Create {
        #[arg(long)]
        from: Location,
        #[arg(long)]
        to: Location,
        /// Departure time (RFC 3339). Defaults to `--in-minutes` from now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 60)]
        in_minutes: i64,
        #[arg(long, default_value_t = 4)]
        capacity: u32,
    },
    /// Take a seat in a room
    Join { room_id: RoomId },
    /// Give up a seat
    Leave { room_id: RoomId },
    /// Split a fare and print payment links for the share. With `--room`
    /// and no payee flags, the links pay the room's host.
    Split {
        /// Total fare
        total: u64,
        /// Number of riders sharing it
        #[arg(long, conflicts_with = "room")]
        members: Option<i64>,
        /// Read the number of riders from a room's seats
        #[arg(long)]
        room: Option<RoomId>,
        /// Amounts are in dollars rather than won
        #[arg(long)]
        usd: bool,
        #[arg(long, requires = "toss_account")]
        toss_bank: Option<String>,
        #[arg(long, requires = "toss_bank")]
        toss_account: Option<String>,
        #[arg(long)]
        paypal: Option<String>,
    },
    /// Show your profile, or edit it when any field is given. An empty
    /// value clears the field.
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        paypal: Option<String>,
        #[arg(long)]
        toss_bank: Option<String>,
        #[arg(long)]
        toss_account: Option<String>,
    },
    /// Insert the sample rooms used for trying out the listing
    Seed,
    /// Check that the backend tables are reachable
    Check,
}

/// The backend a command talks to.
enum Target {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl Target {
    fn backend(&self) -> Arc<dyn Backend> {
        match self {
            Target::Local(local) => Arc::new(local.clone()),
            Target::Remote(remote) => Arc::new(remote.clone()),
        }
    }

    /// Reconnect counter of the event source. The local feed never drops.
    fn reconnections(&self) -> Option<watch::Receiver<u64>> {
        match self {
            Target::Local(_) => None,
            Target::Remote(remote) => Some(remote.reconnections()),
        }
    }
}

impl Cli {
    fn target(&self) -> anyhow::Result<Target> {
        if let Some(path) = &self.db {
            let local = LocalBackend::new(Database::open(path)?);
            info!(path = %path.display(), "using local database");
            return Ok(Target::Local(match self.user_id {
                Some(user_id) => local.as_user(user_id),
                None => local,
            }));
        }

        let url = self.url.clone().ok_or(SyncError::MissingField("SUPABASE_URL"))?;
        let anon_key = self
            .anon_key
            .clone()
            .ok_or(SyncError::MissingField("SUPABASE_ANON_KEY"))?;
        let config = ClientConfig::new(url, anon_key).with_access_token(self.access_token.clone());
        info!(url = %config.url, "using hosted backend");
        Ok(Target::Remote(RemoteBackend::new(config)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before parsing so flags can fall back to it
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carpool=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Rooms => {
            let target = cli.target()?;
            commands::watch_rooms(target.backend(), cli.user_id, target.reconnections()).await?;
        }
        Commands::Chat { room_id } => {
            let target = cli.target()?;
            commands::chat(target.backend(), *room_id, cli.user_id, target.reconnections()).await?;
        }
        Commands::Create {
            from,
            to,
            at,
            in_minutes,
            capacity,
        } => {
            let departure_time = at.unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(*in_minutes));
            let target = cli.target()?;
            commands::create_room(target.backend(), *from, *to, departure_time, *capacity).await?;
        }
        Commands::Join { room_id } => {
            commands::join(cli.target()?.backend(), *room_id).await?;
        }
        Commands::Leave { room_id } => {
            commands::leave(cli.target()?.backend(), *room_id).await?;
        }
        Commands::Split {
            total,
            members,
            room,
            usd,
            toss_bank,
            toss_account,
            paypal,
        } => {
            let backend = match room {
                Some(_) => Some(cli.target()?.backend()),
                None => None,
            };
            let members = match (members, room, &backend) {
                (Some(members), _, _) => *members,
                (None, Some(room_id), Some(backend)) => commands::seat_count(backend.clone(), *room_id).await?,
                _ => anyhow::bail!("pass --members or --room"),
            };
            let flagged = commands::payment_targets(toss_bank.clone(), toss_account.clone(), paypal.clone());
            let targets = commands::split_targets(backend.as_deref(), *room, flagged).await?;
            commands::split(*total, members, *usd, &targets)?;
        }
        Commands::Profile {
            name,
            paypal,
            toss_bank,
            toss_account,
        } => {
            let user_id = cli.user_id.ok_or(SyncError::MissingField("CARPOOL_USER_ID"))?;
            let edit = commands::ProfileEdit {
                full_name: name.clone(),
                paypal_id: paypal.clone(),
                toss_bank_name: toss_bank.clone(),
                toss_account_no: toss_account.clone(),
            };
            commands::profile(cli.target()?.backend(), user_id, edit).await?;
        }
        Commands::Seed => match cli.target()? {
            Target::Local(local) => commands::seed_local(&local).await?,
            Target::Remote(remote) => commands::seed_remote(&remote).await?,
        },
        Commands::Check => match cli.target()? {
            Target::Remote(remote) => commands::check(&remote).await?,
            Target::Local(_) => anyhow::bail!("check reads the hosted backend; drop --db"),
        },
    }

    Ok(())
}
