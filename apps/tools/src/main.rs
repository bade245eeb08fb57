use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::UserId;
use storage::{NewAuthSession, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/histmirror.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stores an authenticated session for the scheduler to pick up.
    RegisterSession {
        #[arg(long)]
        app_id: i64,
        #[arg(long)]
        app_hash: String,
        #[arg(long, default_value = "")]
        phone: String,
        /// File holding the opaque session blob produced by the login flow.
        #[arg(long)]
        session_file: std::path::PathBuf,
        #[arg(long)]
        user_id: Option<i64>,
    },
    ListUsers,
    ShowCursor {
        user_id: i64,
    },
    /// Forces the next pass for this account to bootstrap.
    ResetCursor {
        user_id: i64,
    },
    SetActive {
        user_id: i64,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::RegisterSession {
            app_id,
            app_hash,
            phone,
            session_file,
            user_id,
        } => {
            let session_data = std::fs::read_to_string(&session_file)
                .with_context(|| format!("failed to read {}", session_file.display()))?;
            let session_data = session_data.trim();
            if session_data.is_empty() {
                bail!("session file {} is empty", session_file.display());
            }
            let session_id = storage
                .insert_auth_session(&NewAuthSession {
                    user_id: user_id.map(UserId),
                    app_id,
                    app_hash,
                    phone,
                    session_data: session_data.to_string(),
                    is_active: true,
                })
                .await?;
            println!("registered session_id={session_id}");
        }
        Command::ListUsers => {
            for user in storage.list_users().await? {
                let last_sync = user
                    .last_sync_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!(
                    "{}\t{}\tactive={}\tlast_sync={last_sync}",
                    user.id,
                    user.display_name(),
                    user.is_active
                );
            }
        }
        Command::ShowCursor { user_id } => {
            let cursor = storage.get_sync_cursor(UserId(user_id)).await?;
            if cursor.is_zero() {
                println!("user {user_id} has no cursor; next pass bootstraps");
            } else {
                println!("user {user_id}: {cursor}");
            }
        }
        Command::ResetCursor { user_id } => {
            storage.reset_sync_cursor(UserId(user_id)).await?;
            println!("cursor reset for user {user_id}");
        }
        Command::SetActive { user_id, active } => {
            if !storage.set_user_active(UserId(user_id), active).await? {
                bail!("user {user_id} not found");
            }
            if !active {
                let closed = storage
                    .deactivate_sessions_for_user(UserId(user_id))
                    .await?;
                println!("deactivated {closed} session(s)");
            }
            println!("user {user_id} active={active}");
        }
    }

    Ok(())
}
