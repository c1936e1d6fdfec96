use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

mod auth;
mod config;
mod dashboard;
mod db;
mod ingest;
mod models;
mod report;
mod risk;

use auth::{AuthProvider, PgAuth, Session, SessionContext};
use dashboard::{Action, Dashboard, Gate, Notice, NoticeLevel};
use db::PgStudentStore;
use ingest::{UploadOutcome, Uploader};

const NOT_SIGNED_IN: &str = "not signed in; run `student-risk-dashboard sign-in` first";

#[derive(Parser)]
#[command(name = "student-risk-dashboard")]
#[command(about = "Upload student records and review dropout risk", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Create an account
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign in and remember the session
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// End the current session
    SignOut,
    /// Request a password reset link
    ResetPassword {
        #[arg(long)]
        email: String,
    },
    /// Set a new password from a reset link token
    UpdatePassword {
        #[arg(long)]
        token: Uuid,
        #[arg(long)]
        password: String,
    },
    /// Show the signed-in account
    Whoami,
    /// Upload students from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Show one page of students
    List {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..))]
        page: i64,
        #[arg(long)]
        json: bool,
    },
    /// Show the student and at-risk totals
    Stats,
    /// Reload a page and the totals
    Refresh {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..))]
        page: i64,
    },
    /// Delete every student record
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = config::Config::from_env()?;

    tracing::info!(database = %config::redact_db_url(&config.database_url), "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    run(cli.command, &config, pool).await
}

async fn run(command: Commands, config: &config::Config, pool: PgPool) -> anyhow::Result<()> {
    let auth = PgAuth::new(pool.clone(), config.session_ttl);
    // The auth tables may not exist before init-db has run.
    let token = match command {
        Commands::InitDb => None,
        _ => read_session_token(&config.session_file)?,
    };
    let session = SessionContext::restore(&auth, token).await?;
    let mut dashboard = Dashboard::new(PgStudentStore::new(pool));

    match command {
        Commands::InitDb => {
            db::init_db(dashboard.store().pool()).await?;
            println!("Schema ready.");
        }
        Commands::SignUp { email, password } => {
            let user = auth.sign_up(&email, &password).await?;
            println!("Account created for {}. Sign in to continue.", user.email);
        }
        Commands::SignIn { email, password } => {
            let signed_in = auth.sign_in_with_password(&email, &password).await?;
            write_session_token(&config.session_file, &signed_in)?;
            println!("Logged in as {}.", signed_in.user.email);
            session.set(Some(signed_in));
        }
        Commands::SignOut => {
            dashboard.logout(&auth, &session).await?;
            remove_session_token(&config.session_file)?;
            print_notices(dashboard.take_notices());
        }
        Commands::ResetPassword { email } => {
            auth.reset_password_for_email(&email, &config.reset_redirect)
                .await?;
            println!("Password reset requested. Check your email for the reset link.");
        }
        Commands::UpdatePassword { token, password } => {
            auth.update_password(token, &password).await?;
            println!("Password updated. Sign in with the new password.");
        }
        Commands::Whoami => match session.current() {
            Some(current) => println!(
                "{} ({}), session expires {}",
                current.user.email, current.user.id, current.expires_at
            ),
            None => println!("Not signed in."),
        },
        Commands::Import { csv } => {
            let owner = require_session(&mut dashboard, &session).await?.user.id;
            let file = std::fs::File::open(&csv)
                .with_context(|| format!("failed to open {}", csv.display()))?;
            let uploader = Uploader::new(config.numeric_policy);
            let result = dashboard.upload(&uploader, file, owner).await;
            print_notices(dashboard.take_notices());
            if let UploadOutcome::NoValidData { rows_read } = result? {
                bail!("no valid data found in {} ({rows_read} rows read)", csv.display());
            }
            print!("{}", report::build_dashboard(dashboard.state()));
        }
        Commands::List { page, json } => {
            dashboard.start_at(page);
            require_session(&mut dashboard, &session).await?;
            print_notices(dashboard.take_notices());
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&dashboard.state().students)?
                );
            } else {
                print!("{}", report::build_dashboard(dashboard.state()));
            }
        }
        Commands::Stats => {
            require_session(&mut dashboard, &session).await?;
            print_notices(dashboard.take_notices());
            let state = dashboard.state();
            println!(
                "Total Students: {}",
                report::group_thousands(state.total_count)
            );
            println!(
                "At Risk Students: {}",
                report::group_thousands(state.at_risk_count)
            );
        }
        Commands::Refresh { page } => {
            dashboard.start_at(page);
            if dashboard.attach(&session) != Gate::Ready {
                bail!(NOT_SIGNED_IN);
            }
            dashboard.dispatch(Action::Refresh).await?;
            print_notices(dashboard.take_notices());
            print!("{}", report::build_dashboard(dashboard.state()));
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete every student record without --yes");
            }
            require_session(&mut dashboard, &session).await?;
            let result = dashboard.dispatch(Action::ClearAll).await;
            print_notices(dashboard.take_notices());
            result?;
            print!("{}", report::build_dashboard(dashboard.state()));
        }
    }

    dashboard.teardown();
    Ok(())
}

async fn require_session(
    dashboard: &mut Dashboard<PgStudentStore>,
    session: &SessionContext,
) -> anyhow::Result<Session> {
    match (dashboard.mount(session).await, session.current()) {
        (Gate::Ready, Some(current)) => Ok(current),
        _ => bail!(NOT_SIGNED_IN),
    }
}

fn print_notices(notices: Vec<Notice>) {
    for notice in notices {
        match notice.level {
            NoticeLevel::Info => println!("{}: {}", notice.title, notice.description),
            NoticeLevel::Destructive => eprintln!("{}: {}", notice.title, notice.description),
        }
    }
}

fn read_session_token(path: &Path) -> anyhow::Result<Option<Uuid>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let token = Uuid::parse_str(contents.trim())
                .with_context(|| format!("corrupt session file {}", path.display()))?;
            Ok(Some(token))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn write_session_token(path: &Path, session: &Session) -> anyhow::Result<()> {
    std::fs::write(path, session.token.to_string())
        .with_context(|| format!("failed to write {}", path.display()))
}

fn remove_session_token(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
