use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use client_core::{
    ApiClient, DashboardOrchestrator, DurableCredentialStore, SessionManager, SessionState,
    SliceState,
};
use shared::{domain::NewsCategory, protocol::ProfileUpdate};

#[derive(Parser, Debug)]
#[command(about = "Weather & news dashboard client")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8000/api")]
    server_url: String,
    /// Directory holding the local client database; defaults to the
    /// platform temp dir so quick trials need no setup.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account; sign in separately afterwards.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        city: Option<String>,
    },
    /// Exchange credentials for a session that survives restarts.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Print weather and headlines for the restored session.
    Show {
        #[arg(long)]
        category: Option<String>,
    },
    /// Update the profile name and/or city.
    SetProfile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        city: Option<String>,
    },
    /// Drop the stored session.
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| std::env::temp_dir().join("dashboard_client"));
    let database_url = DurableCredentialStore::sqlite_url_for_data_dir(&data_dir);
    let credentials = DurableCredentialStore::initialize(&database_url).await?;
    let api = ApiClient::new(&args.server_url, credentials.clone())?;
    let session = SessionManager::new(api.clone(), credentials);

    session.restore().await;

    match args.command {
        Command::Register {
            name,
            email,
            password,
            city,
        } => {
            session.register(&name, &email, &password, city).await?;
            println!("Account created for {email}; run `login` to sign in.");
        }
        Command::Login { email, password } => {
            let profile = session.login(&email, &password).await?;
            println!("Signed in as {} <{}>", profile.name, profile.email);
        }
        Command::Show { category } => {
            let profile = match session.state().await {
                SessionState::Authenticated(profile) => profile,
                _ => return Err(anyhow!("no stored session; run `login` first")),
            };
            println!(
                "Hello {} ({})",
                profile.name,
                profile.city.as_deref().unwrap_or("no city set")
            );

            let category = match category {
                Some(raw) => NewsCategory::parse(&raw)
                    .ok_or_else(|| anyhow!("unknown news category '{raw}'"))?,
                None => NewsCategory::default(),
            };

            let dashboard = DashboardOrchestrator::new(api);
            dashboard.fetch_weather().await;
            dashboard.switch_category(category).await;
            print_dashboard(&dashboard).await;
        }
        Command::SetProfile { name, city } => {
            let update = ProfileUpdate { name, city };
            if update.is_empty() {
                return Err(anyhow!("nothing to update; pass --name and/or --city"));
            }
            let profile = session.update_profile(update).await?;
            println!(
                "Profile saved: {} / {}",
                profile.name,
                profile.city.as_deref().unwrap_or("no city set")
            );
        }
        Command::Logout => {
            session.logout().await;
            println!("Signed out.");
        }
    }

    Ok(())
}

async fn print_dashboard(dashboard: &DashboardOrchestrator) {
    let weather = dashboard.weather().await;
    match weather.report {
        Some(report) => {
            let cached = if report.from_cache { " (cached)" } else { "" };
            println!(
                "Weather in {}: {:.1}°C, wind {:.1} km/h, {}{}",
                report.city, report.temperature, report.windspeed, report.description, cached
            );
        }
        None => println!("Could not load weather data."),
    }

    let news = dashboard.news().await;
    if news.state == SliceState::Loaded && !news.articles.is_empty() {
        println!("Top {} headlines:", news.category);
        for article in &news.articles {
            println!("  {} [{}] {}", article.title, article.source, article.url);
        }
    } else {
        println!("No news available.");
    }
}
