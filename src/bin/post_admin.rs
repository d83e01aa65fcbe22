use clap::{Parser, Subcommand};
use larder::{
    Config, PostsManager,
    posts::{PostIdentity, parse_timestamp},
    startup_checks,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "post_admin")]
#[command(about = "Maintain a Larder post store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Overrides the configured log level
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List posts, newest first
    List {
        /// Zero-based page number
        #[arg(short, long, default_value_t = 0)]
        page: usize,
    },
    /// Show a single post
    Show {
        /// Post slug
        slug: String,
        /// Post date (epoch milliseconds, RFC 3339, or YYYY-MM-DD)
        date: String,
    },
    /// Compare the index against the post directories
    Check,
    /// Rebuild the index from the post directories
    Reload,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config).await?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.app.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(errors) = startup_checks::perform_startup_checks(&config).await {
        for error in errors {
            eprintln!("Error: {}", error);
        }
        std::process::exit(1);
    }

    let manager = PostsManager::new(config.posts);

    match cli.command {
        Commands::List { page } => {
            let entries = manager.get_posts_page(page).await?;
            let total_pages = manager.get_total_pages().await?;
            if entries.is_empty() {
                println!("No posts on page {}", page);
            } else {
                println!("Page {} of {}:", page + 1, total_pages.max(1));
                for entry in entries {
                    println!(
                        "  {}  {}  {}",
                        format_date(entry.identity.date),
                        entry.identity.slug,
                        entry.projection.title
                    );
                }
            }
        }
        Commands::Show { slug, date } => {
            let identity = PostIdentity::new(parse_timestamp(&date)?, slug);
            match manager.get_post(&identity).await {
                Ok(post) => {
                    println!("Title: {}", post.title);
                    println!("Slug:  {}", post.slug);
                    println!("Date:  {}", format_date(post.date));
                    if let Some(image) = &post.image {
                        println!("Image: uploads/{}", image);
                    }
                    println!();
                    println!("{}", post.body);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Check => {
            let report = manager.check_consistency().await?;
            if report.is_consistent() {
                println!("Index is consistent");
            } else {
                for identity in &report.missing_from_index {
                    println!("  missing from index: {}", identity);
                }
                for identity in &report.orphaned_entries {
                    println!("  orphaned entry:     {}", identity);
                }
                for skipped in &report.unreadable {
                    println!("  unreadable:         {} ({})", skipped.slug, skipped.reason);
                }
                println!("Run `post_admin reload` to rebuild the index");
                std::process::exit(2);
            }
        }
        Commands::Reload => {
            let report = manager.reload().await?;
            println!("Indexed {} posts", report.indexed);
            for skipped in &report.skipped {
                println!("  skipped {}: {}", skipped.slug, skipped.reason);
            }
        }
    }

    Ok(())
}

fn format_date(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|date| date.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}
