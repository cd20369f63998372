//! Article Forge Admin CLI
//!
//! Command-line companion to the server: mint tokens, submit generations, follow a run
//! live, and answer review prompts.

use anyhow::{anyhow, bail, Context, Result};
use article_forge::{
    api::auth::{Identity, JwtAuthProvider, Role},
    api::types::DuplexMessage,
    client::{ApiClient, DuplexClient, SseWatcher, WatchEvent},
    config::{ForgeConfig, DEFAULT_CONFIG_FILE},
    GenerationRequest, ProgressEvent, ReviewDecision, Run, RunId, RunStatus,
};
use clap::{Parser, Subcommand};
use colored::*;
use dialoguer::{theme::ColorfulTheme, Confirm, Editor, Input, Select};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "forge-admin")]
#[command(about = "Article Forge Admin CLI - submit, watch, and review generation runs")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server base URL
    #[arg(long, env = "FORGE_SERVER", default_value = "http://localhost:4000")]
    server: String,

    /// Session token (see the `token` command)
    #[arg(long, env = "FORGE_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Mint a session token with the server's configured secret
    Token {
        /// User id to put in the token
        user_id: String,

        /// admin, editor, or viewer
        #[arg(long, default_value = "editor")]
        role: String,

        /// Config file holding the JWT secret
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Submit a new generation
    Submit {
        /// Article topic
        topic: String,

        #[arg(long, default_value = "longread")]
        content_type: String,

        /// Target keyword (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        /// Reference URL (repeatable)
        #[arg(long = "url")]
        input_urls: Vec<String>,

        /// Pause for review after the outline
        #[arg(long)]
        outline_review: bool,

        /// Pause for review after editing
        #[arg(long)]
        edit_review: bool,

        /// Follow the run right after submitting
        #[arg(long)]
        watch: bool,
    },

    /// Show one run
    Status { run_id: String },

    /// List runs
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 20)]
        per_page: usize,
    },

    /// Follow a run's progress live
    Watch {
        run_id: String,

        /// Prompt for review decisions as they come up
        #[arg(long)]
        interactive: bool,
    },

    /// Answer a review prompt
    Review {
        run_id: String,

        /// Stage to answer; when omitted, wait for the next prompt
        #[arg(long)]
        stage: Option<String>,

        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject with this feedback
        #[arg(long)]
        reject: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Token {
            user_id,
            role,
            config,
        } => mint_token(&user_id, &role, &config),

        Commands::Submit {
            topic,
            content_type,
            keywords,
            input_urls,
            outline_review,
            edit_review,
            watch,
        } => {
            let client = api_client(&cli.server, &cli.token)?;
            let mut request = GenerationRequest::new(topic);
            request.content_type = content_type;
            request.target_keywords = keywords;
            request.input_urls = input_urls;
            request.enable_outline_review = outline_review;
            request.enable_edit_review = edit_review;

            let created = client.create_generation(&request).await?;
            println!("{}", "Generation submitted!".green());
            print_run(&created.run);
            if !created.queued {
                println!("  {}", "(already queued)".yellow());
            }
            if watch {
                watch_run(&cli.server, &client, &created.run.id, outline_review || edit_review).await?;
            }
            Ok(())
        }

        Commands::Status { run_id } => {
            let client = api_client(&cli.server, &cli.token)?;
            let run = client.get_generation(&parse_run_id(&run_id)?).await?;
            print_run(&run);
            Ok(())
        }

        Commands::List { page, per_page } => {
            let client = api_client(&cli.server, &cli.token)?;
            let runs = client.list_generations(page, per_page).await?;
            println!(
                "\n📋 {} (page {}/{}, {} total)",
                "Generations".green().bold(),
                runs.page,
                runs.total_pages.max(1),
                runs.total
            );
            println!("=====================================");
            if runs.data.is_empty() {
                println!("No generations found.");
            }
            for run in &runs.data {
                println!(
                    "{}  {:<18} {}",
                    run.id.as_str().cyan(),
                    colored_status(run.status),
                    run.request.topic
                );
            }
            Ok(())
        }

        Commands::Watch {
            run_id,
            interactive,
        } => {
            let client = api_client(&cli.server, &cli.token)?;
            watch_run(&cli.server, &client, &parse_run_id(&run_id)?, interactive).await
        }

        Commands::Review {
            run_id,
            stage,
            approve,
            reject,
        } => {
            let client = api_client(&cli.server, &cli.token)?;
            let run_id = parse_run_id(&run_id)?;
            let decision = match (approve, reject) {
                (true, _) => Some(ReviewDecision::Approve),
                (false, Some(feedback)) => Some(ReviewDecision::Reject { feedback }),
                (false, None) => None,
            };
            match (stage, decision) {
                (Some(stage), Some(decision)) => {
                    let accepted = client.submit_review(&run_id, &stage, &decision).await?;
                    println!(
                        "{}",
                        format!("Sent {:?} for {}", accepted.action, accepted.stage).green()
                    );
                    Ok(())
                }
                (None, Some(_)) => bail!("--stage is required with --approve or --reject"),
                (_, None) => review_next_prompt(&cli.server, &client, &run_id).await,
            }
        }
    }
}

fn mint_token(user_id: &str, role: &str, config_path: &str) -> Result<()> {
    let role: Role = role.parse()?;
    let config = ForgeConfig::load_from(config_path)?;
    let provider = JwtAuthProvider::new(&config.auth);
    let token = provider.issue(&Identity::new(user_id, role))?;
    println!("{}", token);
    Ok(())
}

fn api_client(server: &str, token: &Option<String>) -> Result<ApiClient> {
    let token = token
        .clone()
        .ok_or_else(|| anyhow!("no token: pass --token or set FORGE_TOKEN"))?;
    Ok(ApiClient::new(server, token)?)
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw).with_context(|| format!("invalid run id '{}'", raw))
}

fn colored_status(status: RunStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        RunStatus::Completed => label.green(),
        RunStatus::Failed => label.red(),
        RunStatus::OutlineReview | RunStatus::EditReview => label.yellow(),
        _ => label.blue(),
    }
}

fn print_run(run: &Run) {
    println!("🧾 ID: {}", run.id.as_str().cyan());
    println!("   Topic: {}", run.request.topic);
    println!("   Status: {}", colored_status(run.status));
    if let Some(stage) = &run.current_stage {
        println!("   Stage: {}", stage);
    }
    println!("   Tokens: {}  Cost: ${:.4}", run.total_tokens, run.total_cost_usd);
    if let Some(result) = &run.result_ref {
        println!("   Result: {}", result.green());
    }
    if let Some(error) = &run.error_message {
        println!("   Error: {}", error.red());
    }
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠁", "⠂", "⠄", "⡀", "⢀", "⠠", "⠐", "⠈", "⠁"])
            .template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

async fn watch_run(server: &str, client: &ApiClient, run_id: &RunId, interactive: bool) -> Result<()> {
    // A finished run never publishes again
    let run = client.get_generation(run_id).await?;
    if run.status.is_terminal() {
        print_run(&run);
        return Ok(());
    }

    let watcher = SseWatcher::new(server, client.token())?;
    let mut events = watcher.watch(run_id)?;
    let pb = spinner();
    pb.set_message(format!("Waiting for {}", run_id));

    while let Some(event) = events.next().await {
        match event {
            WatchEvent::Connected => pb.set_message("Connected".to_string()),
            WatchEvent::Heartbeat => pb.tick(),
            WatchEvent::Reconnecting { attempt, delay } => {
                pb.set_message(format!("Reconnecting (attempt {}, in {:?})", attempt, delay));
            }
            WatchEvent::GaveUp { reason } => {
                pb.finish_and_clear();
                bail!(reason);
            }
            WatchEvent::Progress(progress) => {
                if let ProgressEvent::InterruptWaiting { stage, data } = &progress {
                    pb.println(format!("⏸️  {} is waiting for review", stage.yellow()));
                    if interactive {
                        let decision = pb.suspend(|| prompt_decision(stage, data))?;
                        client.submit_review(run_id, stage, &decision).await?;
                        pb.println(format!("🗳️  Decision sent for {}", stage));
                    }
                    continue;
                }
                describe(&pb, &progress);
                if progress.is_terminal() {
                    pb.finish_and_clear();
                    print_run(&client.get_generation(run_id).await?);
                    return Ok(());
                }
            }
        }
    }
    pb.finish_and_clear();
    Ok(())
}

fn describe(pb: &ProgressBar, event: &ProgressEvent) {
    match event {
        ProgressEvent::StageStarted { stage, .. } => pb.set_message(format!("Running {}", stage)),
        ProgressEvent::StageProgress {
            stage,
            message,
            percent,
        } => pb.set_message(match percent {
            Some(percent) => format!("{} {}% {}", stage, percent, message),
            None => format!("{} {}", stage, message),
        }),
        ProgressEvent::StageCompleted {
            stage, duration_ms, ..
        } => pb.println(format!("✅ {} ({} ms)", stage.green(), duration_ms)),
        ProgressEvent::StageFailed { stage, error } => {
            pb.println(format!("❌ {}: {}", stage.red(), error))
        }
        ProgressEvent::InterruptResumed { stage } => {
            pb.println(format!("▶️  {} resumed", stage))
        }
        ProgressEvent::GenerationCompleted { .. } => {
            pb.println(format!("{}", "Generation completed!".green().bold()))
        }
        ProgressEvent::GenerationFailed { error } => {
            pb.println(format!("{} {}", "Generation failed:".red().bold(), error))
        }
        ProgressEvent::InterruptWaiting { .. } | ProgressEvent::InterruptResponse { .. } => {}
    }
}

/// Ask the operator what to do with a paused stage
fn prompt_decision(stage: &str, data: &Value) -> Result<ReviewDecision> {
    let preview = match data {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other)?,
    };
    println!("\n{}", format!("Review: {}", stage).blue().bold());
    println!("{}", preview);

    let theme = ColorfulTheme::default();
    let choice = Select::with_theme(&theme)
        .with_prompt("Decision")
        .items(&["Approve", "Reject with feedback", "Edit and approve"])
        .default(0)
        .interact()?;

    match choice {
        0 => Ok(ReviewDecision::Approve),
        1 => {
            let feedback: String = Input::with_theme(&theme)
                .with_prompt("Feedback")
                .interact_text()?;
            Ok(ReviewDecision::Reject { feedback })
        }
        _ => {
            let edited = Editor::new()
                .edit(&preview)?
                .ok_or_else(|| anyhow!("edit cancelled"))?;
            let confirmed = Confirm::with_theme(&theme)
                .with_prompt("Submit the edited content?")
                .default(true)
                .interact()?;
            if !confirmed {
                bail!("edit cancelled");
            }
            Ok(ReviewDecision::Edit {
                content: Value::String(edited),
            })
        }
    }
}

/// Wait on the duplex relay for the next review prompt and answer it
async fn review_next_prompt(server: &str, client: &ApiClient, run_id: &RunId) -> Result<()> {
    let mut duplex = DuplexClient::connect(server, client.token()).await?;
    duplex.subscribe(run_id).await?;

    let pb = spinner();
    pb.set_message(format!("Waiting for a review prompt on {}", run_id));

    while let Some(message) = duplex.next_message().await? {
        match message {
            DuplexMessage::InterruptRequest { stage, data, .. } => {
                pb.finish_and_clear();
                let decision = prompt_decision(&stage, &data)?;
                duplex.decide(run_id, &stage, decision).await?;
                println!("{}", format!("Decision sent for {}", stage).green());
                duplex.close().await?;
                return Ok(());
            }
            DuplexMessage::Error { message } => {
                pb.finish_and_clear();
                bail!(message);
            }
            _ => {}
        }
    }
    pb.finish_and_clear();
    bail!("connection closed before a review prompt arrived")
}
