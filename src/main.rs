use std::time::Duration;

use anyhow::Context;
use futures::{StreamExt, stream};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use portfolio_assist::config::AppConfig;
use portfolio_assist::desk::Desk;

const THREAD_ID: &str = "cli";

const DEMO_SCRIPT: &[&str] = &[
    "hello",
    "Please run a thematic analysis on AI innovation for account ACC12345",
    "how is it going?",
];

/// Stderr logging filtered by `RUST_LOG`, plus a daily log file when
/// `PORTFOLIO_LOG_DIR` is set. The guard must live as long as the process.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("PORTFOLIO_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "portfolio-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = AppConfig::from_env().context("invalid PORTFOLIO_* configuration")?;
    let desk = Desk::with_mocks(config).context("failed to build the desk")?;

    eprintln!("📈 Portfolio Assist v{}", env!("CARGO_PKG_VERSION"));

    if std::env::args().any(|arg| arg == "--demo") {
        run_demo(&desk).await;
    } else {
        eprintln!("   Type a message and press Enter. /jobs lists jobs, /quit exits.\n");
        run_repl(&desk).await;
    }

    desk.shutdown().await;
    Ok(())
}

async fn run_repl(desk: &Desk) {
    let lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input = stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Error reading stdin: {}", e);
                None
            }
        }
    })
    .boxed();

    eprint!("> ");
    while let Some(line) = input.next().await {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/jobs" => {
                for job in desk.registry().list().await {
                    println!(
                        "{} {} {:>3.0}% {}",
                        job.status.emoji(),
                        job.job_id,
                        job.progress * 100.0,
                        job.status
                    );
                }
            }
            utterance => {
                let reply = desk.submit_conversation_turn(THREAD_ID, utterance).await;
                println!("\n{reply}\n");
            }
        }
        eprint!("> ");
    }
}

async fn run_demo(desk: &Desk) {
    for utterance in DEMO_SCRIPT {
        println!("you> {utterance}");
        let reply = desk.submit_conversation_turn(THREAD_ID, utterance).await;
        println!("desk> {reply}\n");
    }

    let Some(job_id) = desk
        .conversation(THREAD_ID)
        .await
        .and_then(|c| c.last_job_id)
    else {
        return;
    };

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(job) = desk.get_job_status(&job_id).await else {
            break;
        };
        if job.status.is_terminal() {
            break;
        }
        eprintln!("   {} {:.0}%", job.status, job.progress * 100.0);
    }

    let utterance = format!("status of {job_id}");
    println!("you> {utterance}");
    let reply = desk.submit_conversation_turn(THREAD_ID, &utterance).await;
    println!("desk> {reply}");
}
