use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};

use lead_funnel::api::{self, AppState, SessionRegistry, spawn_session_expiry};
use lead_funnel::config::ServiceConfig;
use lead_funnel::delivery::{
    DeliveryRunner, EmailNotifier, HttpWebhook, Notifier, Webhook, spawn_delivery_worker,
};
use lead_funnel::funnel::catalog::insurance_funnel;
use lead_funnel::funnel::state::Sender;
use lead_funnel::funnel::{
    ActionOutcome, ChoiceOption, FunnelDeps, FunnelEvent, FunnelSession, StepGraph,
    TranscriptEntry,
};
use lead_funnel::lead::{Attribution, LeadSubmission};
use lead_funnel::services::{HttpQuoteLookup, HttpVerificationService};
use lead_funnel::store::LibSqlBackend;

/// Shared wiring for both commands.
struct Runtime {
    db: Arc<LibSqlBackend>,
    graph: Arc<StepGraph>,
    deps: FunnelDeps,
    submission: Arc<LeadSubmission>,
}

async fn build(config: &ServiceConfig) -> anyhow::Result<Runtime> {
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let graph = Arc::new(insurance_funnel(&config.agent_phone).context("Invalid funnel graph")?);
    let submission = Arc::new(LeadSubmission::new(db.clone(), db.clone()));
    let deps = FunnelDeps {
        quotes: Arc::new(HttpQuoteLookup::new(&config.quotes_api_url)),
        verifier: Arc::new(HttpVerificationService::new(&config.verify_api_url)),
        submitter: submission.clone(),
    };
    Ok(Runtime {
        db,
        graph,
        deps,
        submission,
    })
}

fn delivery_runner(config: &ServiceConfig, db: &Arc<LibSqlBackend>) -> Arc<DeliveryRunner> {
    let webhook = config
        .delivery
        .webhook_url
        .as_ref()
        .map(|url| Arc::new(HttpWebhook::new(url.clone())) as Arc<dyn Webhook>);
    let notifier = config
        .notification
        .clone()
        .map(|n| Arc::new(EmailNotifier::new(n)) as Arc<dyn Notifier>);
    Arc::new(DeliveryRunner::new(
        db.clone(),
        db.clone(),
        webhook,
        notifier,
        config.delivery.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    let config = ServiceConfig::from_env().context("Failed to load configuration")?;

    match command.as_str() {
        "serve" => serve(config).await,
        "chat" => chat(config).await,
        other => {
            eprintln!("Usage: lead-funnel [serve|chat]");
            anyhow::bail!("Unknown command '{other}'")
        }
    }
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let rt = build(&config).await?;

    eprintln!("Lead funnel v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Webhook: {}",
        config.delivery.webhook_url.as_deref().unwrap_or("disabled")
    );
    eprintln!(
        "   Email: {}",
        config
            .notification
            .as_ref()
            .map(|n| n.to_address.as_str())
            .unwrap_or("disabled")
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = spawn_delivery_worker(delivery_runner(&config, &rt.db), shutdown_rx.clone());
    let sessions = Arc::new(SessionRegistry::new());
    let expiry = spawn_session_expiry(sessions.clone(), config.session_ttl, shutdown_rx);

    let app = api::router(AppState {
        graph: rt.graph,
        deps: rt.deps,
        timing: config.timing,
        sessions,
        leads: rt.db.clone(),
        queue: rt.db.clone(),
        submission: rt.submission,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");
    eprintln!("   API: http://0.0.0.0:{}/api/sessions\n", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutting down");
            shutdown_tx.send_replace(true);
        })
        .await
        .context("HTTP server failed")?;

    worker.await.context("Delivery worker panicked")?;
    expiry.await.context("Session expiry task panicked")?;
    Ok(())
}

fn print_entry(entry: &TranscriptEntry) {
    println!("\n{}", entry.text);
    for quote in &entry.quotes {
        println!(
            "   {:<28} ${}/mo  (${}/yr, {})",
            quote.carrier_name, quote.monthly_rate, quote.annual_rate, quote.rating
        );
    }
    for (i, option) in entry.options.iter().enumerate() {
        println!("   {}) {}", i + 1, option.label);
    }
}

/// A number picks the matching option; anything else is sent as typed.
fn pick_option(options: &[ChoiceOption], input: &str) -> String {
    input
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| options.get(i))
        .map(|o| o.value.clone())
        .unwrap_or_else(|| input.to_string())
}

async fn chat(config: ServiceConfig) -> anyhow::Result<()> {
    let rt = build(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = spawn_delivery_worker(delivery_runner(&config, &rt.db), shutdown_rx);

    let mut session = FunnelSession::new(rt.graph, rt.deps, config.timing, Attribution::default());
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FunnelEvent::Message { entry }) if entry.sender == Sender::Bot => {
                    print_entry(&entry)
                }
                Ok(FunnelEvent::Completed { lead_id }) => {
                    match lead_id {
                        Some(id) => println!("\n[lead {id} captured]"),
                        None => println!("\n[conversation finished]"),
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    eprintln!("Type an answer or an option number. /resend, /change, /quit.");
    session.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while !session.phase().is_terminal() {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let outcome = match line.trim() {
            "" => continue,
            "/quit" => {
                session.abandon();
                break;
            }
            "/resend" => session.resend_code().await?,
            "/change" => session.change_channel().await?,
            input => {
                let Some(step_id) = session.current_step().map(str::to_string) else {
                    break;
                };
                let value = pick_option(session.pending_options(), input);
                session.submit_answer(&step_id, &value).await?
            }
        };
        if outcome == ActionOutcome::Ignored {
            eprintln!("(nothing to do with that right now)");
        }
    }

    // Dropping the session closes the event channel and ends the printer.
    drop(session);
    printer.await.context("Printer task panicked")?;
    shutdown_tx.send_replace(true);
    worker.await.context("Delivery worker panicked")?;
    Ok(())
}
