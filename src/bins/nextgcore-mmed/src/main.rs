//! NextGCore MME (Mobility Management Entity)
//!
//! Runs the MME task. Transport adapters feed `MmeEvent`s through the
//! event sender and consume the outbound S1AP and indication channels.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use nextgcore_mmed::context::SharedRegistries;
use nextgcore_mmed::event::{AppIndication, MmeEvent};
use nextgcore_mmed::s1ap_build::OutboundS1ap;
use nextgcore_mmed::timer::TokioTimerService;
use nextgcore_mmed::{sm, ConfigFile, Fsm, MmeContext, MmeFsm};

/// NextGCore MME - Mobility Management Entity
#[derive(Parser, Debug)]
#[command(name = "nextgcore-mmed")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC Mobility Management Entity")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nextgcore/mme.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides `logger.level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Disable color output
    #[arg(long)]
    no_color: bool,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

/// MME application state
pub struct MmeApp {
    /// Running flag
    running: Arc<AtomicBool>,
    /// MME state machine, handed to the task by `run_async`
    fsm: Option<MmeFsm>,
    /// Inbound event queue
    event_tx: Option<mpsc::Sender<MmeEvent>>,
    event_rx: Option<mpsc::Receiver<MmeEvent>>,
    /// Registries readable by transport tasks
    shared: Option<SharedRegistries>,
}

impl MmeApp {
    /// Create a new MME application
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            fsm: None,
            event_tx: None,
            event_rx: None,
            shared: None,
        }
    }

    /// Build the MME context from a loaded configuration
    pub fn init(&mut self, config: ConfigFile) -> Result<()> {
        log::info!("Initializing MME...");
        log::debug!(
            "max_enb={} max_ue={} served_tai={}",
            config.mme.max_enb,
            config.mme.max_ue,
            config.mme.served_tai.len()
        );

        let (event_tx, event_rx) = mpsc::channel(config.mme.event_queue_size);
        let timers = TokioTimerService::new(event_tx.clone());
        let ctx = MmeContext::new(config.mme, Box::new(timers));
        self.shared = Some(ctx.shared());

        let mut fsm = MmeFsm::new(ctx);
        fsm.init();
        log::debug!("MME state machine initialized: {:?}", fsm.state());

        self.fsm = Some(fsm);
        self.event_tx = Some(event_tx);
        self.event_rx = Some(event_rx);

        log::info!("MME initialized successfully");
        Ok(())
    }

    /// Run the MME task until shutdown
    pub async fn run_async(&mut self) -> Result<()> {
        let fsm = self.fsm.take().context("MME not initialized")?;
        let event_rx = self.event_rx.take().context("MME not initialized")?;

        let (s1ap_tx, s1ap_rx) = mpsc::channel::<OutboundS1ap>(1024);
        let (app_tx, app_rx) = mpsc::channel::<AppIndication>(1024);
        let s1ap_sink = tokio::spawn(log_outbound(s1ap_rx));
        let app_sink = tokio::spawn(log_indications(app_rx));

        log::info!("MME running...");
        let result = sm::run(fsm, event_rx, s1ap_tx, app_tx, Arc::clone(&self.running)).await;

        // The task owned the senders; the sinks finish once they drain
        s1ap_sink.await.context("S1AP sink task failed")?;
        app_sink.await.context("indication sink task failed")?;

        let fsm = result.context("MME task failed")?;
        if let Some(shared) = &self.shared {
            log::info!(
                "MME main loop exited ({} eNB association(s), {} UE(s))",
                shared.associations.len(),
                fsm.context().conn.len()
            );
        }
        Ok(())
    }

    /// Shutdown the MME application
    pub fn shutdown(&mut self) {
        log::info!("Shutting down MME...");
        self.event_tx = None;
        self.shared = None;
        log::info!("MME shutdown complete");
    }

    /// Sender for transport adapters
    pub fn event_sender(&self) -> Option<mpsc::Sender<MmeEvent>> {
        self.event_tx.clone()
    }

    /// Signal the application to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl Default for MmeApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Stand-in for the SCTP writer: log what would be sent
async fn log_outbound(mut rx: mpsc::Receiver<OutboundS1ap>) {
    while let Some(out) = rx.recv().await {
        log::debug!(
            "[assoc:{}] S1AP out (stream {}): {:?}",
            out.assoc_id,
            out.stream_id,
            out.message
        );
    }
}

/// Stand-in for the EMM/ESM layer: log indications
async fn log_indications(mut rx: mpsc::Receiver<AppIndication>) {
    while let Some(indication) = rx.recv().await {
        log::debug!("indication: {:?}", indication);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration; the logger is not up yet, so a missing file is
    // reported below
    let config = ConfigFile::load(&args.config)
        .with_context(|| format!("failed to load configuration '{}'", args.config))?;

    // Initialize logging
    let level_name = args.log_level.as_deref().unwrap_or(&config.logger.level);
    let log_level = match level_name.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut logger = env_logger::Builder::new();
    logger.filter_level(log_level).format_timestamp_millis();
    if args.no_color {
        logger.write_style(env_logger::WriteStyle::Never);
    }
    logger.init();

    log::info!("NextGCore MME v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);
    if !std::path::Path::new(&args.config).exists() {
        log::warn!("Config file '{}' not found. Using defaults.", args.config);
    }
    if args.daemon {
        log::warn!("daemon mode is handled by the service manager, staying in foreground");
    }

    // Create MME application
    let mut app = MmeApp::new();

    // Setup signal handlers
    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    // Initialize
    app.init(config)?;

    // Run main loop
    app.run_async().await?;

    // Shutdown
    app.shutdown();

    log::info!("NextGCore MME terminated");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
