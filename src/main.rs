use color_eyre::{eyre::eyre, Result};
use nxpad::bluetooth::{ConsoleEndpoint, LoopbackFactory, SimulatedAdapter};
use nxpad::config::NxpadConfig;
use nxpad::controller::buttons::ControllerKind;
use nxpad::controller::macro_parser::{parse_macro, total_duration};
use nxpad::supervisor::{Platform, SupervisorContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEMO_MACRO: &str = "\
# press A three times, then push the left stick up
LOOP 3
    A 0.1s
    0.1s
L_STICK@+000+100 0.5s
0.2s
";

const DEMO_ADAPTER: &str = "hci0";
const DEMO_ADAPTER_ADDRESS: &str = "DC:A6:32:00:00:01";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let macro_text = match std::env::args().nth(1) {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read macro {}: {}", path, e))?,
        None => DEMO_MACRO.to_string(),
    };
    // reject bad input before any controller exists
    let steps = parse_macro(&macro_text)?;
    let run_time = total_duration(&steps);

    let config = NxpadConfig::load(&NxpadConfig::default_path()).await;
    let settings = config.supervisor_settings();
    let connect_timeout = settings.session.connect_timeout;

    let (transports, consoles) = LoopbackFactory::new();
    let platform = Platform {
        adapters: vec![Arc::new(SimulatedAdapter::new(DEMO_ADAPTER, DEMO_ADAPTER_ADDRESS))],
        transports: Arc::new(transports),
        store: config.connection_store(),
    };
    let context = SupervisorContext::new(settings, platform);

    let console = tokio::spawn(run_console(consoles));

    let index = context.create_session(ControllerKind::ProController, None).await?;
    let manager = context.manager().await?;
    manager.wait_for_connection(index, connect_timeout).await?;
    info!("Session {} connected", index);

    let id = context.submit_macro(index, &macro_text).await?;
    info!("Running {} ({:?} of input)", id, run_time);
    if !manager
        .wait_for_macro(index, id, run_time + Duration::from_secs(5))
        .await?
    {
        warn!("{} did not finish in time", id);
    }

    let report = context.get_state().await;
    info!("Final state: {:#?}", report);

    context.shutdown().await;
    match console.await {
        Ok(reports) => info!("Console received {} input reports", reports),
        Err(e) => warn!("Console task failed: {}", e),
    }
    Ok(())
}

/// Plays the console for the first link: pairs, then counts reports until the link closes
async fn run_console(mut consoles: mpsc::UnboundedReceiver<ConsoleEndpoint>) -> usize {
    let Some(mut console) = consoles.recv().await else {
        return 0;
    };
    info!("Console {} sees controller on {}", console.address(), console.adapter_id());
    if !console.complete_handshake(Duration::from_secs(2)).await {
        warn!("Console handshake failed");
        return 0;
    }

    let mut reports = 0;
    while console.next_report(Duration::from_secs(5)).await.is_some() {
        reports += 1;
    }
    reports
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
