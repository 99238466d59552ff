use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use montane::connection::ConnectionClass;
use montane::request::{RequestFlags, CURRENT_DATACENTER};
use montane::{Delegate, Engine, EventLoop};

/// Run a single Montane engine instance through its event loop.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Instance number to bind the engine under.
    #[arg(long, default_value_t = 1)]
    instance: i32,

    /// Directory to persist tgnet.dat into.
    #[arg(long, default_value = "./montane-data")]
    data_dir: PathBuf,

    /// Use the test-backend bootstrap datacenter list.
    #[arg(long)]
    test_backend: bool,

    /// How many seconds of event-loop ticks to run before exiting.
    #[arg(long, default_value_t = 5)]
    run_secs: u64,
}

struct LoggingDelegate;

impl Delegate for LoggingDelegate {
    fn on_session_created(&self) {
        info!("session created");
    }

    fn on_logout(&self) {
        info!("logged out");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir).expect("failed to create data dir");

    let delegate: Arc<dyn Delegate> = Arc::new(LoggingDelegate);
    let engine = Engine::new(args.instance, args.data_dir.clone(), args.test_backend, delegate);
    let mut event_loop = EventLoop::new(engine);

    let tasks = event_loop.task_sender();
    let _ = tasks.send(Box::new(|coordinator| {
        coordinator.send_request(
            b"demo.getConfig".to_vec(),
            RequestFlags::WITHOUT_LOGIN,
            CURRENT_DATACENTER,
            ConnectionClass::Generic,
            Box::new(|result| {
                info!(?result, "demo request completed");
            }),
        );
    }));

    let _ = tokio::time::timeout(Duration::from_secs(args.run_secs), event_loop.run()).await;

    event_loop.engine_mut().save_config(args.test_backend);
}
