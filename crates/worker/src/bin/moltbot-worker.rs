use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tokio::net::UnixStream;
use tokio::signal::unix::{SignalKind, signal};
use tracing::error;
use types::init_tracing;
use worker::{EchoAgentHandler, SIGINT_GRACE_MS, SIGTERM_GRACE_MS, WorkerRuntime};

#[derive(Debug, Parser)]
#[command(name = "moltbot-worker", about = "Sandboxed moltbot worker child")]
struct Args {
    /// Supervisor socket to connect to.
    #[arg(long = "socket")]
    socket: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    std::panic::set_hook(Box::new(|info| {
        error!(panic = %info, "worker panicked");
    }));

    let stream = match UnixStream::connect(&args.socket).await {
        Ok(stream) => stream,
        Err(source) => {
            error!(
                socket = %args.socket.display(),
                error = %source,
                "failed to connect to supervisor socket"
            );
            return ExitCode::FAILURE;
        }
    };

    let runtime = WorkerRuntime::new(Arc::new(EchoAgentHandler));

    let term_handle = runtime.shutdown_handle();
    tokio::spawn(async move {
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            term.recv().await;
            term_handle.request(SIGTERM_GRACE_MS);
        }
    });
    let int_handle = runtime.shutdown_handle();
    tokio::spawn(async move {
        if let Ok(mut int) = signal(SignalKind::interrupt()) {
            int.recv().await;
            int_handle.request(SIGINT_GRACE_MS);
        }
    });

    match runtime.serve_stream(stream).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(source) => {
            error!(error = %source, "worker runtime terminated with a fatal error");
            ExitCode::FAILURE
        }
    }
}
