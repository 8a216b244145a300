mod controller;
mod source;
mod worker;

use controller::{CaptureController, CaptureEvent};
use score_capture_common::config::Config;
use score_capture_pipeline::SessionOutput;
use source::{NoopIndicator, ReplaySource};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = ?config.capture.mode,
        sensitivity = config.capture.sensitivity,
        start_delay_secs = config.capture.start_delay_secs,
        tick_interval_ms = config.capture.tick_interval_ms,
        output = %config.output.dir.display(),
        "starting score capture"
    );

    let source = match ReplaySource::open(&config.source.replay_dir) {
        Ok(s) => {
            info!(screens = s.len(), "replaying screenshots");
            s
        }
        Err(e) => {
            error!(error = %e, "failed to open frame source");
            std::process::exit(1);
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    let max_duration_secs = config.capture.max_duration_secs;
    let mut controller = CaptureController::new(config, source, NoopIndicator, events_tx);
    let (stop_tx, stop_rx) = oneshot::channel();
    let session = tokio::spawn(async move {
        let result = controller.run_session(stop_rx).await;
        debug!(state = ?controller.state(), "controller released");
        result
    });

    wait_for_stop(max_duration_secs).await;
    let _ = stop_tx.send(());

    match session.await {
        Ok(Ok(output)) => report(&output),
        Ok(Err(e)) => {
            error!(error = %e, "capture session failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "capture task panicked");
            std::process::exit(1);
        }
    }
}

/// Resolve on Ctrl-C, or after `max_secs` when it is non-zero.
async fn wait_for_stop(max_secs: u64) {
    let limit = async {
        if max_secs == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(max_secs)).await
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("interrupt received, stopping capture"),
            Err(e) => warn!(error = %e, "failed to listen for interrupt, stopping capture"),
        },
        _ = limit => info!(max_secs, "capture time limit reached"),
    }
}

fn log_event(event: &CaptureEvent) {
    match event {
        CaptureEvent::Status(status) => info!(status = status.as_str(), "status"),
        CaptureEvent::Saved { seq, path } => debug!(seq, path = %path.display(), "saved"),
        CaptureEvent::BufferUpdated { delta, total_width } => debug!(
            delta_width = delta.width(),
            total_width,
            "buffer updated"
        ),
        CaptureEvent::TickSkipped => debug!("tick skipped, worker busy"),
        CaptureEvent::AcquisitionFailed(reason) => warn!(reason = reason.as_str(), "acquisition failed"),
        CaptureEvent::Finished { images } => info!(images, "capture finished"),
    }
}

fn report(output: &SessionOutput) {
    if let SessionOutput::Slices {
        panorama, cuts, ..
    } = output
    {
        info!(
            panorama_width = panorama.as_ref().map(|p| p.width()).unwrap_or(0),
            cuts = ?cuts.iter().collect::<Vec<_>>(),
            "panorama sliced"
        );
    }
    for image in output.images() {
        info!(seq = image.seq, path = %image.path.display(), "output image");
    }
    info!(total = output.len(), "done");
}
