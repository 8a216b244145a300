use score_capture_common::frame::Frame;
use score_capture_pipeline::{CaptureSession, Decision, Discard, Processor, SessionOutput};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::source::AcquisitionError;

/// Controller → worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Process { session_id: u64, frame: Frame },
    /// Reply to `WorkerEvent::NeedCleanFrame`.
    CleanFrameReady {
        session_id: u64,
        result: Result<Frame, AcquisitionError>,
    },
    Finish { session_id: u64 },
}

impl WorkerCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerCommand::Process { .. } => "process",
            WorkerCommand::CleanFrameReady { .. } => "clean_frame_ready",
            WorkerCommand::Finish { .. } => "finish",
        }
    }

    pub fn session_id(&self) -> u64 {
        match *self {
            WorkerCommand::Process { session_id, .. }
            | WorkerCommand::CleanFrameReady { session_id, .. }
            | WorkerCommand::Finish { session_id } => session_id,
        }
    }
}

/// Worker → controller.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The frame in flight is a candidate; hide the indicator, grab again and
    /// reply with `CleanFrameReady`.
    NeedCleanFrame { session_id: u64 },
    Done { session_id: u64, decision: Decision },
    Finished { session_id: u64, output: SessionOutput },
}

enum CleanFrame {
    Ready(Frame),
    Unavailable,
    Finish,
}

/// Run `processor` for one session on the blocking pool.
///
/// The worker owns the processor and the session; the controller only sees
/// them again as the `SessionOutput` in `Finished`.
pub fn spawn(
    processor: Box<dyn Processor>,
    session: CaptureSession,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || run(processor, session, commands, events))
}

fn run(
    mut processor: Box<dyn Processor>,
    mut session: CaptureSession,
    mut commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let session_id = session.id();
    info!(session = session_id, mode = ?processor.mode(), "worker started");

    while let Some(command) = commands.blocking_recv() {
        match command {
            WorkerCommand::Process { session_id: id, frame } if id == session_id => {
                let decision = match processor.handle(&frame, &mut session) {
                    Decision::NeedCleanFrame => {
                        if events
                            .blocking_send(WorkerEvent::NeedCleanFrame { session_id })
                            .is_err()
                        {
                            return;
                        }
                        match wait_for_clean_frame(&mut commands, session_id) {
                            CleanFrame::Ready(clean) => processor.handle_clean(clean, &mut session),
                            CleanFrame::Unavailable => {
                                processor.abandon_candidate();
                                Decision::Discarded(Discard::CleanFrameUnavailable)
                            }
                            CleanFrame::Finish => {
                                processor.abandon_candidate();
                                finish(processor, session, &events);
                                return;
                            }
                        }
                    }
                    other => other,
                };
                if events
                    .blocking_send(WorkerEvent::Done {
                        session_id,
                        decision,
                    })
                    .is_err()
                {
                    return;
                }
            }
            WorkerCommand::Finish { session_id: id } if id == session_id => {
                finish(processor, session, &events);
                return;
            }
            other => ignore(session_id, &other),
        }
    }
    warn!(session = session_id, "command channel closed before finish");
}

fn wait_for_clean_frame(
    commands: &mut mpsc::Receiver<WorkerCommand>,
    session_id: u64,
) -> CleanFrame {
    while let Some(command) = commands.blocking_recv() {
        match command {
            WorkerCommand::CleanFrameReady {
                session_id: id,
                result,
            } if id == session_id => {
                return match result {
                    Ok(frame) => CleanFrame::Ready(frame),
                    Err(e) => {
                        debug!(session = session_id, error = %e, "clean frame unavailable");
                        CleanFrame::Unavailable
                    }
                };
            }
            WorkerCommand::Finish { session_id: id } if id == session_id => {
                return CleanFrame::Finish
            }
            other => ignore(session_id, &other),
        }
    }
    CleanFrame::Finish
}

fn ignore(session_id: u64, command: &WorkerCommand) {
    debug!(
        session = session_id,
        command = command.kind(),
        command_session = command.session_id(),
        "ignoring command"
    );
}

fn finish(
    processor: Box<dyn Processor>,
    mut session: CaptureSession,
    events: &mpsc::Sender<WorkerEvent>,
) {
    let session_id = session.id();
    let output = processor.finish(&mut session);
    debug!(session = session_id, images = output.len(), "worker finished");
    let _ = events.blocking_send(WorkerEvent::Finished { session_id, output });
}
