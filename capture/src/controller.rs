use score_capture_common::config::Config;
use score_capture_common::frame::Frame;
use score_capture_pipeline::{
    for_mode, CaptureSession, Decision, LocalStorage, Processor, SessionOutput,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::source::{AcquisitionError, FrameSource, Indicator};
use crate::worker::{self, WorkerCommand, WorkerEvent};

/// Progress reported to whoever drives the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Status(String),
    Saved { seq: u64, path: PathBuf },
    /// Newly stitched columns, for a live preview.
    BufferUpdated { delta: Frame, total_width: u32 },
    /// A tick fired while the previous frame was still being processed.
    TickSkipped,
    AcquisitionFailed(String),
    Finished { images: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    CountingDown,
    Sampling,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("worker for session {0} went away")]
    WorkerGone(u64),
    #[error("worker task failed: {0}")]
    WorkerFailed(String),
}

/// Drives one capture session at a time: countdown, fixed-cadence sampling,
/// the hide → grab → show recapture on request, and the final hand-off.
///
/// Frame acquisition stays on the controller's task; comparison and
/// stitching run on the worker. At most one frame is in flight; ticks that
/// fire meanwhile are dropped.
pub struct CaptureController<S, I> {
    config: Config,
    source: S,
    indicator: I,
    events: mpsc::UnboundedSender<CaptureEvent>,
    state: ControllerState,
    next_session_id: u64,
}

impl<S: FrameSource, I: Indicator> CaptureController<S, I> {
    pub fn new(
        config: Config,
        source: S,
        indicator: I,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            config,
            source,
            indicator,
            events,
            state: ControllerState::Idle,
            next_session_id: 1,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Run a session until `stop` fires (or its sender is dropped).
    pub async fn run_session(
        &mut self,
        stop: oneshot::Receiver<()>,
    ) -> Result<SessionOutput, ControllerError> {
        let processor = for_mode(&self.config);
        self.run_with(processor, stop).await
    }

    async fn run_with(
        &mut self,
        processor: Box<dyn Processor>,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<SessionOutput, ControllerError> {
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let storage = LocalStorage::new(&self.config.output.dir, self.config.output.prefix.clone());
        let session = CaptureSession::new(session_id, storage);

        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (evt_tx, mut evt_rx) = mpsc::channel(1);
        let handle = worker::spawn(processor, session, cmd_rx, evt_tx);
        info!(
            session = session_id,
            mode = ?self.config.capture.mode,
            region = ?self.config.capture.region,
            "capture session started"
        );

        let stopped_early = self.count_down(&mut stop).await;
        if !stopped_early {
            self.sample(session_id, &mut stop, &cmd_tx, &mut evt_rx).await?;
        }

        self.state = ControllerState::Stopped;
        self.emit(CaptureEvent::Status("stopped".into()));
        let output = finish(session_id, &cmd_tx, &mut evt_rx).await?;
        if let Err(e) = handle.await {
            return Err(ControllerError::WorkerFailed(e.to_string()));
        }

        info!(session = session_id, images = output.len(), "capture session finished");
        self.emit(CaptureEvent::Finished {
            images: output.len(),
        });
        Ok(output)
    }

    /// Returns true if `stop` fired before the countdown ended.
    async fn count_down(&mut self, stop: &mut oneshot::Receiver<()>) -> bool {
        for remaining_secs in (1..=self.config.capture.start_delay_secs).rev() {
            self.state = ControllerState::CountingDown;
            self.emit(CaptureEvent::Status(format!(
                "{remaining_secs} seconds until capture"
            )));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = &mut *stop => {
                    info!(remaining_secs, "stopped during countdown");
                    return true;
                }
            }
        }
        false
    }

    async fn sample(
        &mut self,
        session_id: u64,
        stop: &mut oneshot::Receiver<()>,
        cmd_tx: &mpsc::Sender<WorkerCommand>,
        evt_rx: &mut mpsc::Receiver<WorkerEvent>,
    ) -> Result<(), ControllerError> {
        self.state = ControllerState::Sampling;
        self.emit(CaptureEvent::Status("capturing".into()));

        let period = Duration::from_millis(self.config.capture.tick_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = false;
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut *stop => return Ok(()),
                _ = ticker.tick() => {
                    ticks += 1;
                    if in_flight {
                        debug!(session = session_id, ticks, "previous frame still in flight, skipping tick");
                        self.emit(CaptureEvent::TickSkipped);
                        continue;
                    }
                    let Some(frame) = self.acquire(session_id) else {
                        continue;
                    };
                    cmd_tx
                        .send(WorkerCommand::Process { session_id, frame })
                        .await
                        .map_err(|_| ControllerError::WorkerGone(session_id))?;
                    in_flight = true;
                }
                event = evt_rx.recv() => {
                    match event.ok_or(ControllerError::WorkerGone(session_id))? {
                        WorkerEvent::NeedCleanFrame { session_id: id } => {
                            let result = self.grab_clean();
                            cmd_tx
                                .send(WorkerCommand::CleanFrameReady { session_id: id, result })
                                .await
                                .map_err(|_| ControllerError::WorkerGone(session_id))?;
                        }
                        WorkerEvent::Done { session_id: id, decision } => {
                            in_flight = false;
                            if id == session_id {
                                self.report(decision);
                            } else {
                                debug!(session = session_id, stale = id, "ignoring result from another session");
                            }
                        }
                        WorkerEvent::Finished { .. } => {
                            return Err(ControllerError::WorkerGone(session_id));
                        }
                    }
                }
            }
        }
    }

    fn acquire(&mut self, session_id: u64) -> Option<Frame> {
        match self.source.grab(&self.config.capture.region) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(session = session_id, error = %e, "frame acquisition failed, tick abandoned");
                self.emit(CaptureEvent::AcquisitionFailed(e.to_string()));
                None
            }
        }
    }

    /// Recapture with the indicator hidden.
    fn grab_clean(&mut self) -> Result<Frame, AcquisitionError> {
        self.indicator.hide();
        let result = self.source.grab(&self.config.capture.region);
        self.indicator.show();
        if let Err(e) = &result {
            warn!(error = %e, "clean recapture failed");
            self.emit(CaptureEvent::AcquisitionFailed(e.to_string()));
        }
        result
    }

    fn report(&self, decision: Decision) {
        match decision {
            Decision::Saved { seq, path } => {
                info!(seq, path = %path.display(), "page saved");
                self.emit(CaptureEvent::Saved { seq, path });
            }
            Decision::BufferUpdated { delta, total_width } => {
                self.emit(CaptureEvent::BufferUpdated { delta, total_width })
            }
            Decision::Discarded(reason) => debug!(?reason, "frame discarded"),
            Decision::NeedCleanFrame => {}
        }
    }

    fn emit(&self, event: CaptureEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

/// Ask the worker to wrap up and wait for its output. Results still in
/// flight belong to a stopped session and are dropped.
async fn finish(
    session_id: u64,
    cmd_tx: &mpsc::Sender<WorkerCommand>,
    evt_rx: &mut mpsc::Receiver<WorkerEvent>,
) -> Result<SessionOutput, ControllerError> {
    let mut pending = Some(WorkerCommand::Finish { session_id });
    loop {
        tokio::select! {
            permit = cmd_tx.reserve(), if pending.is_some() => {
                let permit = permit.map_err(|_| ControllerError::WorkerGone(session_id))?;
                if let Some(command) = pending.take() {
                    permit.send(command);
                }
            }
            event = evt_rx.recv() => match event {
                Some(WorkerEvent::Finished { output, .. }) => return Ok(output),
                Some(WorkerEvent::NeedCleanFrame { session_id: id }) => {
                    // If the queue is full it already holds Finish, which also releases the worker.
                    let _ = cmd_tx.try_send(WorkerCommand::CleanFrameReady {
                        session_id: id,
                        result: Err(AcquisitionError::Cancelled),
                    });
                }
                Some(other) => debug!(session = session_id, event = ?other, "dropping stale worker event"),
                None => return Err(ControllerError::WorkerGone(session_id)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use score_capture_common::config::CaptureMode;
    use score_capture_common::frame::CaptureRegion;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(dir: &std::path::Path, mode: &str, delay: u64) -> Config {
        Config::from_toml(&format!(
            r#"
            [capture]
            mode = "{mode}"
            start_delay_secs = {delay}
            tick_interval_ms = 20

            [capture.region]
            left = 0
            top = 0
            width = 64
            height = 48

            [output]
            dir = "{}"
            "#,
            dir.display()
        ))
        .unwrap()
    }

    fn top_dark() -> Frame {
        Frame::new(RgbImage::from_fn(64, 48, |_, y| {
            if y < 24 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        }))
    }

    fn left_dark() -> Frame {
        Frame::new(RgbImage::from_fn(64, 48, |x, _| {
            if x < 32 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        }))
    }

    /// Hands out scripted frames, holding the last one.
    struct Scripted {
        frames: VecDeque<Frame>,
        grabs: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(frames: Vec<Frame>) -> Self {
            Self {
                frames: frames.into(),
                grabs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl FrameSource for Scripted {
        fn grab(&mut self, _region: &CaptureRegion) -> Result<Frame, AcquisitionError> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            if self.frames.len() > 1 {
                self.frames.pop_front().ok_or(AcquisitionError::Cancelled)
            } else {
                self.frames.front().cloned().ok_or(AcquisitionError::Cancelled)
            }
        }
    }

    struct Failing;

    impl FrameSource for Failing {
        fn grab(&mut self, _region: &CaptureRegion) -> Result<Frame, AcquisitionError> {
            Err(AcquisitionError::Grab("no display".into()))
        }
    }

    #[derive(Default, Clone)]
    struct CountingIndicator {
        hidden: Arc<AtomicUsize>,
        shown: Arc<AtomicUsize>,
    }

    impl Indicator for CountingIndicator {
        fn hide(&mut self) {
            self.hidden.fetch_add(1, Ordering::SeqCst);
        }
        fn show(&mut self) {
            self.shown.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Blocks in `handle` until the test opens the gate.
    struct Gated {
        started: mpsc::UnboundedSender<()>,
        gate: std::sync::mpsc::Receiver<()>,
        handled: u64,
    }

    impl Processor for Gated {
        fn mode(&self) -> CaptureMode {
            CaptureMode::PageTurn
        }

        fn handle(&mut self, _frame: &Frame, _session: &mut CaptureSession) -> Decision {
            let _ = self.started.send(());
            let _ = self.gate.recv();
            self.handled += 1;
            Decision::Saved {
                seq: self.handled,
                path: PathBuf::from("gated.png"),
            }
        }

        fn finish(self: Box<Self>, _session: &mut CaptureSession) -> SessionOutput {
            SessionOutput::Pages(Vec::new())
        }
    }

    fn gated() -> (
        Gated,
        mpsc::UnboundedReceiver<()>,
        std::sync::mpsc::Sender<()>,
    ) {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let processor = Gated {
            started: started_tx,
            gate: gate_rx,
            handled: 0,
        };
        (processor, started_rx, gate_tx)
    }

    async fn next_event(
        events: &mut mpsc::UnboundedReceiver<CaptureEvent>,
        wanted: impl Fn(&CaptureEvent) -> bool,
    ) -> CaptureEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(event) if wanted(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn stop_during_countdown_yields_empty_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let source = Scripted::new(vec![top_dark()]);
        let grabs = Arc::clone(&source.grabs);
        let mut controller =
            CaptureController::new(config(tmp.path(), "page_turn", 3), source, CountingIndicator::default(), events_tx);

        let (stop_tx, stop_rx) = oneshot::channel();
        stop_tx.send(()).unwrap();
        let output = controller.run_session(stop_rx).await.unwrap();

        assert!(output.is_empty());
        assert!(matches!(output, SessionOutput::Pages(_)));
        assert_eq!(grabs.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), ControllerState::Stopped);

        let seen = drain(&mut events);
        assert_eq!(seen[0], CaptureEvent::Status("3 seconds until capture".into()));
        assert!(!seen.iter().any(|e| matches!(e, CaptureEvent::AcquisitionFailed(_))));
        assert_eq!(seen.last(), Some(&CaptureEvent::Finished { images: 0 }));
    }

    #[tokio::test]
    async fn failing_source_is_reported_but_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut controller =
            CaptureController::new(config(tmp.path(), "page_turn", 0), Failing, NoIndicator, events_tx);

        let (stop_tx, stop_rx) = oneshot::channel();
        let run = tokio::spawn(async move { controller.run_session(stop_rx).await });
        next_event(&mut events, |e| matches!(e, CaptureEvent::AcquisitionFailed(_))).await;
        next_event(&mut events, |e| matches!(e, CaptureEvent::AcquisitionFailed(_))).await;
        stop_tx.send(()).unwrap();

        let output = run.await.unwrap().unwrap();
        assert!(output.is_empty());
    }

    struct NoIndicator;

    impl Indicator for NoIndicator {
        fn hide(&mut self) {}
        fn show(&mut self) {}
    }

    #[tokio::test]
    async fn page_turn_session_saves_each_new_page() {
        let tmp = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        // tick, clean, tick, tick, clean, then held
        let source = Scripted::new(vec![top_dark(), top_dark(), top_dark(), left_dark(), left_dark()]);
        let indicator = CountingIndicator::default();
        let counts = indicator.clone();
        let mut controller =
            CaptureController::new(config(tmp.path(), "page_turn", 0), source, indicator, events_tx);

        let (stop_tx, stop_rx) = oneshot::channel();
        let run = tokio::spawn(async move { controller.run_session(stop_rx).await });
        let first = next_event(&mut events, |e| matches!(e, CaptureEvent::Saved { .. })).await;
        let second = next_event(&mut events, |e| matches!(e, CaptureEvent::Saved { .. })).await;
        stop_tx.send(()).unwrap();
        let output = run.await.unwrap().unwrap();

        assert!(matches!(first, CaptureEvent::Saved { seq: 1, .. }));
        assert!(matches!(second, CaptureEvent::Saved { seq: 2, .. }));
        let seqs: Vec<u64> = output.images().iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(tmp.path().join("score_002.png").exists());
        assert_eq!(counts.hidden.load(Ordering::SeqCst), 2);
        assert_eq!(counts.shown.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn busy_tick_is_skipped_not_queued() {
        let tmp = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let source = Scripted::new(vec![top_dark()]);
        let grabs = Arc::clone(&source.grabs);
        let mut controller =
            CaptureController::new(config(tmp.path(), "page_turn", 0), source, NoIndicator, events_tx);
        let (processor, mut started, gate) = gated();

        let (stop_tx, stop_rx) = oneshot::channel();
        let run = tokio::spawn(async move {
            controller.run_with(Box::new(processor), stop_rx).await
        });

        started.recv().await.unwrap();
        next_event(&mut events, |e| *e == CaptureEvent::TickSkipped).await;
        next_event(&mut events, |e| *e == CaptureEvent::TickSkipped).await;
        // Only the in-flight frame was grabbed while the worker was busy.
        assert_eq!(grabs.load(Ordering::SeqCst), 1);

        gate.send(()).unwrap();
        next_event(&mut events, |e| matches!(e, CaptureEvent::Saved { seq: 1, .. })).await;
        started.recv().await.unwrap();
        assert_eq!(grabs.load(Ordering::SeqCst), 2);

        stop_tx.send(()).unwrap();
        gate.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn result_arriving_after_stop_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut controller = CaptureController::new(
            config(tmp.path(), "page_turn", 0),
            Scripted::new(vec![top_dark()]),
            NoIndicator,
            events_tx,
        );
        let (processor, mut started, gate) = gated();

        let (stop_tx, stop_rx) = oneshot::channel();
        let run = tokio::spawn(async move {
            controller.run_with(Box::new(processor), stop_rx).await
        });

        started.recv().await.unwrap();
        stop_tx.send(()).unwrap();
        next_event(&mut events, |e| *e == CaptureEvent::Status("stopped".into())).await;
        gate.send(()).unwrap();

        let output = run.await.unwrap().unwrap();
        assert!(output.is_empty());
        let rest = drain(&mut events);
        assert!(!rest.iter().any(|e| matches!(e, CaptureEvent::Saved { .. })));
        assert_eq!(rest.last(), Some(&CaptureEvent::Finished { images: 0 }));
    }

    #[tokio::test]
    async fn scroll_session_reports_buffer_growth() {
        let tmp = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut controller = CaptureController::new(
            config(tmp.path(), "scroll_stitch", 0),
            Scripted::new(vec![left_dark()]),
            NoIndicator,
            events_tx,
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let run = tokio::spawn(async move { controller.run_session(stop_rx).await });
        let seeded = next_event(&mut events, |e| matches!(e, CaptureEvent::BufferUpdated { .. })).await;
        stop_tx.send(()).unwrap();
        let output = run.await.unwrap().unwrap();

        match seeded {
            CaptureEvent::BufferUpdated { delta, total_width } => {
                assert_eq!(total_width, 64);
                assert_eq!(delta.image(), left_dark().image());
            }
            other => panic!("expected buffer update, got {other:?}"),
        }
        match output {
            SessionOutput::Slices { panorama, slices, .. } => {
                assert_eq!(panorama.map(|p| p.width()), Some(64));
                assert_eq!(slices.len(), 1);
            }
            other => panic!("expected slices, got {other:?}"),
        }
    }
}
