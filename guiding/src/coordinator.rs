//! Guiding coordinator
//!
//! Runs the closed guide loop as one tokio task per session:
//!
//! ```text
//! Idle → Starting → CycleExposing → CycleTransferring → CycleSolving
//!      → CycleCorrecting → CycleWaiting → (CycleExposing | Ending) → Idle
//! ```
//!
//! Cancellation is cooperative. Each session owns a cancel token which
//! [`GuidingCoordinator::stop`] fires, and every blocking wait races against
//! it. A new session is only started once the previous one has finished, so
//! sessions never overlap. Whatever the session acquired (mount tracking,
//! worker process, connection) is released in `Ending`, however the loop
//! ended.

use crate::buffer::SharedImageBuffer;
use crate::channel::{WorkerChannel, WorkerListener};
use crate::config::GuidingConfig;
use crate::correction::{compute_offset, SkyCoordinates};
use crate::error::{GuidingError, GuidingResult, ProtocolError};
use crate::protocol::SolveResponse;
use crate::unit::UnitActivity;
use crate::worker::{WorkerEndpoint, WorkerLauncher};
use chrono::{DateTime, Utc};
use mast_device::{
    ActivityTracker, Camera, CameraActivity, DeviceError, ErrorKind, ImageFrame, ImageGeometry, MountDriver,
    MountOffset, ReportableError,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

/// Where the guide loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuidingState {
    Idle,
    Starting,
    CycleExposing,
    CycleTransferring,
    CycleSolving,
    CycleCorrecting,
    CycleWaiting,
    Ending,
}

impl std::fmt::Display for GuidingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a guiding session ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    /// Guiding was cleared by a stop request
    Stopped,
    /// A fault that blocks protocol progress
    Failed { kind: ErrorKind, message: String },
}

impl EndReason {
    fn failed(err: &GuidingError) -> Self {
        EndReason::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Counters for one guiding session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Cycles that reached the correcting step
    pub cycles: u64,
    pub corrections: u64,
    pub solve_failures: u64,
    pub skipped_cycles: u64,
    pub consecutive_timeouts: u32,
    pub last_correction: Option<MountOffset>,
    pub end_reason: Option<EndReason>,
}

impl SessionReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            cycles: 0,
            corrections: 0,
            solve_failures: 0,
            skipped_cycles: 0,
            consecutive_timeouts: 0,
            last_correction: None,
            end_reason: None,
        }
    }
}

/// Coordinator view for status snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidingStatus {
    pub state: GuidingState,
    pub is_guiding: bool,
    /// Whether a worker started by this unit is alive
    pub worker_running: bool,
    pub session: Option<SessionReport>,
}

/// Resources a session acquired and must release in `Ending`
#[derive(Default)]
struct SessionResources {
    restore_tracking: bool,
    worker_launched: bool,
    channel: Option<WorkerChannel>,
}

/// How a cycle step ended when it did not produce its value
enum Interrupt {
    /// The session was stopped
    Cancelled,
    /// Skip the rest of this cycle
    Skip(String),
    /// End the session
    Fatal(GuidingError),
}

type Step<T> = Result<T, Interrupt>;

/// Receiving end of one session's cancel signal
#[derive(Clone)]
struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the session is stopped (or its owner is gone)
    async fn cancelled(&self) {
        let mut signal = self.0.clone();
        let _ = signal.wait_for(|cancelled| *cancelled).await;
    }

    fn check(&self) -> Step<()> {
        if self.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `future` unless the session is stopped first
    async fn guard<T>(&self, future: impl Future<Output = T>) -> Step<T> {
        tokio::select! {
            value = future => Ok(value),
            _ = self.cancelled() => Err(Interrupt::Cancelled),
        }
    }
}

/// The coordinator's handle on a running or finished session
struct SessionHandle {
    cancel: watch::Sender<bool>,
    /// Carries the final report once the session task is done
    finished: watch::Receiver<Option<SessionReport>>,
}

impl SessionHandle {
    fn is_running(&self) -> bool {
        self.finished.borrow().is_none() && self.finished.has_changed().is_ok()
    }
}

async fn wait_finished(mut finished: watch::Receiver<Option<SessionReport>>) -> Option<SessionReport> {
    match finished.wait_for(Option::is_some).await {
        Ok(report) => report.clone(),
        Err(_) => {
            tracing::warn!("guiding: session task ended abnormally");
            None
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct GuidingCoordinator {
    config: GuidingConfig,
    camera: Arc<Camera>,
    mount: Arc<dyn MountDriver>,
    launcher: Arc<dyn WorkerLauncher>,
    activities: Arc<ActivityTracker<UnitActivity>>,
    state: watch::Sender<GuidingState>,
    /// Serializes `start` so a session is only armed after the last one ended
    starting: tokio::sync::Mutex<()>,
    session: Mutex<Option<SessionHandle>>,
    report: Mutex<Option<SessionReport>>,
    buffer: Mutex<Option<SharedImageBuffer>>,
}

impl GuidingCoordinator {
    pub fn new(
        config: GuidingConfig,
        camera: Arc<Camera>,
        mount: Arc<dyn MountDriver>,
        launcher: Arc<dyn WorkerLauncher>,
        activities: Arc<ActivityTracker<UnitActivity>>,
    ) -> GuidingResult<Self> {
        config.validate()?;
        let (state, _) = watch::channel(GuidingState::Idle);
        Ok(Self {
            config,
            camera,
            mount,
            launcher,
            activities,
            state,
            starting: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            report: Mutex::new(None),
            buffer: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GuidingConfig {
        &self.config
    }

    pub fn state(&self) -> GuidingState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<GuidingState> {
        self.state.subscribe()
    }

    pub fn is_guiding(&self) -> bool {
        self.activities.is_active(UnitActivity::Guiding)
    }

    /// Current session counters, or the last session's final report
    pub fn report(&self) -> Option<SessionReport> {
        locked(&self.report).clone()
    }

    pub async fn status(&self) -> GuidingStatus {
        GuidingStatus {
            state: self.state(),
            is_guiding: self.is_guiding(),
            worker_running: self.launcher.is_running().await,
            session: self.report(),
        }
    }

    fn set_state(&self, state: GuidingState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("guiding: {} -> {}", previous, state);
        }
    }

    fn update_report(&self, f: impl FnOnce(&mut SessionReport)) {
        if let Some(report) = locked(&self.report).as_mut() {
            f(report);
        }
    }

    // =========================================================================
    // Start / stop
    // =========================================================================

    /// Start a guiding session. A no-op while one is already running; waits
    /// for a stopped session that is still in `Ending`.
    pub async fn start(self: &Arc<Self>) -> GuidingResult<()> {
        let _starting = self.starting.lock().await;

        let previous = match locked(&self.session).as_ref() {
            Some(session) if session.is_running() && !*session.cancel.borrow() => {
                tracing::info!("guiding: already guiding");
                return Ok(());
            }
            Some(session) if session.is_running() => Some(session.finished.clone()),
            _ => None,
        };
        if let Some(finished) = previous {
            tracing::info!("guiding: waiting for the previous session to end");
            wait_finished(finished).await;
        }

        self.activities.start(UnitActivity::Guiding).map_err(DeviceError::from)?;
        *locked(&self.report) = Some(SessionReport::new());
        self.set_state(GuidingState::Starting);

        let (cancel, token) = watch::channel(false);
        let (done, finished) = watch::channel(None);
        *locked(&self.session) = Some(SessionHandle { cancel, finished });

        let coordinator = self.clone();
        tokio::spawn(async move {
            let report = coordinator.run_session(CancelToken(token)).await;
            done.send_replace(Some(report));
        });
        Ok(())
    }

    /// Ask the session to end. A no-op when not guiding.
    pub fn stop(&self) {
        self.cancel_current();
    }

    /// Fire the running session's cancel token and return its completion signal
    fn cancel_current(&self) -> Option<watch::Receiver<Option<SessionReport>>> {
        let session = locked(&self.session);
        let session = session.as_ref().filter(|s| s.is_running())?;
        if !session.cancel.send_replace(true) {
            tracing::info!("guiding: stop requested");
        }
        self.activities.end_if_active(UnitActivity::Guiding);
        Some(session.finished.clone())
    }

    /// Wait for the current session (if any) to finish
    pub async fn wait(&self) -> Option<SessionReport> {
        let finished = locked(&self.session).as_ref().map(|s| s.finished.clone());
        match finished {
            Some(finished) => wait_finished(finished).await.or_else(|| self.report()),
            None => self.report(),
        }
    }

    /// Stop the running session and wait for that session, not any later
    /// one, to finish
    pub async fn stop_and_wait(&self) -> Option<SessionReport> {
        match self.cancel_current() {
            Some(finished) => wait_finished(finished).await.or_else(|| self.report()),
            None => self.report(),
        }
    }

    /// Remove the shared image buffer; called when the unit's lifespan ends
    pub fn release_buffer(&self) {
        let buffer = locked(&self.buffer).take();
        if let Some(buffer) = buffer {
            if let Err(e) = buffer.unlink() {
                tracing::warn!("guiding: {}", e);
            }
        }
    }

    // =========================================================================
    // Session
    // =========================================================================

    async fn run_session(self: Arc<Self>, token: CancelToken) -> SessionReport {
        tracing::info!("guiding: session started");
        let mut resources = SessionResources::default();

        let end_reason = match self.begin(&mut resources, &token).await {
            Ok(geometry) => self.cycle_loop(&mut resources, geometry, &token).await,
            Err(Interrupt::Cancelled) => EndReason::Stopped,
            Err(Interrupt::Skip(reason)) => EndReason::Failed {
                kind: ErrorKind::Internal,
                message: reason,
            },
            Err(Interrupt::Fatal(e)) => {
                tracing::error!("guiding: could not start: {}", e);
                EndReason::failed(&e)
            }
        };

        self.set_state(GuidingState::Ending);
        self.finish(resources).await;
        // Sessions never overlap, so this Guiding is ours
        self.activities.end_if_active(UnitActivity::Guiding);

        self.update_report(|report| {
            report.ended_at = Some(Utc::now());
            report.end_reason = Some(end_reason.clone());
        });
        match &end_reason {
            EndReason::Stopped => tracing::info!("guiding: session ended"),
            EndReason::Failed { message, .. } => tracing::error!("guiding: session failed: {}", message),
        }
        self.set_state(GuidingState::Idle);
        self.report().unwrap_or_else(SessionReport::new)
    }

    async fn begin(&self, resources: &mut SessionResources, token: &CancelToken) -> Step<ImageGeometry> {
        let fatal = |e: GuidingError| Interrupt::Fatal(e);

        if !self.camera.is_connected().await {
            self.camera.try_connect().await.map_err(|e| fatal(e.into()))?;
        }
        let geometry = self.camera.geometry().ok_or_else(|| {
            fatal(GuidingError::Config(format!(
                "{}: sensor geometry unknown",
                self.camera.name()
            )))
        })?;

        if self.config.manage_tracking {
            let mount = self.mount.status().await.map_err(|e| fatal(e.into()))?;
            if !mount.is_tracking {
                self.mount.set_tracking(true).await.map_err(|e| fatal(e.into()))?;
                resources.restore_tracking = true;
                tracing::info!("guiding: turned mount tracking on");
            }
        }
        token.check()?;

        self.ensure_buffer(geometry).map_err(fatal)?;

        let worker = &self.config.worker;
        let listener = WorkerListener::bind(&worker.listen_address).await.map_err(fatal)?;
        let endpoint = WorkerEndpoint {
            address: listener.local_addr(),
            buffer_dir: worker.buffer_dir(),
            buffer_name: worker.buffer_name.clone(),
        };
        self.launcher.launch(&endpoint).await.map_err(fatal)?;
        resources.worker_launched = true;

        let channel = token
            .guard(listener.accept(self.config.handshake_timeout()))
            .await?
            .map_err(fatal)?;
        resources.channel = Some(channel);
        Ok(geometry)
    }

    /// Create the shared buffer, or re-create it when the geometry changed
    fn ensure_buffer(&self, geometry: ImageGeometry) -> GuidingResult<()> {
        let mut buffer = locked(&self.buffer);
        if buffer.as_ref().map(|b| b.geometry()) == Some(geometry) {
            return Ok(());
        }
        let worker = &self.config.worker;
        *buffer = Some(SharedImageBuffer::create(
            &worker.buffer_dir(),
            &worker.buffer_name,
            geometry,
        )?);
        Ok(())
    }

    async fn cycle_loop(
        &self,
        resources: &mut SessionResources,
        geometry: ImageGeometry,
        token: &CancelToken,
    ) -> EndReason {
        let Some(channel) = resources.channel.as_mut() else {
            return EndReason::failed(&GuidingError::WorkerUnreachable("no worker connection".to_string()));
        };

        let mut geometry = geometry;
        loop {
            match self.run_cycle(channel, &mut geometry, token).await {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => return EndReason::Stopped,
                Err(Interrupt::Fatal(e)) => return EndReason::failed(&e),
                Err(Interrupt::Skip(reason)) => {
                    tracing::warn!("guiding: cycle skipped: {}", reason);
                    self.update_report(|report| report.skipped_cycles += 1);
                }
            }

            self.set_state(GuidingState::CycleWaiting);
            if token.guard(sleep(self.config.inter_cycle())).await.is_err() {
                return EndReason::Stopped;
            }
        }
    }

    async fn run_cycle(
        &self,
        channel: &mut WorkerChannel,
        geometry: &mut ImageGeometry,
        token: &CancelToken,
    ) -> Step<()> {
        token.check()?;

        self.set_state(GuidingState::CycleExposing);
        let frame = self.expose(token).await?;

        self.set_state(GuidingState::CycleTransferring);
        token.check()?;
        if frame.geometry != *geometry {
            tracing::info!("guiding: image geometry changed {} -> {}", geometry, frame.geometry);
            *geometry = frame.geometry;
        }
        self.transfer(channel, &frame, token).await?;

        self.set_state(GuidingState::CycleSolving);
        token.check()?;
        let hint = match self.config.request_skew {
            Some(skew) => skew.apply(self.pointing().await?),
            None => self.pointing().await?,
        };
        let response = self.solve(channel, hint, *geometry, token).await?;

        self.set_state(GuidingState::CycleCorrecting);
        self.update_report(|report| report.cycles += 1);
        if !response.success {
            tracing::warn!("guiding: solve failed: {}", response.reasons.join(", "));
            self.update_report(|report| report.solve_failures += 1);
            return Ok(());
        }

        // The mount may have moved while the worker was solving
        let pointing = self.pointing().await?;
        let solved = SkyCoordinates::new(response.ra, response.dec);
        let offset = compute_offset(pointing, solved);
        tracing::info!(
            "guiding: mount at {}, solved {}, correction {}",
            pointing,
            solved,
            offset
        );
        self.mount
            .offset(offset)
            .await
            .map_err(|e| Interrupt::Skip(format!("offset not applied: {}", e)))?;
        self.update_report(|report| {
            report.corrections += 1;
            report.last_correction = Some(offset);
        });
        Ok(())
    }

    async fn pointing(&self) -> Step<SkyCoordinates> {
        let mount = self
            .mount
            .status()
            .await
            .map_err(|e| Interrupt::Skip(format!("mount status unavailable: {}", e)))?;
        Ok(SkyCoordinates::from(mount))
    }

    /// Take one guide exposure and return its image
    async fn expose(&self, token: &CancelToken) -> Step<Arc<ImageFrame>> {
        self.camera
            .try_start_exposure(self.config.exposure_secs)
            .await
            .map_err(|e| match e {
                DeviceError::Activity(_) => Interrupt::Skip(e.to_string()),
                other => Interrupt::Fatal(other.into()),
            })?;

        let started = Instant::now();
        let deadline = self.config.exposure_deadline();
        let poll = self.config.check_interval().min(Duration::from_millis(250));
        while self.camera.is_active(CameraActivity::Exposing) {
            if started.elapsed() > deadline {
                let _ = self.camera.try_abort().await;
                return Err(Interrupt::Fatal(
                    DeviceError::driver(
                        self.camera.name(),
                        "guide exposure",
                        format!("no image after {:?}", deadline),
                    )
                    .into(),
                ));
            }
            if token.guard(sleep(poll)).await.is_err() {
                if let Err(e) = self.camera.try_abort().await {
                    tracing::warn!("guiding: abort on stop failed: {}", e);
                }
                return Err(Interrupt::Cancelled);
            }
        }

        self.camera
            .take_image()
            .ok_or_else(|| Interrupt::Skip("exposure ended without an image".to_string()))
    }

    /// Copy the frame into the shared buffer and wait for the worker's ack
    async fn transfer(&self, channel: &mut WorkerChannel, frame: &ImageFrame, token: &CancelToken) -> Step<()> {
        // A worker that missed the last ack deadline may still be copying
        if channel.buffer_on_loan() {
            let reclaimed = token.guard(channel.reclaim_buffer(self.config.ack_timeout())).await?;
            reclaimed.map_err(|e| self.classify(e))?;
        }

        self.ensure_buffer(frame.geometry).map_err(Interrupt::Fatal)?;
        {
            let mut buffer = locked(&self.buffer);
            let Some(buffer) = buffer.as_mut() else {
                return Err(Interrupt::Fatal(GuidingError::Config("shared buffer missing".to_string())));
            };
            buffer.write_frame(frame).map_err(|e| Interrupt::Fatal(e.into()))?;
        }

        let ack = token
            .guard(channel.announce_image(frame.geometry, self.config.ack_timeout()))
            .await?;
        match ack {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }

    async fn solve(
        &self,
        channel: &mut WorkerChannel,
        hint: SkyCoordinates,
        geometry: ImageGeometry,
        token: &CancelToken,
    ) -> Step<SolveResponse> {
        let result = token
            .guard(channel.solve(hint, geometry, self.config.solve_timeout()))
            .await?;
        match result {
            Ok(response) => {
                self.update_report(|report| report.consecutive_timeouts = 0);
                Ok(response)
            }
            Err(e) => Err(self.classify(e)),
        }
    }

    /// Decide whether a channel error skips the cycle or ends the session
    fn classify(&self, err: GuidingError) -> Interrupt {
        match err {
            GuidingError::Protocol(ProtocolError::Timeout { .. }) => {
                let mut timeouts = 0;
                self.update_report(|report| {
                    report.consecutive_timeouts += 1;
                    report.solve_failures += 1;
                    timeouts = report.consecutive_timeouts;
                });
                if timeouts > self.config.max_consecutive_timeouts {
                    Interrupt::Fatal(GuidingError::WorkerUnreachable(format!(
                        "{} consecutive timeouts: {}",
                        timeouts, err
                    )))
                } else {
                    Interrupt::Skip(err.to_string())
                }
            }
            GuidingError::SolveFailure(_) => {
                self.update_report(|report| report.solve_failures += 1);
                Interrupt::Skip(err.to_string())
            }
            GuidingError::Protocol(ProtocolError::Closed) | GuidingError::Protocol(ProtocolError::Io(_)) => {
                Interrupt::Fatal(GuidingError::WorkerUnreachable(err.to_string()))
            }
            other => Interrupt::Fatal(other),
        }
    }

    /// Release everything the session acquired
    async fn finish(&self, resources: SessionResources) {
        if let Some(channel) = resources.channel {
            channel.shutdown().await;
        }
        if resources.worker_launched {
            if let Err(e) = self.launcher.terminate().await {
                tracing::warn!("guiding: worker termination failed: {}", e);
            }
        }
        if resources.restore_tracking {
            match self.mount.set_tracking(false).await {
                Ok(()) => tracing::info!("guiding: restored mount tracking (off)"),
                Err(e) => tracing::warn!("guiding: could not restore mount tracking: {}", e),
            }
        }
    }
}

impl std::fmt::Debug for GuidingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuidingCoordinator")
            .field("state", &self.state())
            .field("is_guiding", &self.is_guiding())
            .finish()
    }
}
