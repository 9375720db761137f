//! Acquisition session - frames in, manifest matches out
//!
//! Each cycle pulls one frame, decodes the best-ranked regions (falling back
//! to a whole-frame decode every few frames when regions yield nothing),
//! reconciles payloads with the manifest, and paces itself to the target
//! cadence. The session ends when every manifest code has been seen, or
//! when cancelled. Frames are processed strictly one after another.

mod crop;

pub use crop::{crop_box, crop_region, rank_proposals, CropSettings, MAX_SHRINK};

use crate::domain::manifest::ShipmentManifest;
use crate::domain::types::{new_uuid_v7, DecodedCode, MatchMethod, SessionEvent};
use crate::infra::cancel::{cancel_pair, CancelHandle, CancelToken, Cancelled};
use crate::infra::config::ConfigError;
use crate::infra::metrics::Metrics;
use crate::io::frames::FrameSource;
use crate::io::regions::RegionProposer;
use crate::services::manifest_matcher::{ManifestMatcher, MatchState};
use crate::services::symbol_decoder::SymbolDecoder;
use image::DynamicImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Validated session parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Target time per cycle
    pub cadence: Duration,
    /// Longest wait for one frame
    pub frame_timeout: Duration,
    /// Decode every Nth pulled frame
    pub decode_every: u64,
    /// Whole-frame decode on every Nth frame when regions yield nothing (0 disables)
    pub fallback_every: u64,
    pub max_regions: usize,
    pub min_confidence: f32,
    pub crop: CropSettings,
}

impl SessionSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cadence.is_zero() {
            return Err(ConfigError::NonPositive("cadence"));
        }
        if self.frame_timeout.is_zero() {
            return Err(ConfigError::NonPositive("frame_timeout"));
        }
        if self.decode_every == 0 {
            return Err(ConfigError::NonPositive("decode_every"));
        }
        if self.max_regions == 0 {
            return Err(ConfigError::NonPositive("max_regions"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Confidence(self.min_confidence));
        }
        if !(self.crop.upscale.is_finite() && self.crop.upscale > 0.0) {
            return Err(ConfigError::NonPositive("region_upscale"));
        }
        if !(self.crop.pad_pct.is_finite() && self.crop.pad_pct >= 0.0) {
            return Err(ConfigError::NonPositive("pad_pct"));
        }
        // Past one half the inset of both sides crosses over
        if !(0.0..=MAX_SHRINK).contains(&self.crop.shrink) {
            return Err(ConfigError::Shrink(self.crop.shrink));
        }
        Ok(())
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cadence: Duration::from_millis(200),
            frame_timeout: Duration::from_secs(1),
            decode_every: 1,
            fallback_every: 15,
            max_regions: 6,
            min_confidence: 0.25,
            crop: CropSettings::default(),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    AllFound { found: usize, frames: u64 },
    Cancelled { found: usize, frames: u64 },
}

/// Result of decoding one frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameScan {
    /// Distinct payloads across all regions, in ranked-region order
    pub payloads: Vec<String>,
    pub regions: usize,
    pub attempts: usize,
    pub fallback: bool,
}

/// Decode one frame: ranked regions first, then the whole-frame fallback
pub fn scan_frame(
    frame: &DynamicImage,
    frame_index: u64,
    proposer: &dyn RegionProposer,
    decoder: &SymbolDecoder,
    settings: &SessionSettings,
) -> FrameScan {
    let ranked = rank_proposals(proposer.propose(frame), settings.min_confidence, settings.max_regions);
    let mut scan = FrameScan { regions: ranked.len(), ..FrameScan::default() };

    for proposal in &ranked {
        let Some(region) = crop_region(frame, &proposal.bbox, &settings.crop) else {
            continue;
        };
        let outcome = decoder.decode(&region);
        scan.attempts += outcome.attempts;
        for payload in outcome.payloads {
            if !scan.payloads.contains(&payload) {
                scan.payloads.push(payload);
            }
        }
    }

    if scan.payloads.is_empty() && settings.fallback_every > 0 && frame_index % settings.fallback_every == 0 {
        scan.fallback = true;
        let outcome = decoder.decode_whole_frame(frame);
        scan.attempts += outcome.attempts;
        scan.payloads = outcome.payloads;
    }
    scan
}

pub struct AcquisitionSession<F> {
    id: String,
    settings: SessionSettings,
    frames: F,
    proposer: Arc<dyn RegionProposer>,
    decoder: Arc<SymbolDecoder>,
    matcher: ManifestMatcher,
    state: MatchState,
    metrics: Arc<Metrics>,
    frame_index: u64,
}

impl<F: FrameSource> AcquisitionSession<F> {
    pub fn new(
        manifest: &ShipmentManifest,
        frames: F,
        proposer: Arc<dyn RegionProposer>,
        decoder: Arc<SymbolDecoder>,
        settings: SessionSettings,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SessionError> {
        settings.validate()?;
        let matcher = ManifestMatcher::new(manifest);
        if matcher.is_empty() {
            warn!("session_manifest_empty");
        }
        Ok(Self {
            id: new_uuid_v7(),
            settings,
            frames,
            proposer,
            decoder,
            matcher,
            state: MatchState::default(),
            metrics,
            frame_index: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until every manifest code is found or cancellation is requested
    pub async fn run(mut self, events: mpsc::Sender<SessionEvent>, mut cancel: CancelToken) -> SessionOutcome {
        info!(
            session = %self.id,
            expected = %self.matcher.expected(),
            cadence_ms = %self.settings.cadence.as_millis(),
            "session_started"
        );

        loop {
            let cycle_start = Instant::now();
            match self.cycle(&events, &mut cancel).await {
                Ok(true) => {
                    let found = self.state.len();
                    info!(session = %self.id, found = %found, frames = %self.frame_index, "session_all_found");
                    return SessionOutcome::AllFound { found, frames: self.frame_index };
                }
                Ok(false) => {}
                Err(Cancelled) => break,
            }

            // Pace to the target cadence whatever the cycle did
            let remaining = self.settings.cadence.saturating_sub(cycle_start.elapsed());
            if !cancel.sleep(remaining).await {
                break;
            }
        }

        info!(session = %self.id, found = %self.state.len(), frames = %self.frame_index, "session_cancelled");
        SessionOutcome::Cancelled { found: self.state.len(), frames: self.frame_index }
    }

    /// One frame. Returns true once the manifest is complete.
    async fn cycle(&mut self, events: &mpsc::Sender<SessionEvent>, cancel: &mut CancelToken) -> Result<bool, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let timeout = self.settings.frame_timeout;
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            frame = tokio::time::timeout(timeout, self.frames.next_frame()) => frame.ok().flatten(),
        };

        let Some(frame) = frame else {
            self.metrics.record_frame_empty();
            debug!(session = %self.id, "session_no_frame");
            self.status(events, self.frame_index);
            return Ok(false);
        };

        self.frame_index += 1;
        let frame_index = self.frame_index;
        self.metrics.record_frame_pulled();

        if frame_index % self.settings.decode_every != 0 {
            self.metrics.record_frame_skipped();
            self.status(events, frame_index);
            return Ok(false);
        }

        let started = Instant::now();
        let scan = {
            let proposer = self.proposer.clone();
            let decoder = self.decoder.clone();
            let settings = self.settings.clone();
            tokio::task::spawn_blocking(move || {
                scan_frame(&frame, frame_index, proposer.as_ref(), &decoder, &settings)
            })
            .await
        };
        let scan = match scan {
            Ok(scan) => scan,
            Err(e) => {
                error!(session = %self.id, frame = %frame_index, error = %e, "session_decode_task_failed");
                FrameScan::default()
            }
        };
        self.metrics.record_frame_latency(started.elapsed().as_micros() as u64);
        self.metrics.record_regions(scan.regions);
        self.metrics.record_decode_attempts(scan.attempts);
        if scan.fallback {
            self.metrics.record_fallback_decode();
        }

        // A frame decoded after cancellation is discarded
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        if scan.payloads.is_empty() {
            debug!(session = %self.id, frame = %frame_index, regions = %scan.regions, "session_nothing_decoded");
            self.status(events, frame_index);
            return Ok(false);
        }

        for payload in scan.payloads {
            self.handle_payload(events, cancel, DecodedCode { payload, frame_index }).await?;
        }

        if self.state.is_complete(&self.matcher) {
            let found = self.state.len();
            emit(events, cancel, SessionEvent::AllFound { found }).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn handle_payload(
        &mut self,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &mut CancelToken,
        decoded: DecodedCode,
    ) -> Result<(), Cancelled> {
        let DecodedCode { payload, frame_index } = decoded;
        self.metrics.record_payload_decoded();
        info!(session = %self.id, frame = %frame_index, code = %payload, "session_decoded");
        emit(events, cancel, SessionEvent::Decoded { code: payload.clone(), frame_index }).await?;

        let result = self.matcher.lookup(&payload);
        match result.canonical {
            Some(canonical) => {
                let duplicate = !self.state.insert(&canonical);
                self.metrics.record_match(duplicate);
                if duplicate {
                    debug!(session = %self.id, code = %canonical, "session_duplicate_read");
                } else {
                    info!(
                        session = %self.id,
                        code = %canonical,
                        method = %result.method.as_str(),
                        score = %result.score,
                        found = %self.state.len(),
                        expected = %self.matcher.expected(),
                        "session_matched"
                    );
                }
                emit(
                    events,
                    cancel,
                    SessionEvent::Matched { code: canonical, decoded: payload, method: MatchMethod::Exact, duplicate },
                )
                .await
            }
            None => {
                self.metrics.record_not_in_manifest();
                info!(session = %self.id, code = %payload, "session_not_in_manifest");
                emit(events, cancel, SessionEvent::NotInManifest { code: payload }).await
            }
        }
    }

    /// Per-cycle status; dropped if the consumer is behind
    fn status(&self, events: &mpsc::Sender<SessionEvent>, frame_index: u64) {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            events.try_send(SessionEvent::NoReadingThisCycle { frame_index })
        {
            debug!(session = %self.id, "session_status_dropped");
        }
    }
}

/// Deliver an outcome event, waiting for channel space unless cancelled
async fn emit(
    events: &mpsc::Sender<SessionEvent>,
    cancel: &mut CancelToken,
    event: SessionEvent,
) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        sent = events.send(event) => {
            if sent.is_err() {
                debug!("session_event_receiver_closed");
            }
            Ok(())
        }
    }
}

impl<F: FrameSource + 'static> AcquisitionSession<F> {
    /// Run the session on its own task
    pub fn spawn(self, buffer: usize) -> SessionHandle {
        let id = self.id.clone();
        let (events_tx, events) = mpsc::channel(buffer.max(1));
        let (cancel, token) = cancel_pair();
        let task = tokio::spawn(self.run(events_tx, token));
        SessionHandle { id, events, cancel, task }
    }
}

/// A session running on its own task
pub struct SessionHandle {
    id: String,
    pub events: mpsc::Receiver<SessionEvent>,
    cancel: CancelHandle,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the session task to end
    pub async fn finish(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(session = %self.id, error = %e, "session_task_failed");
                SessionOutcome::Cancelled { found: 0, frames: 0 }
            }
        }
    }
}
