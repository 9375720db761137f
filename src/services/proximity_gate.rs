//! Proximity gate - decides when an object is in front of the scanner
//!
//! Sensors are read one at a time, round-robin, so one sensor's echo never
//! lands on another. Each read takes a burst of samples, drops implausible
//! ones, and reduces the rest to one distance:
//!
//! 1. Sort, drop min and max when five or more valid samples remain, average
//! 2. Below the soft minimum, average with the sensor's previous value
//! 3. Nothing valid: reuse the previous value, or report no reading
//!
//! The gate fires once, with the value that satisfied the trigger policy,
//! and then stops.

use crate::domain::types::{
    GateEvent, PlausibilityBand, RangingSample, ReadingSource, SensorId, SensorState,
};
use crate::infra::cancel::{cancel_pair, CancelHandle, CancelToken, Cancelled};
use crate::infra::config::{ConfigError, TriggerPolicy};
use crate::infra::metrics::Metrics;
use crate::io::ranging::{HardwareError, PulseSensor};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

type Samples = SmallVec<[RangingSample; 8]>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid gate configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Validated gate parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GateSettings {
    /// Read order; reads cycle through this list
    pub sensors: Vec<SensorId>,
    pub trigger_distance_in: f64,
    pub settle: Duration,
    pub quiet: Duration,
    pub samples_per_read: usize,
    pub sample_timeout: Duration,
    pub sample_gap: Duration,
    pub band: PlausibilityBand,
    pub soft_min_in: f64,
    pub us_per_inch: f64,
    pub policy: TriggerPolicy,
}

fn positive(value: f64, name: &'static str) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive(name))
    }
}

impl GateSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors.is_empty() {
            return Err(ConfigError::NoSensors);
        }
        let mut seen = FxHashSet::default();
        for sensor in &self.sensors {
            if !seen.insert(*sensor) {
                return Err(ConfigError::DuplicateSensor(sensor.0));
            }
        }
        positive(self.trigger_distance_in, "trigger_distance_in")?;
        positive(self.us_per_inch, "us_per_inch")?;
        if self.samples_per_read == 0 {
            return Err(ConfigError::NonPositive("samples_per_read"));
        }
        if self.sample_timeout.is_zero() {
            return Err(ConfigError::NonPositive("sample_timeout"));
        }
        if !(self.band.hard_min_in < self.band.max_in) {
            return Err(ConfigError::EmptyBand {
                hard_min_in: self.band.hard_min_in,
                max_in: self.band.max_in,
            });
        }
        Ok(())
    }
}

/// Mean of the valid samples, trimming the extremes when five or more remain
pub fn trimmed_mean(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let kept = if values.len() >= 5 { &values[1..values.len() - 1] } else { &values[..] };
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Reduce one read's samples to a distance, updating the sensor's state
pub fn reduce_read(
    samples: &[RangingSample],
    state: &mut SensorState,
    soft_min_in: f64,
) -> Option<(f64, ReadingSource)> {
    let mut valid: SmallVec<[f64; 8]> =
        samples.iter().filter(|s| s.valid).map(|s| s.distance_in).collect();

    match trimmed_mean(&mut valid) {
        Some(mean) => {
            let (value, source) = match state.last_valid_in {
                Some(prev) if mean < soft_min_in => ((mean + prev) / 2.0, ReadingSource::Smoothed),
                _ => (mean, ReadingSource::Fresh),
            };
            state.last_valid_in = Some(value);
            Some((value, source))
        }
        None => state.last_valid_in.map(|prev| (prev, ReadingSource::Held)),
    }
}

/// How a gate run ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateOutcome {
    Ready { distance_in: f64, sensor: SensorId },
    Cancelled,
}

pub struct ProximityGate<H> {
    settings: GateSettings,
    hardware: H,
    metrics: Arc<Metrics>,
    states: FxHashMap<SensorId, SensorState>,
    /// Latest per-read value per sensor, for the `All` policy
    latest: FxHashMap<SensorId, f64>,
    last_sensor: Option<SensorId>,
}

impl<H: PulseSensor> ProximityGate<H> {
    /// Validate settings and confirm the hardware can be used
    pub fn new(settings: GateSettings, mut hardware: H, metrics: Arc<Metrics>) -> Result<Self, GateError> {
        settings.validate()?;
        hardware.check()?;
        Ok(Self {
            settings,
            hardware,
            metrics,
            states: FxHashMap::default(),
            latest: FxHashMap::default(),
            last_sensor: None,
        })
    }

    /// Poll sensors until the trigger condition holds or cancellation is
    /// requested. Events are delivered on `events`; a full channel drops
    /// `Reading`/`NoReading` events but never `Ready`.
    pub async fn run(mut self, events: mpsc::Sender<GateEvent>, mut cancel: CancelToken) -> GateOutcome {
        info!(
            sensors = ?self.settings.sensors,
            trigger_distance_in = %self.settings.trigger_distance_in,
            policy = %self.settings.policy.as_str(),
            "gate_started"
        );

        let sensors = self.settings.sensors.clone();
        for sensor in sensors.iter().cycle() {
            match self.step(*sensor, &events, &mut cancel).await {
                Ok(Some((distance_in, sensor))) => {
                    // A full channel must not hold off cancellation
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = events.send(GateEvent::Ready { distance_in, sensor }) => sent,
                    };
                    if sent.is_err() {
                        debug!("gate_event_receiver_closed");
                    }
                    self.metrics.record_gate_trigger();
                    info!(sensor = %sensor, distance_in = %distance_in, "gate_ready");
                    return GateOutcome::Ready { distance_in, sensor };
                }
                Ok(None) => {}
                Err(Cancelled) => break,
            }
        }

        info!("gate_cancelled");
        GateOutcome::Cancelled
    }

    /// One read of one sensor. Returns the trigger decision if it fired.
    async fn step(
        &mut self,
        sensor: SensorId,
        events: &mpsc::Sender<GateEvent>,
        cancel: &mut CancelToken,
    ) -> Result<Option<(f64, SensorId)>, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        // Let the previous sensor's echo die out
        if self.last_sensor.is_some_and(|prev| prev != sensor)
            && !cancel.sleep(self.settings.settle).await
        {
            return Err(Cancelled);
        }
        self.last_sensor = Some(sensor);

        let samples = self.sample(sensor, cancel).await?;
        let state = self.states.entry(sensor).or_default();
        let reading = reduce_read(&samples, state, self.settings.soft_min_in);
        self.metrics.record_sensor_read(reading.map(|(_, source)| source));

        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let event = match reading {
            Some((distance_in, source)) => {
                debug!(
                    sensor = %sensor,
                    distance_in = %distance_in,
                    source = %source.as_str(),
                    valid = %samples.iter().filter(|s| s.valid).count(),
                    "gate_reading"
                );
                self.latest.insert(sensor, distance_in);
                GateEvent::Reading { sensor, distance_in, source }
            }
            None => {
                debug!(sensor = %sensor, "gate_no_reading");
                self.latest.remove(&sensor);
                GateEvent::NoReading { sensor }
            }
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = events.try_send(event) {
            warn!(sensor = %sensor, "gate_event_dropped");
        }

        if let Some((distance_in, _)) = reading {
            if let Some(ready) = self.check_trigger(sensor, distance_in) {
                return Ok(Some(ready));
            }
        }

        if !cancel.sleep(self.settings.quiet).await {
            return Err(Cancelled);
        }
        Ok(None)
    }

    async fn sample(&mut self, sensor: SensorId, cancel: &mut CancelToken) -> Result<Samples, Cancelled> {
        let count = self.settings.samples_per_read;
        let timeout = self.settings.sample_timeout;
        let mut samples = Samples::new();

        for i in 0..count {
            let pulse = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                pulse = tokio::time::timeout(timeout, self.hardware.measure_pulse(sensor, timeout)) => {
                    pulse.ok().flatten()
                }
            };
            let sample =
                RangingSample::from_pulse(sensor, pulse, self.settings.us_per_inch, &self.settings.band);
            trace!(sensor = %sensor, pulse_us = ?pulse, distance_in = %sample.distance_in, valid = %sample.valid, "gate_sample");
            samples.push(sample);

            if i + 1 < count && !cancel.sleep(self.settings.sample_gap).await {
                return Err(Cancelled);
            }
        }
        Ok(samples)
    }

    fn check_trigger(&self, sensor: SensorId, distance_in: f64) -> Option<(f64, SensorId)> {
        let trigger = self.settings.trigger_distance_in;
        match self.settings.policy {
            TriggerPolicy::Either => (distance_in <= trigger).then_some((distance_in, sensor)),
            TriggerPolicy::All => {
                let mut sum = 0.0;
                for id in &self.settings.sensors {
                    match self.latest.get(id) {
                        Some(value) if *value <= trigger => sum += value,
                        _ => return None,
                    }
                }
                Some((sum / self.settings.sensors.len() as f64, sensor))
            }
        }
    }
}

impl<H: PulseSensor + 'static> ProximityGate<H> {
    /// Run the gate on its own task
    pub fn spawn(self, buffer: usize) -> GateHandle {
        let (events_tx, events) = mpsc::channel(buffer.max(1));
        let (cancel, token) = cancel_pair();
        let task = tokio::spawn(self.run(events_tx, token));
        GateHandle { events, cancel, task }
    }
}

/// A gate running on its own task
pub struct GateHandle {
    pub events: mpsc::Receiver<GateEvent>,
    cancel: CancelHandle,
    task: JoinHandle<GateOutcome>,
}

impl GateHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the gate task to end
    pub async fn finish(self) -> GateOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "gate_task_failed");
                GateOutcome::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ranging::{AbsentHardware, ScriptedPulses};
    use tokio::time::timeout;

    const BAND: PlausibilityBand = PlausibilityBand { hard_min_in: 6.0, max_in: 254.0 };
    const US_PER_INCH: f64 = 147.0;

    fn settings(sensors: &[u8]) -> GateSettings {
        GateSettings {
            sensors: sensors.iter().map(|id| SensorId(*id)).collect(),
            trigger_distance_in: 13.0,
            settle: Duration::ZERO,
            quiet: Duration::from_millis(1),
            samples_per_read: 5,
            sample_timeout: Duration::from_millis(2),
            sample_gap: Duration::ZERO,
            band: BAND,
            soft_min_in: 13.0,
            us_per_inch: US_PER_INCH,
            policy: TriggerPolicy::Either,
        }
    }

    fn samples(values: &[Option<f64>]) -> Vec<RangingSample> {
        values
            .iter()
            .map(|v| RangingSample::from_pulse(SensorId(1), v.map(|i| i * US_PER_INCH), US_PER_INCH, &BAND))
            .collect()
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new())
    }

    async fn next_event(handle: &mut GateHandle) -> GateEvent {
        timeout(Duration::from_secs(5), handle.events.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_trimmed_mean() {
        assert_eq!(trimmed_mean(&mut [100.0, 10.0, 12.0, 11.0, 13.0]), Some(12.0));
        assert_eq!(trimmed_mean(&mut [10.0, 20.0]), Some(15.0));
        assert_eq!(trimmed_mean(&mut []), None);
    }

    #[test]
    fn test_trimmed_mean_stays_within_sample_range() {
        let cases: [&[f64]; 4] =
            [&[7.0], &[7.0, 250.0, 30.0], &[9.0, 9.5, 200.0, 6.0, 12.0, 13.0], &[50.0; 6]];
        for case in cases {
            let mut values = case.to_vec();
            let mean = trimmed_mean(&mut values).unwrap();
            let min = case.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = case.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            assert!(mean >= min && mean <= max, "{mean} outside [{min}, {max}]");
        }
    }

    #[test]
    fn test_reduce_read_fresh_smoothed_held() {
        let mut state = SensorState::default();

        let fresh = reduce_read(&samples(&[Some(20.0), Some(20.0), None]), &mut state, 13.0);
        assert_eq!(fresh, Some((20.0, ReadingSource::Fresh)));

        // Below the soft minimum with history: averaged with the previous value
        let smoothed = reduce_read(&samples(&[Some(10.0)]), &mut state, 13.0);
        assert_eq!(smoothed, Some((15.0, ReadingSource::Smoothed)));

        // Nothing valid: previous value held, state unchanged
        let held = reduce_read(&samples(&[None, Some(2.0), Some(300.0)]), &mut state, 13.0);
        assert_eq!(held, Some((15.0, ReadingSource::Held)));
        assert_eq!(state.last_valid_in, Some(15.0));
    }

    #[test]
    fn test_reduce_read_without_history() {
        let mut state = SensorState::default();
        assert_eq!(reduce_read(&samples(&[None, Some(2.0)]), &mut state, 13.0), None);

        // No history: a close reading is taken as-is
        let close = reduce_read(&samples(&[Some(8.0)]), &mut state, 13.0);
        assert_eq!(close, Some((8.0, ReadingSource::Fresh)));
    }

    #[test]
    fn test_validate_settings() {
        assert!(settings(&[1, 2]).validate().is_ok());
        assert_eq!(settings(&[]).validate(), Err(ConfigError::NoSensors));
        assert_eq!(settings(&[3, 3]).validate(), Err(ConfigError::DuplicateSensor(3)));

        let mut bad = settings(&[1]);
        bad.band = PlausibilityBand { hard_min_in: 10.0, max_in: 10.0 };
        assert!(matches!(bad.validate(), Err(ConfigError::EmptyBand { .. })));

        let mut bad = settings(&[1]);
        bad.samples_per_read = 0;
        assert_eq!(bad.validate(), Err(ConfigError::NonPositive("samples_per_read")));
    }

    #[test]
    fn test_absent_hardware_fails_construction() {
        let result = ProximityGate::new(settings(&[1, 2]), AbsentHardware::new("no driver"), metrics());
        assert!(matches!(result, Err(GateError::Hardware(_))));
    }

    #[tokio::test]
    async fn test_ready_on_single_close_sample() {
        let hw = ScriptedPulses::new(US_PER_INCH)
            .with_inches(SensorId(1), &[Some(10.0), None, None, None, None]);
        let metrics = metrics();
        let gate = ProximityGate::new(settings(&[1, 2]), hw, metrics.clone()).unwrap();
        let mut handle = gate.spawn(16);

        assert_eq!(
            next_event(&mut handle).await,
            GateEvent::Reading { sensor: SensorId(1), distance_in: 10.0, source: ReadingSource::Fresh }
        );
        assert_eq!(next_event(&mut handle).await, GateEvent::Ready { distance_in: 10.0, sensor: SensorId(1) });
        assert_eq!(handle.finish().await, GateOutcome::Ready { distance_in: 10.0, sensor: SensorId(1) });
        assert_eq!(metrics.report().gate_triggers, 1);
    }

    #[tokio::test]
    async fn test_implausible_samples_never_trigger() {
        // 2 in is below the hard minimum on every sample
        let hw = ScriptedPulses::new(US_PER_INCH)
            .with_fallback_inches(SensorId(1), 2.0)
            .with_fallback_inches(SensorId(2), 2.0);
        let read_log = hw.read_log();
        let gate = ProximityGate::new(settings(&[1, 2]), hw, metrics()).unwrap();
        let mut handle = gate.spawn(16);

        for expected in [1, 2, 1, 2, 1, 2] {
            assert_eq!(next_event(&mut handle).await, GateEvent::NoReading { sensor: SensorId(expected) });
        }
        handle.cancel();
        assert_eq!(handle.finish().await, GateOutcome::Cancelled);

        // Strict alternation: all samples of one read before the next sensor
        let log = read_log.lock();
        for (i, chunk) in log.chunks(5).enumerate() {
            let expected = if i % 2 == 0 { SensorId(1) } else { SensorId(2) };
            assert!(chunk.iter().all(|s| *s == expected));
        }
    }

    #[tokio::test]
    async fn test_far_object_never_ready() {
        let hw = ScriptedPulses::new(US_PER_INCH)
            .with_fallback_inches(SensorId(1), 40.0)
            .with_fallback_inches(SensorId(2), 13.5);
        let gate = ProximityGate::new(settings(&[1, 2]), hw, metrics()).unwrap();
        let mut handle = gate.spawn(16);

        for _ in 0..8 {
            match next_event(&mut handle).await {
                GateEvent::Reading { distance_in, .. } => assert!(distance_in > 13.0),
                other => panic!("unexpected event {other:?}"),
            }
        }
        handle.cancel();
        assert_eq!(handle.finish().await, GateOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_same_sensor_skips_settle() {
        let mut cfg = settings(&[1]);
        cfg.settle = Duration::from_secs(600);
        let hw = ScriptedPulses::new(US_PER_INCH).with_fallback_inches(SensorId(1), 40.0);
        let gate = ProximityGate::new(cfg, hw, metrics()).unwrap();
        let mut handle = gate.spawn(16);

        // A settle wait would stall the second read far past the timeout
        for _ in 0..3 {
            assert!(matches!(next_event(&mut handle).await, GateEvent::Reading { sensor: SensorId(1), .. }));
        }
        handle.cancel();
        assert_eq!(handle.finish().await, GateOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_settle_is_prompt() {
        let mut cfg = settings(&[1, 2]);
        cfg.settle = Duration::from_secs(600);
        let hw = ScriptedPulses::new(US_PER_INCH)
            .with_fallback_inches(SensorId(1), 40.0)
            .with_fallback_inches(SensorId(2), 40.0);
        let gate = ProximityGate::new(cfg, hw, metrics()).unwrap();
        let mut handle = gate.spawn(16);

        assert!(matches!(next_event(&mut handle).await, GateEvent::Reading { sensor: SensorId(1), .. }));
        handle.cancel();
        let outcome = timeout(Duration::from_secs(5), handle.finish()).await.unwrap();
        assert_eq!(outcome, GateOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_emits_nothing() {
        let hw = ScriptedPulses::new(US_PER_INCH).with_fallback_inches(SensorId(1), 10.0);
        let gate = ProximityGate::new(settings(&[1]), hw, metrics()).unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (cancel, token) = cancel_pair();
        cancel.cancel();

        assert_eq!(gate.run(events_tx, token).await, GateOutcome::Cancelled);
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_all_policy_waits_for_every_sensor() {
        let mut cfg = settings(&[1, 2]);
        cfg.policy = TriggerPolicy::All;
        let hw = ScriptedPulses::new(US_PER_INCH)
            .with_fallback_inches(SensorId(1), 10.0)
            .with_inches(SensorId(2), &[Some(40.0); 5])
            .with_fallback_inches(SensorId(2), 13.0);
        let gate = ProximityGate::new(cfg, hw, metrics()).unwrap();
        let mut handle = gate.spawn(16);

        let mut ready = None;
        for _ in 0..5 {
            if let GateEvent::Ready { distance_in, sensor } = next_event(&mut handle).await {
                ready = Some((distance_in, sensor));
                break;
            }
        }
        // S1 10, S2 40, S1 10, S2 13 -> ready on the fourth read
        let (distance_in, sensor) = ready.unwrap();
        assert_eq!(sensor, SensorId(2));
        assert!((distance_in - 11.5).abs() < 1e-9);
        assert!(matches!(handle.finish().await, GateOutcome::Ready { .. }));
    }

    #[tokio::test]
    async fn test_cancel_while_consumer_stalled() {
        // The status event fills the only slot; Ready then waits for space
        let hw = ScriptedPulses::new(US_PER_INCH).with_fallback_inches(SensorId(1), 10.0);
        let metrics = metrics();
        let gate = ProximityGate::new(settings(&[1]), hw, metrics.clone()).unwrap();
        let handle = gate.spawn(1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let outcome = timeout(Duration::from_secs(5), handle.finish()).await.unwrap();
        assert_eq!(outcome, GateOutcome::Cancelled);
        assert_eq!(metrics.report().gate_triggers, 0);
    }
}
