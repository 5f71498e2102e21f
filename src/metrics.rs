//! Usage and cost aggregation
//!
//! Ports report a [`Usage`] record when a call completes; the turn controller
//! stamps it with the stage, port identity and measured latency to form a
//! [`MetricEvent`], which the session's [`MetricsAggregator`] folds into a
//! running [`UsageSummary`].
//!
//! All counters are integers (cost in micro-dollars) so that the summary is
//! exactly the same whatever order events arrive in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

/// Pipeline stage that produced a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Speech-to-text
    Stt,
    /// Language model
    Llm,
    /// Text-to-speech
    Tts,
}

impl Stage {
    /// Stable lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage figures reported by a port for one completed call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// LLM prompt tokens
    pub prompt_tokens: u64,
    /// LLM prompt tokens served from the provider cache
    pub cached_prompt_tokens: u64,
    /// LLM completion tokens
    pub completion_tokens: u64,
    /// Characters sent to TTS
    pub characters: u64,
    /// Audio processed (STT) or produced (TTS)
    pub audio_duration: Duration,
    /// Estimated cost in micro-dollars
    pub cost_micros: u64,
}

/// Immutable usage record for one completed port call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricEvent {
    /// Stage that did the work
    pub stage: Stage,
    /// Identity string of the port implementation
    pub source: String,
    /// Turn sequence number (0 for the greeting)
    pub turn: u64,
    /// Reported usage
    pub usage: Usage,
    /// Wall time from call start to stream exhaustion
    pub latency: Duration,
}

impl MetricEvent {
    /// Build an event for `stage`
    #[must_use]
    pub fn new(stage: Stage, source: impl Into<String>, turn: u64, usage: Usage, latency: Duration) -> Self {
        Self {
            stage,
            source: source.into(),
            turn,
            usage,
            latency,
        }
    }
}

/// Totals for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageUsage {
    /// Number of events folded in
    pub events: u64,
    /// Sum of prompt tokens
    pub prompt_tokens: u64,
    /// Sum of cached prompt tokens
    pub cached_prompt_tokens: u64,
    /// Sum of completion tokens
    pub completion_tokens: u64,
    /// Sum of characters
    pub characters: u64,
    /// Sum of audio durations
    pub audio_duration: Duration,
    /// Sum of call latencies
    pub total_latency: Duration,
    /// Sum of cost estimates in micro-dollars
    pub cost_micros: u64,
}

impl StageUsage {
    fn add(&mut self, event: &MetricEvent) {
        let usage = &event.usage;
        self.events += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.cached_prompt_tokens += usage.cached_prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.characters += usage.characters;
        self.audio_duration += usage.audio_duration;
        self.total_latency += event.latency;
        self.cost_micros += usage.cost_micros;
    }
}

/// Running per-stage aggregate of metric events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    stages: BTreeMap<Stage, StageUsage>,
}

impl UsageSummary {
    /// Fold one event into the summary
    pub fn add(&mut self, event: &MetricEvent) {
        self.stages.entry(event.stage).or_default().add(event);
    }

    /// Totals for a stage (zeroed if the stage never reported)
    #[must_use]
    pub fn stage(&self, stage: Stage) -> StageUsage {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }

    /// Whether no event has been collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Total number of collected events
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.stages.values().map(|s| s.events).sum()
    }

    /// LLM prompt tokens
    #[must_use]
    pub fn llm_prompt_tokens(&self) -> u64 {
        self.stage(Stage::Llm).prompt_tokens
    }

    /// LLM prompt tokens served from cache
    #[must_use]
    pub fn llm_cached_prompt_tokens(&self) -> u64 {
        self.stage(Stage::Llm).cached_prompt_tokens
    }

    /// LLM completion tokens
    #[must_use]
    pub fn llm_completion_tokens(&self) -> u64 {
        self.stage(Stage::Llm).completion_tokens
    }

    /// Characters synthesized
    #[must_use]
    pub fn tts_characters(&self) -> u64 {
        self.stage(Stage::Tts).characters
    }

    /// Audio produced by TTS
    #[must_use]
    pub fn tts_audio_duration(&self) -> Duration {
        self.stage(Stage::Tts).audio_duration
    }

    /// Audio transcribed by STT
    #[must_use]
    pub fn stt_audio_duration(&self) -> Duration {
        self.stage(Stage::Stt).audio_duration
    }

    /// Total estimated cost across stages, in micro-dollars
    #[must_use]
    pub fn total_cost_micros(&self) -> u64 {
        self.stages.values().map(|s| s.cost_micros).sum()
    }
}

impl fmt::Display for UsageSummary {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "llm_prompt_tokens={} llm_prompt_cached_tokens={} llm_completion_tokens={} \
             tts_characters_count={} tts_audio_duration={:.2}s stt_audio_duration={:.2}s \
             cost=${:.6}",
            self.llm_prompt_tokens(),
            self.llm_cached_prompt_tokens(),
            self.llm_completion_tokens(),
            self.tts_characters(),
            self.tts_audio_duration().as_secs_f64(),
            self.stt_audio_duration().as_secs_f64(),
            self.total_cost_micros() as f64 / 1_000_000.0,
        )
    }
}

/// Session-scoped, thread-safe usage collector
///
/// Cloning yields another handle to the same summary. `collect` holds the
/// lock only for the fold itself, so concurrent port calls are never
/// serialized behind each other.
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    summary: Arc<Mutex<UsageSummary>>,
}

impl MetricsAggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and accumulate one event
    pub fn collect(&self, event: &MetricEvent) {
        log_metric(event);
        let mut summary = self.summary.lock().unwrap_or_else(|e| e.into_inner());
        summary.add(event);
    }

    /// Snapshot of everything collected so far
    #[must_use]
    pub fn summary(&self) -> UsageSummary {
        self.summary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Emit a structured log record for one metric event
pub fn log_metric(event: &MetricEvent) {
    let usage = &event.usage;
    match event.stage {
        Stage::Llm => tracing::info!(
            stage = %event.stage,
            source = %event.source,
            turn = event.turn,
            prompt_tokens = usage.prompt_tokens,
            cached_prompt_tokens = usage.cached_prompt_tokens,
            completion_tokens = usage.completion_tokens,
            latency_ms = duration_to_ms(event.latency),
            cost_micros = usage.cost_micros,
            "llm metrics"
        ),
        Stage::Tts => tracing::info!(
            stage = %event.stage,
            source = %event.source,
            turn = event.turn,
            characters = usage.characters,
            audio_ms = duration_to_ms(usage.audio_duration),
            latency_ms = duration_to_ms(event.latency),
            cost_micros = usage.cost_micros,
            "tts metrics"
        ),
        Stage::Stt => tracing::info!(
            stage = %event.stage,
            source = %event.source,
            turn = event.turn,
            audio_ms = duration_to_ms(usage.audio_duration),
            latency_ms = duration_to_ms(event.latency),
            cost_micros = usage.cost_micros,
            "stt metrics"
        ),
    }
}

/// Shutdown callback that logs the session's final usage
///
/// # Errors
///
/// Never fails; the signature matches shutdown callbacks
#[allow(clippy::unused_async)]
pub async fn log_usage(summary: UsageSummary) -> crate::Result<()> {
    tracing::info!(
        events = summary.event_count(),
        llm_prompt_tokens = summary.llm_prompt_tokens(),
        llm_prompt_cached_tokens = summary.llm_cached_prompt_tokens(),
        llm_completion_tokens = summary.llm_completion_tokens(),
        tts_characters_count = summary.tts_characters(),
        tts_audio_ms = duration_to_ms(summary.tts_audio_duration()),
        stt_audio_ms = duration_to_ms(summary.stt_audio_duration()),
        cost_micros = summary.total_cost_micros(),
        "usage: {summary}"
    );
    Ok(())
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Vec<MetricEvent> {
        vec![
            MetricEvent::new(
                Stage::Stt,
                "openai-stt",
                1,
                Usage {
                    audio_duration: Duration::from_millis(1200),
                    cost_micros: 120,
                    ..Usage::default()
                },
                Duration::from_millis(300),
            ),
            MetricEvent::new(
                Stage::Llm,
                "openai-llm",
                1,
                Usage {
                    prompt_tokens: 40,
                    cached_prompt_tokens: 8,
                    completion_tokens: 12,
                    cost_micros: 33,
                    ..Usage::default()
                },
                Duration::from_millis(450),
            ),
            MetricEvent::new(
                Stage::Tts,
                "rime-tts",
                1,
                Usage {
                    characters: 57,
                    audio_duration: Duration::from_millis(2100),
                    cost_micros: 1710,
                    ..Usage::default()
                },
                Duration::from_millis(180),
            ),
            MetricEvent::new(
                Stage::Llm,
                "openai-llm",
                2,
                Usage {
                    prompt_tokens: 70,
                    completion_tokens: 20,
                    cost_micros: 58,
                    ..Usage::default()
                },
                Duration::from_millis(500),
            ),
        ]
    }

    #[test]
    fn summary_sums_by_stage() {
        let aggregator = MetricsAggregator::new();
        for event in &events() {
            aggregator.collect(event);
        }

        let summary = aggregator.summary();
        assert_eq!(summary.event_count(), 4);
        assert_eq!(summary.llm_prompt_tokens(), 110);
        assert_eq!(summary.llm_cached_prompt_tokens(), 8);
        assert_eq!(summary.llm_completion_tokens(), 32);
        assert_eq!(summary.tts_characters(), 57);
        assert_eq!(summary.tts_audio_duration(), Duration::from_millis(2100));
        assert_eq!(summary.stt_audio_duration(), Duration::from_millis(1200));
        assert_eq!(summary.stage(Stage::Llm).events, 2);
        assert_eq!(summary.stage(Stage::Llm).total_latency, Duration::from_millis(950));
        assert_eq!(summary.total_cost_micros(), 1921);
    }

    #[test]
    fn summary_is_order_independent() {
        let forward = MetricsAggregator::new();
        let reverse = MetricsAggregator::new();
        let interleaved = MetricsAggregator::new();

        let all = events();
        for event in &all {
            forward.collect(event);
        }
        for event in all.iter().rev() {
            reverse.collect(event);
        }
        for idx in [2, 0, 3, 1] {
            interleaved.collect(&all[idx]);
        }

        assert_eq!(forward.summary(), reverse.summary());
        assert_eq!(forward.summary(), interleaved.summary());
    }

    #[tokio::test]
    async fn concurrent_collect_matches_sequential() {
        let aggregator = MetricsAggregator::new();
        let all = events();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let aggregator = aggregator.clone();
            let all = all.clone();
            handles.push(tokio::spawn(async move {
                for event in &all {
                    aggregator.collect(event);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut expected = UsageSummary::default();
        for _ in 0..8 {
            for event in &all {
                expected.add(event);
            }
        }
        assert_eq!(aggregator.summary(), expected);
    }

    #[test]
    fn empty_summary_reports_zero() {
        let summary = MetricsAggregator::new().summary();
        assert!(summary.is_empty());
        assert_eq!(summary.stage(Stage::Tts), StageUsage::default());
        assert!(summary.to_string().contains("llm_prompt_tokens=0"));
    }
}
