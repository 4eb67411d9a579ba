//! Generation metrics normalization
//!
//! Backends report telemetry in their own units. Everything is converted
//! here into [`GenerationMetrics`], whose fields stay `None` when a backend
//! did not report them.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Fixed-schema metrics for one completed generation call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub prompt_tokens: Option<u64>,
    pub generated_tokens: Option<u64>,
    /// Time to first token, in milliseconds
    pub ttft_ms: Option<f64>,
    pub generation_ms: Option<f64>,
    pub wall_ms: Option<f64>,
}

impl GenerationMetrics {
    pub fn is_unknown(&self) -> bool {
        *self == Self::default()
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        let tokens = self.generated_tokens?;
        let ms = self.generation_ms.filter(|ms| *ms > 0.0)?;
        Some(tokens as f64 / (ms / 1000.0))
    }

    /// One-line caption, e.g. `12/48 tokens • TTFT 85 ms • gen 1200 ms`.
    ///
    /// Only produced when both token counts are known.
    pub fn summary(&self) -> Option<String> {
        let (prompt, generated) = (self.prompt_tokens?, self.generated_tokens?);
        let mut caption = format!("{prompt}/{generated} tokens");
        if let Some(ttft) = self.ttft_ms {
            caption.push_str(&format!(" • TTFT {ttft:.0} ms"));
        }
        if let Some(generation) = self.generation_ms {
            caption.push_str(&format!(" • gen {generation:.0} ms"));
        }
        Some(caption)
    }
}

/// Counters and nanosecond durations reported by the inference daemon on its final chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct DaemonTelemetry {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub eval_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub eval_duration: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total_duration: Option<u64>,
}

impl DaemonTelemetry {
    pub fn normalize(&self) -> GenerationMetrics {
        GenerationMetrics {
            prompt_tokens: self.prompt_eval_count,
            generated_tokens: self.eval_count,
            // Prompt evaluation ends when the first token is produced.
            ttft_ms: self.prompt_eval_duration.map(nanos_to_millis),
            generation_ms: self.eval_duration.map(nanos_to_millis),
            wall_ms: self.total_duration.map(nanos_to_millis),
        }
    }
}

impl From<DaemonTelemetry> for GenerationMetrics {
    fn from(telemetry: DaemonTelemetry) -> Self {
        telemetry.normalize()
    }
}

/// Wall-clock measurements taken around in-process decoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalTelemetry {
    pub prompt_tokens: Option<u64>,
    pub generated_tokens: Option<u64>,
    pub first_fragment: Option<Duration>,
    pub generation: Option<Duration>,
    pub wall: Option<Duration>,
}

impl LocalTelemetry {
    pub fn normalize(&self) -> GenerationMetrics {
        GenerationMetrics {
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated_tokens,
            ttft_ms: self.first_fragment.map(duration_to_millis),
            generation_ms: self.generation.map(duration_to_millis),
            wall_ms: self.wall.map(duration_to_millis),
        }
    }
}

impl From<LocalTelemetry> for GenerationMetrics {
    fn from(telemetry: LocalTelemetry) -> Self {
        telemetry.normalize()
    }
}

fn nanos_to_millis(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_MILLI
}

fn duration_to_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Accept any JSON value; non-integer values degrade to `None`.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => {
            let parsed = value.as_u64();
            if parsed.is_none() {
                warn!(%value, "ignoring malformed telemetry field");
            }
            parsed
        }
    })
}
