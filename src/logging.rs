use std::fmt;
use tracing_subscriber::EnvFilter;

/// A metric value in a progress line: numbers get 4 decimals, text is passed through.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(value) => write!(f, "{value:.4}"),
            MetricValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

/// Format one training progress line.
///
/// Layout: `{counter:>5}_{h:>2}:{mm}:{ss} e{epoch} b {batch}/{n_batches} (names)=(values)`.
/// The batch index is zero-padded to the digit count of `n_batches`; the
/// counter prefix is dropped when `counter` is `None`.
pub fn format_progress(
    epoch: usize,
    batch: usize,
    n_batches: usize,
    metrics: &[(&str, MetricValue)],
    elapsed_secs: f64,
    counter: Option<usize>,
) -> String {
    let width = n_batches.to_string().len();
    let names = metrics
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(",");
    let values = metrics
        .iter()
        .map(|(_, value)| value.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let line = format!(
        "{} e{epoch} b {batch:0width$}/{n_batches} ({names})=({values})",
        format_elapsed(elapsed_secs)
    );
    match counter {
        Some(counter) => format!("{counter:>5}_{line}"),
        None => line,
    }
}

/// `H:MM:SS` with the hour right-aligned to two columns; negative or
/// non-finite input renders as zero.
pub fn format_elapsed(elapsed_secs: f64) -> String {
    let total = if elapsed_secs.is_finite() && elapsed_secs > 0.0 {
        elapsed_secs as u64
    } else {
        0
    };
    let (minutes, seconds) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    format!("{hours:>2}:{minutes:02}:{seconds:02}")
}

/// Install the global fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedding) keeps the existing subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
