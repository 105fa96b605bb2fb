// Logging setup and batch progress reporting

use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `verbose`.
/// Calling this more than once leaves the first subscriber in place.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_writer(std::io::stdout)
        .try_init();
}

/// Progress bar for the inference loop.
pub fn batch_progress(total_batches: usize) -> ProgressBar {
    let pb = ProgressBar::new(total_batches as u64);
    let style = ProgressStyle::default_bar()
        .template("{msg}: [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%)")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    pb.set_style(style);
    pb.set_message("RM batch steps");
    pb
}
