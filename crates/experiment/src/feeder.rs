//! Live-update consumer loop.
//!
//! For the duration of one scan, [`LiveUpdateFeeder::run`] forwards every
//! datapoint from the result channel to a [`PlotSink`], in emission order,
//! until the `stop_live_plotting` sentinel arrives. An empty channel is not
//! the end of the scan: the loop keeps waiting, one poll interval at a time.

use std::path::Path;
use std::time::Duration;

use common::{Channel, ScanResult};
use tracing::{debug, instrument, trace, warn};

/// Receiver of produced data files.
///
/// Called from the feeder task, so implementations must be thread-safe and
/// should only hand the path off, not render.
pub trait PlotSink: Send + Sync {
    fn plot(&self, path: &Path) -> anyhow::Result<()>;
}

/// What one feeder run saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// Datapoints handed to the sink.
    pub datapoints: usize,
    /// Datapoints the sink rejected.
    pub sink_errors: usize,
    /// Results that do not belong in a scan stream.
    pub skipped: usize,
}

pub struct LiveUpdateFeeder {
    results: Channel<ScanResult>,
    poll_interval: Duration,
}

impl LiveUpdateFeeder {
    pub fn new(results: Channel<ScanResult>, poll_interval: Duration) -> Self {
        Self {
            results,
            poll_interval,
        }
    }

    /// Drain results until the sentinel, then call `on_complete` once.
    #[instrument(skip_all)]
    pub async fn run<S, F>(&self, sink: &S, on_complete: F) -> FeedSummary
    where
        S: PlotSink + ?Sized,
        F: FnOnce(&FeedSummary),
    {
        let mut summary = FeedSummary::default();
        loop {
            let Some(result) = self.results.recv_timeout(self.poll_interval).await else {
                trace!("No result yet");
                continue;
            };
            match result {
                ScanResult::Datapoint(path) => {
                    debug!(path = %path.display(), "Datapoint");
                    summary.datapoints += 1;
                    if let Err(e) = sink.plot(&path) {
                        warn!(path = %path.display(), error = %e, "Plot sink rejected datapoint");
                        summary.sink_errors += 1;
                    }
                    tokio::task::yield_now().await;
                }
                ScanResult::StopLivePlotting => break,
                ScanResult::Devices(_) => {
                    warn!("Ignoring device list received during a scan");
                    summary.skipped += 1;
                }
            }
        }
        debug!(datapoints = summary.datapoints, "Live updates finished");
        on_complete(&summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingSink {
        plotted: Mutex<Vec<PathBuf>>,
    }

    impl PlotSink for RecordingSink {
        fn plot(&self, path: &Path) -> anyhow::Result<()> {
            self.plotted.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    struct FailingSink;

    impl PlotSink for FailingSink {
        fn plot(&self, _path: &Path) -> anyhow::Result<()> {
            anyhow::bail!("renderer gone")
        }
    }

    #[tokio::test]
    async fn test_plots_in_order_then_completes_once() {
        let results = Channel::new();
        results.send(ScanResult::Datapoint("f1.txt".into()));
        results.send(ScanResult::Datapoint("f2.txt".into()));
        results.send(ScanResult::StopLivePlotting);

        let sink = RecordingSink::default();
        let mut completions = 0;
        let feeder = LiveUpdateFeeder::new(results.clone(), Duration::from_millis(5));
        let summary = feeder.run(&sink, |_| completions += 1).await;

        assert_eq!(
            *sink.plotted.lock(),
            vec![PathBuf::from("f1.txt"), PathBuf::from("f2.txt")]
        );
        assert_eq!(completions, 1);
        assert_eq!(summary.datapoints, 2);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_keeps_waiting_across_empty_ticks() {
        let results = Channel::new();
        let producer = results.clone();
        tokio::spawn(async move {
            for name in ["a", "b"] {
                tokio::time::sleep(Duration::from_millis(30)).await;
                producer.send(ScanResult::Datapoint(name.into()));
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.send(ScanResult::StopLivePlotting);
        });

        let sink = RecordingSink::default();
        let feeder = LiveUpdateFeeder::new(results, Duration::from_millis(1));
        let summary = tokio::time::timeout(Duration::from_secs(5), feeder.run(&sink, |_| {}))
            .await
            .unwrap();
        assert_eq!(summary.datapoints, 2);
        assert_eq!(sink.plotted.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_sink_errors_and_stray_devices_do_not_stop_feed() {
        let results = Channel::new();
        results.send(ScanResult::Devices(Default::default()));
        results.send(ScanResult::Datapoint("f1.txt".into()));
        results.send(ScanResult::StopLivePlotting);
        results.send(ScanResult::Datapoint("next-scan.txt".into()));

        let feeder = LiveUpdateFeeder::new(results.clone(), Duration::from_millis(5));
        let summary = feeder.run(&FailingSink, |_| {}).await;
        assert_eq!(
            summary,
            FeedSummary {
                datapoints: 1,
                sink_errors: 1,
                skipped: 1
            }
        );
        // Nothing past the sentinel is consumed
        assert_eq!(results.len(), 1);
    }
}
