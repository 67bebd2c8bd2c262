//! pipeline — rate-limited frame analysis
//!
//! [`FrameAnalyzer`] turns a push-based stream of [`FrameHandle`]s into a
//! stream of ranked [`AnalysisResult`]s. At most one frame is in flight: while
//! a frame is being analysed, and during the cooldown that follows a
//! successful analysis, further submissions are refused and their handles are
//! released immediately.
//!
//! The accepted frame's handle is held until the cooldown ends, so a gated
//! source stops decoding-and-offering frames for that long as well.
//!
//! A frame whose conversion or classification fails, or panics, is logged and
//! dropped; the worker keeps running and the next frame is accepted at once.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::convert::FrameConverter;
use crate::engine::Classifier;
use crate::recognition::{MAX_RESULT_DISPLAY, Recognition, rank};
use crate::video::FrameHandle;

/// Minimum pause after a successful analysis.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(2_000);
/// Emit a timing summary every N analysed frames.
const PROFILE_EVERY: u64 = 50;

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerConfig {
    pub cooldown: Duration,
    pub max_results: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            max_results: MAX_RESULT_DISPLAY,
        }
    }
}

/// Ranked recognitions for one accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    /// Assigned on acceptance; strictly increasing.
    pub sequence: u64,
    pub recognitions: Vec<Recognition>,
}

/// Outcome of [`FrameAnalyzer::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted(u64),
    /// A frame is in flight or cooling down; the handle was released.
    Busy,
    /// The analyzer has shut down; the handle was released.
    Closed,
}

struct Job {
    sequence: u64,
    handle: FrameHandle,
}

/// Conversion + inference for one frame, run on a blocking thread.
struct Processor<C> {
    converter: FrameConverter,
    classifier: C,
    max_results: usize,
    prof_frames: u64,
    prof_convert: Duration,
    prof_infer: Duration,
}

impl<C: Classifier> Processor<C> {
    /// `Ok(None)` when the handle carries no image.
    fn process(&mut self, handle: &FrameHandle) -> Result<Option<Vec<Recognition>>> {
        let Some(frame) = handle.frame() else {
            return Ok(None);
        };

        let convert_start = Instant::now();
        let rgb = self.converter.convert(frame)?;
        self.prof_convert += convert_start.elapsed();

        let infer_start = Instant::now();
        let categories = self.classifier.classify(&rgb)?;
        self.prof_infer += infer_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames % PROFILE_EVERY == 0 {
            let frames = self.prof_frames as f64;
            info!(
                frames = self.prof_frames,
                convert_ms_per_frame =
                    format!("{:.2}", self.prof_convert.as_secs_f64() * 1000.0 / frames),
                infer_ms_per_frame =
                    format!("{:.2}", self.prof_infer.as_secs_f64() * 1000.0 / frames),
                "analyzer timings"
            );
        }

        Ok(Some(rank(categories, self.max_results)))
    }
}

/// Single-flight, cooldown-throttled frame analyzer.
pub struct FrameAnalyzer {
    jobs: mpsc::UnboundedSender<Job>,
    busy: Arc<AtomicBool>,
    next_sequence: AtomicU64,
    worker: JoinHandle<()>,
}

impl FrameAnalyzer {
    /// Start the worker task. Must be called from within a Tokio runtime.
    pub fn spawn<C>(
        converter: FrameConverter,
        classifier: C,
        config: AnalyzerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<AnalysisResult>)
    where
        C: Classifier + 'static,
    {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let analyzer = Self::spawn_with_results(converter, classifier, config, results_tx);
        (analyzer, results_rx)
    }

    /// Like [`FrameAnalyzer::spawn`], publishing into an existing channel.
    pub fn spawn_with_results<C>(
        converter: FrameConverter,
        classifier: C,
        config: AnalyzerConfig,
        results_tx: mpsc::UnboundedSender<AnalysisResult>,
    ) -> Self
    where
        C: Classifier + 'static,
    {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));

        let processor = Processor {
            converter,
            classifier,
            max_results: config.max_results,
            prof_frames: 0,
            prof_convert: Duration::ZERO,
            prof_infer: Duration::ZERO,
        };
        let worker = tokio::spawn(run_worker(
            processor,
            jobs_rx,
            results_tx,
            Arc::clone(&busy),
            config.cooldown,
        ));

        Self {
            jobs: jobs_tx,
            busy,
            next_sequence: AtomicU64::new(0),
            worker,
        }
    }

    /// Offer a frame. Never blocks; callable from the decode thread.
    pub fn submit(&self, handle: FrameHandle) -> Submission {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Submission::Busy;
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        match self.jobs.send(Job { sequence, handle }) {
            Ok(()) => {
                debug!(sequence, "frame accepted");
                Submission::Accepted(sequence)
            }
            Err(_) => {
                self.busy.store(false, Ordering::Release);
                Submission::Closed
            }
        }
    }

    /// Whether the next submission would be accepted.
    pub fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }

    /// Stop accepting frames, let an in-flight frame finish (including its
    /// cooldown) and wait for the worker to exit.
    pub async fn shutdown(self) {
        let Self { jobs, worker, .. } = self;
        drop(jobs);
        if let Err(e) = worker.await {
            error!("analyzer worker ended abnormally: {e}");
        }
    }
}

async fn run_worker<C>(
    mut processor: Processor<C>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    results: mpsc::UnboundedSender<AnalysisResult>,
    busy: Arc<AtomicBool>,
    cooldown: Duration,
) where
    C: Classifier + 'static,
{
    while let Some(Job { sequence, handle }) = jobs.recv().await {
        let joined = task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&handle)));
            (processor, handle, outcome)
        })
        .await;

        let (returned, handle, outcome) = match joined {
            Ok(parts) => parts,
            Err(e) => {
                // Only reachable when the runtime is shutting down.
                error!(sequence, "analysis thread lost: {e}");
                busy.store(false, Ordering::Release);
                return;
            }
        };
        processor = returned;

        match outcome {
            Ok(Ok(Some(recognitions))) => {
                debug!(sequence, count = recognitions.len(), "frame analysed");
                if results
                    .send(AnalysisResult {
                        sequence,
                        recognitions,
                    })
                    .is_err()
                {
                    debug!(sequence, "result receiver dropped");
                }
                tokio::time::sleep(cooldown).await;
            }
            Ok(Ok(None)) => debug!(sequence, "frame carried no image; skipped"),
            Ok(Err(e)) => warn!(sequence, "frame analysis failed: {e:#}"),
            Err(payload) => error!(
                sequence,
                "frame analysis panicked: {}",
                panic_message(&*payload)
            ),
        }

        // Idle before the source slot frees up.
        busy.store(false, Ordering::Release);
        handle.release();
    }
    debug!("analyzer worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::bail;

    use super::*;
    use crate::convert::Rotation;
    use crate::recognition::Category;
    use crate::video::{FrameGate, RgbFrame, YuvFrame};

    const COOLDOWN: Duration = Duration::from_millis(2_000);

    struct Scripted {
        calls: Arc<AtomicUsize>,
        scores: Vec<(&'static str, f32)>,
        fail: bool,
    }

    impl Classifier for Scripted {
        fn classify(&mut self, _frame: &RgbFrame) -> Result<Vec<Category>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("model exploded");
            }
            Ok(self
                .scores
                .iter()
                .map(|(l, s)| Category::new(*l, *s))
                .collect())
        }
    }

    fn frame() -> YuvFrame {
        YuvFrame {
            y: vec![128; 4],
            u: vec![128],
            v: vec![128],
            width: 2,
            height: 2,
            rotation: Rotation::None,
            pts: 0,
        }
    }

    fn analyzer(
        scores: Vec<(&'static str, f32)>,
        fail: bool,
    ) -> (
        FrameAnalyzer,
        mpsc::UnboundedReceiver<AnalysisResult>,
        Arc<AtomicUsize>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let classifier = Scripted {
            calls: Arc::clone(&calls),
            scores,
            fail,
        };
        let converter = FrameConverter::new(2, 2, Rotation::None).unwrap();
        let config = AnalyzerConfig {
            cooldown: COOLDOWN,
            ..AnalyzerConfig::default()
        };
        let (analyzer, results) = FrameAnalyzer::spawn(converter, classifier, config);
        (analyzer, results, calls)
    }

    async fn wait_until_idle(analyzer: &FrameAnalyzer) {
        for _ in 0..1_000 {
            if analyzer.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("analyzer never became idle");
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_ranked_top_three() {
        let (analyzer, mut results, _) = analyzer(
            vec![("a", 0.2), ("b", 0.9), ("c", 0.5), ("d", 0.1)],
            false,
        );
        assert_eq!(
            analyzer.submit(FrameHandle::detached(Some(frame()))),
            Submission::Accepted(0)
        );

        let result = results.recv().await.unwrap();
        assert_eq!(result.sequence, 0);
        let scores: Vec<f32> = result.recognitions.iter().map(|r| r.confidence()).collect();
        assert_eq!(scores, vec![0.9, 0.5, 0.2]);
        assert_eq!(result.recognitions[0].label(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_inference_still_publishes() {
        let (analyzer, mut results, _) = analyzer(Vec::new(), false);
        analyzer.submit(FrameHandle::detached(Some(frame())));
        let result = results.recv().await.unwrap();
        assert!(result.recognitions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_during_cooldown_are_refused() {
        let (analyzer, mut results, calls) = analyzer(vec![("rose", 0.8)], false);
        let gate = FrameGate::new();

        let first = gate.offer(Some(frame())).unwrap();
        assert_eq!(analyzer.submit(first), Submission::Accepted(0));
        results.recv().await.unwrap();

        // Handle is held for the whole cooldown.
        assert!(gate.is_busy());
        assert!(!analyzer.is_idle());

        tokio::time::sleep(COOLDOWN / 2).await;
        assert_eq!(
            analyzer.submit(FrameHandle::detached(Some(frame()))),
            Submission::Busy
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.try_recv().is_err());

        tokio::time::sleep(COOLDOWN / 2 + Duration::from_millis(10)).await;
        assert!(!gate.is_busy());
        assert!(analyzer.is_idle());

        let next = gate.offer(Some(frame())).unwrap();
        assert_eq!(analyzer.submit(next), Submission::Accepted(1));
        assert_eq!(results.recv().await.unwrap().sequence, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_image_releases_without_result() {
        let (analyzer, mut results, calls) = analyzer(vec![("rose", 0.8)], false);
        let gate = FrameGate::new();

        let handle = gate.offer(None).unwrap();
        assert_eq!(analyzer.submit(handle), Submission::Accepted(0));
        wait_until_idle(&analyzer).await;

        assert!(!gate.is_busy());
        assert!(results.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inference_failure_is_swallowed() {
        let (analyzer, mut results, calls) = analyzer(vec![("rose", 0.8)], true);
        let gate = FrameGate::new();

        assert_eq!(
            analyzer.submit(gate.offer(Some(frame())).unwrap()),
            Submission::Accepted(0)
        );
        wait_until_idle(&analyzer).await;

        assert!(!gate.is_busy());
        assert!(results.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // No cooldown after a failure.
        assert_eq!(
            analyzer.submit(gate.offer(Some(frame())).unwrap()),
            Submission::Accepted(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn conversion_failure_is_swallowed() {
        let (analyzer, mut results, calls) = analyzer(vec![("rose", 0.8)], false);
        let mut wrong_size = frame();
        wrong_size.width = 4;

        analyzer.submit(FrameHandle::detached(Some(wrong_size)));
        wait_until_idle(&analyzer).await;

        assert!(results.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Panics on its first call, then classifies normally.
    struct PanicsOnce {
        calls: Arc<AtomicUsize>,
    }

    impl Classifier for PanicsOnce {
        fn classify(&mut self, _frame: &RgbFrame) -> Result<Vec<Category>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("classifier blew up");
            }
            Ok(vec![Category::new("tulip", 0.6)])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_panic_does_not_stop_the_analyzer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let converter = FrameConverter::new(2, 2, Rotation::None).unwrap();
        let (analyzer, mut results) = FrameAnalyzer::spawn(
            converter,
            PanicsOnce {
                calls: Arc::clone(&calls),
            },
            AnalyzerConfig::default(),
        );
        let gate = FrameGate::new();

        assert_eq!(
            analyzer.submit(gate.offer(Some(frame())).unwrap()),
            Submission::Accepted(0)
        );
        wait_until_idle(&analyzer).await;
        assert!(!gate.is_busy());
        assert!(results.try_recv().is_err());

        // Still running, and no cooldown after the panic.
        assert_eq!(
            analyzer.submit(gate.offer(Some(frame())).unwrap()),
            Submission::Accepted(1)
        );
        let result = results.recv().await.unwrap();
        assert_eq!(result.sequence, 1);
        assert_eq!(result.recognitions[0].label(), "tulip");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_results() {
        let (analyzer, mut results, _) = analyzer(vec![("rose", 0.8)], false);
        analyzer.submit(FrameHandle::detached(Some(frame())));
        analyzer.shutdown().await;

        // The in-flight frame still completes before the channel closes.
        assert!(results.recv().await.is_some());
        assert!(results.recv().await.is_none());
    }
}
