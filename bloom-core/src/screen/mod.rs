//! screen — latest-results state and the live session wiring
//!
//! [`ScreenState`] holds what the user currently sees: nothing until the first
//! analysis arrives, then the newest ranked list. [`run_live`] composes a
//! camera source, the frame analyzer and a [`ResultsView`].

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info};

use crate::convert::FrameConverter;
use crate::engine::Classifier;
use crate::pipeline::{AnalysisResult, AnalyzerConfig, FrameAnalyzer};
use crate::recognition::Recognition;
use crate::video::{CameraSource, FrameGate, GateStats, SourceSpec};

/// Renders the current recognition rows, in order.
pub trait ResultsView {
    fn render(&mut self, rows: &[Recognition]);
}

#[derive(Debug, Default)]
pub struct ScreenState {
    latest: Vec<Recognition>,
    last_sequence: Option<u64>,
}

impl ScreenState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the shown list. Results not newer than the last applied one
    /// are ignored; returns whether the state changed.
    pub fn apply(&mut self, result: AnalysisResult) -> bool {
        if self.last_sequence.is_some_and(|last| result.sequence <= last) {
            debug!(sequence = result.sequence, "ignoring stale result");
            return false;
        }
        self.last_sequence = Some(result.sequence);
        self.latest = result.recognitions;
        true
    }

    pub fn recognitions(&self) -> &[Recognition] {
        &self.latest
    }

    pub fn has_results(&self) -> bool {
        self.last_sequence.is_some()
    }
}

/// Screen state bound to a view.
pub struct Screen<V> {
    state: ScreenState,
    view: V,
}

impl<V: ResultsView> Screen<V> {
    pub fn new(view: V) -> Self {
        Self {
            state: ScreenState::new(),
            view,
        }
    }

    /// Render every accepted result until the analyzer closes the channel.
    /// Returns the number of re-renders.
    pub async fn run(&mut self, mut results: mpsc::UnboundedReceiver<AnalysisResult>) -> u64 {
        let mut updates = 0;
        while let Some(result) = results.recv().await {
            if self.state.apply(result) {
                self.view.render(self.state.recognitions());
                updates += 1;
            }
        }
        updates
    }

    pub fn state(&self) -> &ScreenState {
        &self.state
    }

    pub fn into_view(self) -> V {
        self.view
    }
}

/// Summary of a finished live session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub frames_decoded: u64,
    pub gate: GateStats,
    pub updates: u64,
    pub latest: Vec<Recognition>,
}

/// Open `spec`, run it through the analyzer until the stream ends or
/// `cancel` is set, rendering results on `view`.
///
/// The source is opened and decoded on a blocking thread; the analyzer worker
/// and the screen run as async tasks. `gate` is the source's delivery gate;
/// callers may keep a clone to watch its counters while the session runs.
pub async fn run_live<C, V>(
    spec: SourceSpec,
    classifier: C,
    config: AnalyzerConfig,
    view: V,
    gate: FrameGate,
    cancel: Arc<AtomicBool>,
) -> Result<SessionReport>
where
    C: Classifier + 'static,
    V: ResultsView + Send + 'static,
{
    let (results_tx, results_rx) = mpsc::unbounded_channel();

    let screen = tokio::spawn(async move {
        let mut screen = Screen::new(view);
        let updates = screen.run(results_rx).await;
        (screen, updates)
    });

    let decode_gate = gate.clone();
    let decode = task::spawn_blocking(move || -> Result<(FrameAnalyzer, u64)> {
        let source = CameraSource::open(&spec)?;
        let converter =
            FrameConverter::new(source.width(), source.height(), source.rotation())
                .context("failed to build frame converter")?;
        let (out_w, out_h) = converter.output_size();
        info!(
            out_w,
            out_h,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "starting live session"
        );

        let analyzer =
            FrameAnalyzer::spawn_with_results(converter, classifier, config, results_tx);
        let decoded = source.run(&decode_gate, &cancel, |handle| {
            analyzer.submit(handle);
        });
        Ok((analyzer, decoded?))
    });

    let decoded = decode.await.context("decode thread panicked")?;
    // On a failed start the sender is already gone, so the screen ends too.
    let frames_decoded = match decoded {
        Ok((analyzer, frames)) => {
            analyzer.shutdown().await;
            frames
        }
        Err(e) => {
            screen.abort();
            return Err(e);
        }
    };
    let (screen, updates) = screen.await.context("screen task panicked")?;

    Ok(SessionReport {
        frames_decoded,
        gate: gate.stats(),
        updates,
        latest: screen.state().recognitions().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<Vec<String>>);

    impl ResultsView for Recorder {
        fn render(&mut self, rows: &[Recognition]) {
            self.0.push(rows.iter().map(|r| r.to_string()).collect());
        }
    }

    fn result(sequence: u64, rows: &[(&str, f32)]) -> AnalysisResult {
        AnalysisResult {
            sequence,
            recognitions: rows.iter().map(|(l, c)| Recognition::new(*l, *c)).collect(),
        }
    }

    #[test]
    fn starts_empty_then_tracks_latest() {
        let mut state = ScreenState::new();
        assert!(!state.has_results());
        assert!(state.recognitions().is_empty());

        assert!(state.apply(result(0, &[("rose", 0.9)])));
        assert!(state.apply(result(3, &[("tulip", 0.6), ("rose", 0.3)])));
        assert_eq!(state.recognitions()[0].label(), "tulip");
        assert_eq!(state.recognitions().len(), 2);
    }

    #[test]
    fn stale_results_are_ignored() {
        let mut state = ScreenState::new();
        state.apply(result(5, &[("daisy", 0.7)]));
        assert!(!state.apply(result(4, &[("rose", 0.9)])));
        assert!(!state.apply(result(5, &[("rose", 0.9)])));
        assert_eq!(state.recognitions()[0].label(), "daisy");
    }

    #[test]
    fn empty_result_clears_rows() {
        let mut state = ScreenState::new();
        state.apply(result(0, &[("daisy", 0.7)]));
        assert!(state.apply(result(1, &[])));
        assert!(state.recognitions().is_empty());
        assert!(state.has_results());
    }

    #[tokio::test]
    async fn screen_renders_each_update_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(result(0, &[("rose", 0.873)])).unwrap();
        tx.send(result(1, &[("tulip", 1.0), ("rose", 0.0)])).unwrap();
        drop(tx);

        let mut screen = Screen::new(Recorder::default());
        assert_eq!(screen.run(rx).await, 2);
        let frames = screen.into_view().0;
        assert_eq!(frames[0], vec!["rose / 87.3%"]);
        assert_eq!(frames[1], vec!["tulip / 100.0%", "rose / 0.0%"]);
    }
}
