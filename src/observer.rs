//! Lifecycle transition events and their terminal renderers.
//!
//! The provisioner publishes a [`Transition`] on a broadcast channel for
//! every phase change. One observer task consumes them in order and renders
//! them for the selected output mode.

use std::collections::HashMap;
use std::time::Duration;

use facet::Facet;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::lifecycle::LifecyclePhase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub vm: String,
    pub from: LifecyclePhase,
    pub to: LifecyclePhase,
}

/// Publish a phase change. Having no subscribers is fine.
pub fn publish_transition(
    tx: &broadcast::Sender<Transition>,
    vm: &str,
    from: LifecyclePhase,
    to: LifecyclePhase,
) {
    let _ = tx.send(Transition {
        vm: vm.to_string(),
        from,
        to,
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One spinner per VM.
    Interactive,
    /// One line per transition, no ANSI.
    Plain,
    /// One JSON object per transition.
    Json,
}

pub trait Observer: Send {
    fn on_transition(&mut self, t: &Transition);

    /// Called once the channel closes.
    fn finish(&mut self) {}
}

pub fn observer_for(mode: OutputMode) -> Box<dyn Observer> {
    match mode {
        OutputMode::Interactive => Box::new(InteractiveObserver::new()),
        OutputMode::Plain => Box::new(PlainObserver),
        OutputMode::Json => Box::new(JsonObserver),
    }
}

/// Drive `observer` until every sender is dropped.
pub fn spawn(
    mut rx: broadcast::Receiver<Transition>,
    mut observer: Box<dyn Observer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(t) => observer.on_transition(&t),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "observer lagged behind transitions");
                }
                Err(RecvError::Closed) => break,
            }
        }
        observer.finish();
    })
}

// ── Interactive ───────────────────────────────────────────

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} {spinner:.cyan} {msg}")
        .unwrap()
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} \u{2713} {msg:.green}")
        .unwrap()
}

fn degraded_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} ! {msg:.yellow}")
        .unwrap()
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} \u{2717} {msg:.red}")
        .unwrap()
}

pub struct InteractiveObserver {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl InteractiveObserver {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, vm: &str) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry(vm.to_string()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(spinner_style());
            bar.set_prefix(vm.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        })
    }
}

impl Default for InteractiveObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for InteractiveObserver {
    fn on_transition(&mut self, t: &Transition) {
        let bar = self.bar(&t.vm).clone();
        if !t.to.is_terminal() {
            bar.set_message(t.to.describe());
            return;
        }
        let style = match t.to {
            LifecyclePhase::ReadyTimedOut => degraded_style(),
            LifecyclePhase::Failed => failed_style(),
            _ => done_style(),
        };
        bar.set_style(style);
        bar.finish_with_message(t.to.describe());
    }

    fn finish(&mut self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

// ── Plain ─────────────────────────────────────────────────

pub struct PlainObserver;

impl Observer for PlainObserver {
    fn on_transition(&mut self, t: &Transition) {
        println!("[{}] {}", t.vm, t.to.describe());
    }
}

// ── JSON lines ────────────────────────────────────────────

#[derive(Facet)]
struct TransitionJson {
    vm: String,
    from: String,
    to: String,
}

pub struct JsonObserver;

impl Observer for JsonObserver {
    fn on_transition(&mut self, t: &Transition) {
        let line = TransitionJson {
            vm: t.vm.clone(),
            from: t.from.as_str().to_string(),
            to: t.to.as_str().to_string(),
        };
        match facet_json::to_string(&line) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode transition"),
        }
    }
}
