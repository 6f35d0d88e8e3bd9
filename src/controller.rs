//! Page load controller: navigation, outcome classification and the
//! quiescence state machine.
//!
//! ```text
//! Pending ─► Classifying ─┬─► Failed
//!                         ├─► ProxyError
//!                         ├─► EmptyDocument        (raw output only)
//!                         └─► Loaded ─► AwaitingQuiescence ─► Capturing ─► Done
//! Pending / Classifying ──────► Abandoned           (abandon deadline)
//! ```
//!
//! The controller owns the ledger (inside the [`LoadOutput`]), the timer
//! queue and both timer roles. Events and timer fires are processed one at a
//! time on the calling thread.

use crate::engine::{EventSource, PageEngine, PageEvent, PageSettings, Wake, SUCCESS_OUTCOME};
use crate::ledger::{RequestId, Stage};
use crate::output::{Failure, LoadOutput, OutputMode};
use crate::snapshot;
use crate::timer::{AbandonTimer, Millis, QuiescenceTimer, TimerQueue, TimerRole, TimerToken};
use crate::{CaptureConfig, PROXY_ERROR_TITLE};
use log::{debug, info, warn};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Classifying,
    Failed,
    ProxyError,
    EmptyDocument,
    Loaded,
    AwaitingQuiescence,
    Capturing,
    Done,
    Abandoned,
}

impl LoadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoadState::Failed | LoadState::ProxyError | LoadState::EmptyDocument | LoadState::Done | LoadState::Abandoned
        )
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub output: LoadOutput,
    pub state: LoadState,
    /// Every state entered, with the run time it was entered at
    pub trace: Vec<(Millis, LoadState)>,
    pub finished_at: Millis,
}

impl RunReport {
    /// 0 only when the run reached `Done` with an image
    pub fn exit_code(&self) -> i32 {
        if self.state == LoadState::Done {
            self.output.exit_code()
        } else {
            1
        }
    }

    /// Time a state was first entered
    pub fn entered(&self, state: LoadState) -> Option<Millis> {
        self.trace.iter().find(|(_, s)| *s == state).map(|(at, _)| *at)
    }
}

/// A single page load, from navigation to the final record
pub struct PageLoad<'a> {
    url: String,
    config: &'a CaptureConfig,
    settings: PageSettings,
    state: LoadState,
    now: Millis,
    output: LoadOutput,
    timers: TimerQueue,
    quiescence: QuiescenceTimer,
    abandon: AbandonTimer,
    resource_timers: HashMap<RequestId, TimerToken>,
    trace: Vec<(Millis, LoadState)>,
}

impl<'a> PageLoad<'a> {
    pub fn new(url: &str, config: &'a CaptureConfig) -> Self {
        Self {
            url: url.to_string(),
            config,
            settings: config.page_settings(),
            state: LoadState::Pending,
            now: 0,
            output: LoadOutput::new(),
            timers: TimerQueue::new(),
            quiescence: QuiescenceTimer::new(config.quiescence_ms),
            abandon: AbandonTimer::new(config.abandon_ms),
            resource_timers: HashMap::new(),
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn output(&self) -> &LoadOutput {
        &self.output
    }

    /// Scheduled quiescence fire time, while one is pending
    pub fn quiescence_due(&self) -> Option<Millis> {
        self.quiescence.due(&self.timers)
    }

    /// Drive the load until a terminal state and hand back the result
    pub fn run<E, S>(mut self, engine: &mut E, events: &mut S) -> RunReport
    where
        E: PageEngine + ?Sized,
        S: EventSource + ?Sized,
    {
        self.start(engine);

        while !self.state.is_terminal() {
            match events.wait(self.timers.next_due()) {
                Wake::Event { at, event } => {
                    self.fire_due_timers(engine, at);
                    if !self.state.is_terminal() {
                        self.handle_event(engine, event);
                    }
                }
                Wake::Due { at } => self.fire_due_timers(engine, at),
                Wake::Closed { at } => {
                    self.now = self.now.max(at);
                    warn!("Event source closed with nothing scheduled");
                    self.fail(Failure::NavigationFailure("fail".to_string()));
                }
            }
        }

        info!("Run finished at {}ms: {:?} ({})", self.now, self.state, self.output.status);
        RunReport {
            output: self.output,
            state: self.state,
            trace: self.trace,
            finished_at: self.now,
        }
    }

    /// Arm the abandon deadline, set up the main page and request navigation
    pub fn start<E: PageEngine + ?Sized>(&mut self, engine: &mut E) {
        self.transition(LoadState::Pending);
        self.abandon.arm(&mut self.timers, self.now);

        let page = engine.main_page();
        if let Err(e) = engine.configure_page(&page, &self.settings) {
            warn!("Failed to configure page {}: {}", page, e);
        }

        info!("Loading {}", self.url);
        if let Err(e) = engine.navigate(&self.url) {
            warn!("Navigation could not start: {}", e);
            self.classify(engine, "fail");
        }
    }

    /// Process one event from the engine
    pub fn handle_event<E: PageEngine + ?Sized>(&mut self, engine: &mut E, event: PageEvent) {
        match event {
            PageEvent::NavigationComplete { outcome } => {
                if self.state == LoadState::Pending {
                    self.classify(engine, &outcome);
                } else {
                    debug!("Ignoring navigation completion '{}' in state {:?}", outcome, self.state);
                }
            }
            PageEvent::ResourceRequested(start) => {
                if self.output.resources.on_request_start(&start) {
                    let due = self.now.saturating_add(self.config.resource_timeout_ms);
                    let token = self.timers.schedule(due, TimerRole::ResourceTimeout(start.id.clone()));
                    self.resource_timers.insert(start.id, token);
                    self.quiescence.reset(&mut self.timers, self.now);
                }
            }
            PageEvent::ResourceReceived(progress) => {
                if self.output.resources.on_request_progress(&progress) {
                    if progress.stage == Stage::ResponseEnd {
                        self.settle_resource(&progress.id);
                    }
                    self.quiescence.reset(&mut self.timers, self.now);
                }
            }
            PageEvent::ResourceError { id, error_code } => {
                if self.output.resources.on_request_error(&id, &error_code) {
                    debug!("Request {} failed: {}", id, error_code);
                    self.settle_resource(&id);
                }
            }
            PageEvent::ResourceTimeout { id } => {
                if self.output.resources.on_request_timeout(&id) {
                    warn!("Request {} timed out", id);
                    self.settle_resource(&id);
                }
            }
            PageEvent::Dialog(dialog) => {
                let response = dialog.kind.auto_response();
                debug!("Answering {:?} dialog '{}' with {:?}", dialog.kind, dialog.message, response);
                if let Err(e) = engine.answer_dialog(&dialog, response) {
                    warn!("Failed to answer dialog: {}", e);
                }
            }
            PageEvent::Console(msg) => debug!("console.{}: {}", msg.level, msg.text),
            PageEvent::PageError(text) => debug!("Page error: {}", text),
            PageEvent::PageCreated { page } => {
                debug!("Page {} opened a child page {}", engine.main_page(), page);
                if let Err(e) = engine.configure_page(&page, &self.settings) {
                    warn!("Failed to configure child page {}: {}", page, e);
                }
            }
        }
    }

    /// Fire every timer due at `at`, in due order
    pub fn fire_due_timers<E: PageEngine + ?Sized>(&mut self, engine: &mut E, at: Millis) {
        self.now = self.now.max(at);
        while !self.state.is_terminal() {
            let Some((token, role)) = self.timers.pop_due(self.now) else {
                break;
            };
            match role {
                TimerRole::Abandon => {
                    if self.abandon.fired(token) {
                        warn!("No load outcome after {}ms, abandoning", self.config.abandon_ms);
                        self.fail(Failure::AbandonedTimeout);
                    }
                }
                TimerRole::Quiescence => {
                    if self.quiescence.fired(token) && self.state == LoadState::AwaitingQuiescence {
                        self.capture(engine);
                    }
                }
                TimerRole::ResourceTimeout(id) => {
                    self.resource_timers.remove(&id);
                    if self.output.resources.expire(&id) {
                        warn!("Request {} still pending after {}ms", id, self.config.resource_timeout_ms);
                    }
                }
            }
        }
    }

    fn classify<E: PageEngine + ?Sized>(&mut self, engine: &mut E, outcome: &str) {
        self.transition(LoadState::Classifying);

        if outcome != SUCCESS_OUTCOME {
            self.fail(Failure::NavigationFailure(outcome.to_string()));
            return;
        }

        let title = engine.title().unwrap_or_else(|e| {
            warn!("Failed to read page title: {}", e);
            String::new()
        });
        let main_failed = self.output.resources.main_request().map(|r| r.error).unwrap_or(false);
        if title == PROXY_ERROR_TITLE || main_failed {
            self.fail(Failure::ProxyError);
            return;
        }

        if self.config.output == OutputMode::Raw {
            let text = engine.plain_text().unwrap_or_else(|e| {
                warn!("Failed to read page text: {}", e);
                String::new()
            });
            if text.is_empty() {
                self.fail(Failure::EmptyDocument);
                return;
            }
        }

        self.output.success = true;
        self.output.status = outcome.to_string();
        self.abandon.cancel(&mut self.timers);
        self.transition(LoadState::Loaded);
        self.quiescence.arm(&mut self.timers, self.now);
        self.transition(LoadState::AwaitingQuiescence);
    }

    fn capture<E: PageEngine + ?Sized>(&mut self, engine: &mut E) {
        self.transition(LoadState::Capturing);
        debug!(
            "Capturing with {} of {} requests still in flight",
            self.output.resources.in_flight(),
            self.output.resources.len()
        );
        match snapshot::produce(engine, self.config) {
            Ok(image) => self.output.image = Some(image),
            Err(e) => {
                warn!("Capture failed: {}", e);
                self.output.record_failure(&Failure::RenderError(e.to_string()));
            }
        }
        self.transition(LoadState::Done);
    }

    fn fail(&mut self, failure: Failure) {
        info!("Load failed: {}", failure);
        self.output.record_failure(&failure);
        self.transition(failure.state());
    }

    fn settle_resource(&mut self, id: &str) {
        if let Some(token) = self.resource_timers.remove(id) {
            self.timers.cancel(token);
        }
    }

    fn transition(&mut self, state: LoadState) {
        debug!("{:?} -> {:?} at {}ms", self.state, state, self.now);
        self.state = state;
        self.trace.push((self.now, state));
    }
}
