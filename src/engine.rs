//! Capability interface between the capture core and a browser engine.
//!
//! A backend provides two halves: a [`PageEngine`] the controller calls into
//! (navigate, evaluate, capture) and an [`EventSource`] that delivers
//! [`PageEvent`]s back on the controller's thread. Real backends push events
//! from their own threads into a [`ChannelEvents`] queue; tests use
//! [`ScriptedEvents`](crate::scripted::ScriptedEvents) to replay events on a
//! virtual clock.

use crate::ledger::{RequestId, RequestStart, ResponseProgress};
use crate::timer::Millis;
use crate::{Result, Viewport};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Outcome string a backend reports for a successful navigation
pub const SUCCESS_OUTCOME: &str = "success";

/// Identifier of a page (tab) within the engine
pub type PageId = String;

/// Result of JavaScript evaluation
#[derive(Debug, Clone)]
pub struct ScriptResult {
    /// Serialized result value
    pub value: String,
    /// Whether the script threw an error
    pub is_error: bool,
}

/// Console message emitted by the page
#[derive(Debug, Clone)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
}

/// Raster encodings a backend can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RasterFormat {
    #[default]
    Png,
    Jpeg,
}

/// Per-page settings applied to the main page and every page it opens
#[derive(Debug, Clone)]
pub struct PageSettings {
    pub viewport: Viewport,
    /// How long the engine may wait on a navigation before giving up.
    /// Stalled sub-resources are timed out individually by the controller.
    pub navigation_timeout_ms: u64,
    pub headers: HashMap<String, String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    Alert,
    Confirm,
    Prompt,
    BeforeUnload,
}

impl DialogKind {
    /// Parse a protocol dialog type name (`alert`, `confirm`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "alert" => Some(DialogKind::Alert),
            "confirm" => Some(DialogKind::Confirm),
            "prompt" => Some(DialogKind::Prompt),
            "beforeunload" => Some(DialogKind::BeforeUnload),
            _ => None,
        }
    }

    /// Answer that keeps a page from stalling on a modal dialog: accept
    /// confirmations and answer prompts with an empty string.
    pub fn auto_response(self) -> DialogResponse {
        match self {
            DialogKind::Prompt => DialogResponse::Accept(Some(String::new())),
            DialogKind::Alert | DialogKind::Confirm | DialogKind::BeforeUnload => DialogResponse::Accept(None),
        }
    }
}

/// A modal dialog opened by a page
#[derive(Debug, Clone)]
pub struct Dialog {
    pub page: PageId,
    pub kind: DialogKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogResponse {
    Accept(Option<String>),
    Dismiss,
}

/// Everything a backend reports back to the controller
#[derive(Debug, Clone)]
pub enum PageEvent {
    /// Top-level navigation finished; `outcome` is [`SUCCESS_OUTCOME`] or a
    /// backend-specific failure string
    NavigationComplete { outcome: String },
    ResourceRequested(RequestStart),
    ResourceReceived(ResponseProgress),
    ResourceError { id: RequestId, error_code: String },
    ResourceTimeout { id: RequestId },
    Dialog(Dialog),
    Console(ConsoleMessage),
    PageError(String),
    /// The page opened a child page (popup, `window.open`)
    PageCreated { page: PageId },
}

/// Operations the controller needs from a browser engine
pub trait PageEngine {
    /// Id of the page the capture navigates
    fn main_page(&self) -> PageId;

    /// Apply viewport, headers and timeouts to a page
    fn configure_page(&mut self, page: &PageId, settings: &PageSettings) -> Result<()>;

    /// Start navigating the main page. Completion is reported later as
    /// [`PageEvent::NavigationComplete`].
    fn navigate(&mut self, url: &str) -> Result<()>;

    /// Title of the loaded document
    fn title(&mut self) -> Result<String>;

    /// Rendered text content of the document body
    fn plain_text(&mut self) -> Result<String>;

    /// Evaluate JavaScript in the page's global context
    fn evaluate_in_page(&mut self, script: &str) -> Result<ScriptResult>;

    /// Encode the current viewport, clipped to `clip`
    fn capture_raster(&mut self, format: RasterFormat, clip: Viewport) -> Result<Vec<u8>>;

    /// Resolve a modal dialog
    fn answer_dialog(&mut self, dialog: &Dialog, response: DialogResponse) -> Result<()>;
}

/// What woke the controller's loop
#[derive(Debug)]
pub enum Wake {
    /// An event arrived at time `at`
    Event { at: Millis, event: PageEvent },
    /// The requested deadline passed; `at` is never earlier than it
    Due { at: Millis },
    /// No deadline was requested and no more events will ever arrive
    Closed { at: Millis },
}

/// Source of page events on the controller's thread
pub trait EventSource {
    /// Block until the next event or until `deadline` passes
    fn wait(&mut self, deadline: Option<Millis>) -> Wake;
}

/// [`EventSource`] fed by an mpsc channel, timed against the wall clock
pub struct ChannelEvents {
    rx: Receiver<PageEvent>,
    started: Instant,
}

impl ChannelEvents {
    /// Create a connected sender/source pair. The run clock starts now.
    pub fn channel() -> (Sender<PageEvent>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx, started: Instant::now() })
    }

    fn now(&self) -> Millis {
        self.started.elapsed().as_millis() as Millis
    }
}

impl EventSource for ChannelEvents {
    fn wait(&mut self, deadline: Option<Millis>) -> Wake {
        let Some(deadline) = deadline else {
            return match self.rx.recv() {
                Ok(event) => Wake::Event { at: self.now(), event },
                Err(_) => Wake::Closed { at: self.now() },
            };
        };

        let now = self.now();
        if deadline <= now {
            return Wake::Due { at: now };
        }
        match self.rx.recv_timeout(Duration::from_millis(deadline - now)) {
            Ok(event) => Wake::Event { at: self.now(), event },
            Err(RecvTimeoutError::Timeout) => Wake::Due { at: self.now().max(deadline) },
            Err(RecvTimeoutError::Disconnected) => {
                let remaining = deadline.saturating_sub(self.now());
                std::thread::sleep(Duration::from_millis(remaining));
                Wake::Due { at: self.now().max(deadline) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialogs_are_auto_answered() {
        assert_eq!(DialogKind::Confirm.auto_response(), DialogResponse::Accept(None));
        assert_eq!(DialogKind::Prompt.auto_response(), DialogResponse::Accept(Some(String::new())));
        assert_eq!(DialogKind::from_name("BeforeUnload"), Some(DialogKind::BeforeUnload));
        assert_eq!(DialogKind::from_name("toast"), None);
    }

    #[test]
    fn channel_source_delivers_events_before_deadline() {
        let (tx, mut source) = ChannelEvents::channel();
        tx.send(PageEvent::PageError("boom".into())).unwrap();
        match source.wait(Some(5_000)) {
            Wake::Event { event: PageEvent::PageError(text), .. } => assert_eq!(text, "boom"),
            other => panic!("unexpected wake: {:?}", other),
        }
    }

    #[test]
    fn channel_source_reports_deadline() {
        let (_tx, mut source) = ChannelEvents::channel();
        match source.wait(Some(20)) {
            Wake::Due { at } => assert!(at >= 20),
            other => panic!("unexpected wake: {:?}", other),
        }
    }

    #[test]
    fn channel_source_reports_closed_without_deadline() {
        let (tx, mut source) = ChannelEvents::channel();
        drop(tx);
        assert!(matches!(source.wait(None), Wake::Closed { .. }));
    }
}
