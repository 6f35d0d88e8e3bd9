//! Deterministic in-memory backend.
//!
//! `ScriptedEngine` answers every [`PageEngine`] call from canned values and
//! records what it was asked to do; `ScriptedEvents` replays a timeline of
//! [`PageEvent`]s on a virtual clock, so whole runs (including the 45 s
//! abandon deadline) execute instantly and reproducibly.

use crate::engine::{
    Dialog, DialogKind, DialogResponse, EventSource, PageEngine, PageEvent, PageId, PageSettings, RasterFormat,
    ScriptResult, Wake,
};
use crate::timer::Millis;
use crate::{Error, Result, Viewport};
use std::collections::VecDeque;

/// Page id the scripted engine navigates
pub const MAIN_PAGE: &str = "main";

/// Engine that serves canned responses
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    pub title: String,
    pub plain_text: String,
    pub raster: Vec<u8>,
    capture_error: Option<String>,
    navigate_error: Option<String>,
    throw_scripts: bool,

    // Recorded calls
    pub navigations: Vec<String>,
    pub configured: Vec<PageId>,
    pub evaluated: Vec<String>,
    pub captures: usize,
    pub dialogs: Vec<(DialogKind, DialogResponse)>,
}

impl ScriptedEngine {
    pub fn new(title: impl Into<String>, raster: Vec<u8>) -> Self {
        Self {
            title: title.into(),
            plain_text: "Hello".to_string(),
            raster,
            capture_error: None,
            navigate_error: None,
            throw_scripts: false,
            navigations: Vec::new(),
            configured: Vec::new(),
            evaluated: Vec::new(),
            captures: 0,
            dialogs: Vec::new(),
        }
    }

    pub fn with_plain_text(mut self, text: impl Into<String>) -> Self {
        self.plain_text = text.into();
        self
    }

    /// Make `capture_raster` fail with `message`
    pub fn failing_capture(mut self, message: impl Into<String>) -> Self {
        self.capture_error = Some(message.into());
        self
    }

    /// Make `navigate` fail synchronously with `message`
    pub fn failing_navigation(mut self, message: impl Into<String>) -> Self {
        self.navigate_error = Some(message.into());
        self
    }

    /// Make every evaluated script report a thrown exception
    pub fn throwing_scripts(mut self) -> Self {
        self.throw_scripts = true;
        self
    }
}

impl PageEngine for ScriptedEngine {
    fn main_page(&self) -> PageId {
        MAIN_PAGE.to_string()
    }

    fn configure_page(&mut self, page: &PageId, _settings: &PageSettings) -> Result<()> {
        self.configured.push(page.clone());
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        self.navigations.push(url.to_string());
        match &self.navigate_error {
            Some(message) => Err(Error::LoadError(message.clone())),
            None => Ok(()),
        }
    }

    fn title(&mut self) -> Result<String> {
        Ok(self.title.clone())
    }

    fn plain_text(&mut self) -> Result<String> {
        Ok(self.plain_text.clone())
    }

    fn evaluate_in_page(&mut self, script: &str) -> Result<ScriptResult> {
        self.evaluated.push(script.to_string());
        if self.throw_scripts {
            return Ok(ScriptResult { value: "\"TypeError\"".to_string(), is_error: true });
        }
        Ok(ScriptResult { value: "true".to_string(), is_error: false })
    }

    fn capture_raster(&mut self, _format: RasterFormat, _clip: Viewport) -> Result<Vec<u8>> {
        if let Some(message) = &self.capture_error {
            return Err(Error::RenderError(message.clone()));
        }
        self.captures += 1;
        Ok(self.raster.clone())
    }

    fn answer_dialog(&mut self, dialog: &Dialog, response: DialogResponse) -> Result<()> {
        self.dialogs.push((dialog.kind, response));
        Ok(())
    }
}

/// Timeline of events replayed on a virtual clock
#[derive(Debug, Default)]
pub struct ScriptedEvents {
    queue: VecDeque<(Millis, PageEvent)>,
    now: Millis,
}

impl ScriptedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` at `at`. Events at equal times keep insertion order.
    pub fn push(&mut self, at: Millis, event: PageEvent) -> &mut Self {
        let pos = self.queue.iter().position(|(t, _)| *t > at).unwrap_or(self.queue.len());
        self.queue.insert(pos, (at, event));
        self
    }

    /// Current virtual time
    pub fn now(&self) -> Millis {
        self.now
    }

    /// Events not yet delivered
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl EventSource for ScriptedEvents {
    fn wait(&mut self, deadline: Option<Millis>) -> Wake {
        // An event due exactly at the deadline loses to the timer.
        let next_is_event = match (self.queue.front(), deadline) {
            (Some((at, _)), Some(d)) => *at < d,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if next_is_event {
            if let Some((at, event)) = self.queue.pop_front() {
                self.now = self.now.max(at);
                return Wake::Event { at: self.now, event };
            }
        }
        match deadline {
            Some(d) => {
                self.now = self.now.max(d);
                Wake::Due { at: self.now }
            }
            None => Wake::Closed { at: self.now },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_ordered_by_time_then_insertion() {
        let mut events = ScriptedEvents::new();
        events
            .push(20, PageEvent::PageError("b".into()))
            .push(10, PageEvent::PageError("a".into()))
            .push(20, PageEvent::PageError("c".into()));

        let mut seen = Vec::new();
        while let Wake::Event { event: PageEvent::PageError(text), at } = events.wait(None) {
            seen.push((at, text));
        }
        assert_eq!(seen, vec![(10, "a".into()), (20, "b".into()), (20, "c".into())]);
    }

    #[test]
    fn deadline_wins_ties() {
        let mut events = ScriptedEvents::new();
        events.push(500, PageEvent::PageError("late".into()));
        assert!(matches!(events.wait(Some(500)), Wake::Due { at: 500 }));
        assert_eq!(events.remaining(), 1);
        assert!(matches!(events.wait(Some(501)), Wake::Event { at: 500, .. }));
        assert_eq!(events.now(), 500);
    }

    #[test]
    fn empty_timeline_without_deadline_is_closed() {
        let mut events = ScriptedEvents::new();
        assert!(matches!(events.wait(None), Wake::Closed { at: 0 }));
    }
}
