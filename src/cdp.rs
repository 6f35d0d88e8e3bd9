//! Chrome DevTools Protocol backend (uses the `headless_chrome` crate)

use crate::engine::{
    ChannelEvents, Dialog, DialogKind, DialogResponse, PageEngine, PageEvent, PageId, PageSettings,
    RasterFormat, ScriptResult, SUCCESS_OUTCOME,
};
use crate::ledger::{HeaderEntry, RequestStart, ResponseProgress, Stage};
use crate::{CaptureConfig, Error, Result, Viewport};
use chrono::{DateTime, TimeZone, Utc};
use headless_chrome::browser::tab::{EventListener, Tab};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure outcome reported when navigation does not complete
const FAIL_OUTCOME: &str = "fail";

/// How often the tab list is checked for pages opened by the page
const PAGE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Expression returning the rendered text of the document body
const PLAIN_TEXT: &str = r#"(function() {
    const body = document.body;
    return body ? body.innerText : '';
})()"#;

/// CDP-based engine: one headless Chrome, one main tab.
///
/// Network and dialog events are forwarded from each tab's event thread into
/// the [`ChannelEvents`] returned by [`CdpEngine::launch`]. Tabs the page
/// opens later (popups) are picked up by a watcher thread and announced as
/// [`PageEvent::PageCreated`].
pub struct CdpEngine {
    browser: Browser,
    tab: Arc<Tab>,
    events: Sender<PageEvent>,
    stop: Arc<AtomicBool>,
}

impl Drop for CdpEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl CdpEngine {
    /// Launch Chrome, open the main tab and wire its events to a channel
    pub fn launch(config: &CaptureConfig) -> Result<(Self, ChannelEvents)> {
        // The run clock starts before Chrome does
        let (tx, source) = ChannelEvents::channel();
        let proxy_server = config.proxy.as_ref().map(|p| p.server());

        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((config.viewport.width, config.viewport.height)))
            .ignore_certificate_errors(config.ignore_certificate_errors)
            .proxy_server(proxy_server.as_deref())
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to create tab: {}", e)))?;

        attach(&tab, tx.clone())?;

        let stop = Arc::new(AtomicBool::new(false));
        watch_new_pages(&browser, tab.get_target_id(), tx.clone(), stop.clone())?;

        Ok((Self { browser, tab, events: tx, stop }, source))
    }

    fn find_tab(&self, page: &PageId) -> Option<Arc<Tab>> {
        if self.tab.get_target_id() == page {
            return Some(self.tab.clone());
        }
        let tabs = self.browser.get_tabs().lock().ok()?;
        let found = tabs.iter().find(|t| t.get_target_id() == page).cloned();
        found
    }

    fn evaluate_value(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .tab
            .evaluate(script, false)
            .map_err(|e| Error::ScriptError(format!("Evaluation failed: {}", e)))?;
        result
            .value
            .ok_or_else(|| Error::ScriptError("No value returned from evaluation".into()))
    }
}

impl PageEngine for CdpEngine {
    fn main_page(&self) -> PageId {
        self.tab.get_target_id().clone()
    }

    fn configure_page(&mut self, page: &PageId, settings: &PageSettings) -> Result<()> {
        let tab = self
            .find_tab(page)
            .ok_or_else(|| Error::Other(format!("Unknown page {}", page)))?;

        tab.set_default_timeout(Duration::from_millis(settings.navigation_timeout_ms));

        if !settings.headers.is_empty() {
            // headless_chrome expects a HashMap<&str, &str>
            let headers: HashMap<&str, &str> = settings
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            tab.set_extra_http_headers(headers)
                .map_err(|e| Error::InitializationError(format!("Failed to set headers: {}", e)))?;
        }

        if let Some(ua) = &settings.user_agent {
            tab.set_user_agent(ua, None, None)
                .map_err(|e| Error::InitializationError(format!("Failed to set user agent: {}", e)))?;
        }
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        let tab = self.tab.clone();
        let events = self.events.clone();
        let url = url.to_string();

        // Navigation blocks until the load event; keep the controller's loop free
        std::thread::Builder::new()
            .name("cdp-navigate".into())
            .spawn(move || {
                let outcome = match tab.navigate_to(&url).and_then(|t| t.wait_until_navigated()) {
                    Ok(_) => SUCCESS_OUTCOME.to_string(),
                    Err(e) => {
                        warn!("Navigation to {} failed: {}", url, e);
                        FAIL_OUTCOME.to_string()
                    }
                };
                let _ = events.send(PageEvent::NavigationComplete { outcome });
            })
            .map_err(|e| Error::LoadError(format!("Failed to spawn navigation thread: {}", e)))?;
        Ok(())
    }

    fn title(&mut self) -> Result<String> {
        self.tab
            .get_title()
            .map_err(|e| Error::RenderError(format!("Failed to get title: {}", e)))
    }

    fn plain_text(&mut self) -> Result<String> {
        let value = self.evaluate_value(PLAIN_TEXT)?;
        Ok(match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        })
    }

    fn evaluate_in_page(&mut self, script: &str) -> Result<ScriptResult> {
        let result = self
            .tab
            .evaluate(script, true)
            .map_err(|e| Error::ScriptError(format!("Direct evaluation failed: {}", e)))?;

        let value = result
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());

        Ok(ScriptResult { value, is_error: false })
    }

    fn capture_raster(&mut self, format: RasterFormat, clip: Viewport) -> Result<Vec<u8>> {
        let (format, quality) = match format {
            RasterFormat::Png => (Page::CaptureScreenshotFormatOption::Png, None),
            RasterFormat::Jpeg => (Page::CaptureScreenshotFormatOption::Jpeg, Some(90)),
        };
        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: clip.width as f64,
            height: clip.height as f64,
            scale: 1.0,
        };
        self.tab
            .capture_screenshot(format, quality, Some(clip), true)
            .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))
    }

    fn answer_dialog(&mut self, dialog: &Dialog, response: DialogResponse) -> Result<()> {
        let tab = self
            .find_tab(&dialog.page)
            .ok_or_else(|| Error::Other(format!("Unknown page {}", dialog.page)))?;
        let (accept, prompt_text) = match response {
            DialogResponse::Accept(text) => (true, text),
            DialogResponse::Dismiss => (false, None),
        };
        tab.call_method(Page::HandleJavaScriptDialog { accept, prompt_text })
            .map_err(|e| Error::CdpError(format!("Failed to answer dialog: {}", e)))?;
        Ok(())
    }
}

/// Enable network events on `tab` and forward its events into `tx`
fn attach(tab: &Arc<Tab>, tx: Sender<PageEvent>) -> Result<()> {
    // Network domain events are only emitted once enabled
    let enable: Network::Enable = serde_json::from_value(serde_json::json!({}))
        .map_err(|e| Error::InitializationError(format!("Failed to build Network.enable: {}", e)))?;
    tab.call_method(enable)
        .map_err(|e| Error::InitializationError(format!("Failed to enable network events: {}", e)))?;

    let listener = forward_events(tab.get_target_id().clone(), tx);
    tab.add_event_listener(listener)
        .map_err(|e| Error::InitializationError(format!("Failed to register event listener: {}", e)))?;
    Ok(())
}

/// Poll the browser's tab list and announce every tab not seen before.
///
/// Tabs present at launch are already attached (or are Chrome's initial
/// blank tab). The watcher exits when the engine is dropped or the event
/// source goes away.
fn watch_new_pages(browser: &Browser, main: &PageId, tx: Sender<PageEvent>, stop: Arc<AtomicBool>) -> Result<()> {
    let tabs = browser.get_tabs().clone();
    let mut seen: HashSet<PageId> = match tabs.lock() {
        Ok(list) => list.iter().map(|t| t.get_target_id().clone()).collect(),
        Err(_) => HashSet::new(),
    };
    seen.insert(main.clone());

    std::thread::Builder::new()
        .name("cdp-pages".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let fresh: Vec<Arc<Tab>> = match tabs.lock() {
                    Ok(list) => {
                        let ids = unseen_pages(&mut seen, list.iter().map(|t| t.get_target_id().clone()));
                        list.iter().filter(|t| ids.contains(t.get_target_id())).cloned().collect()
                    }
                    Err(_) => return,
                };
                for tab in fresh {
                    let page = tab.get_target_id().clone();
                    if let Err(e) = attach(&tab, tx.clone()) {
                        warn!("Could not attach to page {}: {}", page, e);
                    }
                    if tx.send(PageEvent::PageCreated { page }).is_err() {
                        return;
                    }
                }
                std::thread::sleep(PAGE_POLL_INTERVAL);
            }
        })
        .map_err(|e| Error::InitializationError(format!("Failed to spawn page watcher: {}", e)))?;
    Ok(())
}

/// Record `current` in `seen`, returning the ids that were new
fn unseen_pages(seen: &mut HashSet<PageId>, current: impl IntoIterator<Item = PageId>) -> Vec<PageId> {
    current.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Build the tab listener that turns CDP events into [`PageEvent`]s
fn forward_events(page: PageId, tx: Sender<PageEvent>) -> Arc<dyn EventListener<Event> + Send + Sync> {
    let tx = Mutex::new(tx);
    Arc::new(move |event: &Event| {
        let Some(page_event) = translate(&page, event) else {
            return;
        };
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(page_event);
        }
    })
}

fn translate(page: &PageId, event: &Event) -> Option<PageEvent> {
    match event {
        Event::NetworkRequestWillBeSent(ev) => {
            let p = &ev.params;
            let wall = p.wall_time as f64;
            Some(PageEvent::ResourceRequested(RequestStart {
                id: p.request_id.clone(),
                method: p.request.method.clone(),
                url: p.request.url.clone(),
                time: from_epoch_seconds(wall),
                // Chrome reuses the loader id as the request id for navigations
                is_navigation: p.request_id == p.loader_id,
            }))
        }
        Event::NetworkResponseReceived(ev) => {
            let p = &ev.params;
            let headers = serde_json::to_value(&p.response.headers)
                .map(|v| header_entries(&v))
                .unwrap_or_default();
            Some(PageEvent::ResourceReceived(ResponseProgress {
                id: p.request_id.clone(),
                stage: Stage::ResponseIntermediate,
                time: Utc::now(),
                body_size: None,
                content_type: Some(p.response.mime_type.clone()),
                headers: Some(headers),
                status: Some(p.response.status as u16),
            }))
        }
        Event::NetworkLoadingFinished(ev) => {
            let p = &ev.params;
            Some(PageEvent::ResourceReceived(ResponseProgress {
                body_size: Some(p.encoded_data_length as u64),
                ..ResponseProgress::bare(p.request_id.clone(), Stage::ResponseEnd, Utc::now())
            }))
        }
        Event::NetworkLoadingFailed(ev) => Some(PageEvent::ResourceError {
            id: ev.params.request_id.clone(),
            error_code: ev.params.error_text.clone(),
        }),
        Event::PageJavascriptDialogOpening(ev) => {
            let name = format!("{:?}", ev.params.Type);
            let kind = DialogKind::from_name(&name).unwrap_or(DialogKind::Alert);
            Some(PageEvent::Dialog(Dialog {
                page: page.clone(),
                kind,
                message: ev.params.message.clone(),
            }))
        }
        _ => {
            debug!("Unhandled CDP event");
            None
        }
    }
}

fn from_epoch_seconds(seconds: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt((seconds * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Flatten a protocol headers object into ordered name/value pairs
fn header_entries(headers: &serde_json::Value) -> Vec<HeaderEntry> {
    match headers.as_object() {
        Some(map) => map
            .iter()
            .map(|(name, value)| {
                let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                HeaderEntry::new(name.clone(), value)
            })
            .collect(),
        None => Vec::new(),
    }
}
