//! settleshot
//!
//! Headless page capture for visual regression pipelines. A page is loaded
//! once, the network ledger is recorded, and the screenshot is taken only
//! after resource activity has gone quiet for a debounce interval.
//!
//! # Features
//!
//! - **Quiescence detection**: every resource event pushes the capture back,
//!   while a hard abandon deadline bounds the whole run
//! - **Resource ledger**: per-request lifecycle records in the output
//! - **CDP Backend** (`cdp` feature): headless Chrome via `headless_chrome`
//! - **Scripted Backend**: deterministic engine for tests
//!
//! # Example
//!
//! ```
//! use settleshot::scripted::{ScriptedEngine, ScriptedEvents};
//! use settleshot::{CaptureConfig, PageEvent};
//!
//! let config = CaptureConfig::default();
//! let mut engine = ScriptedEngine::new("Example", b"\x89PNG".to_vec());
//! let mut events = ScriptedEvents::new();
//! events.push(10, PageEvent::NavigationComplete { outcome: "success".into() });
//!
//! let report = settleshot::capture("https://example.com", &config, &mut engine, &mut events);
//! assert_eq!(report.exit_code(), 0);
//! ```

use std::collections::HashMap;

pub mod error;
pub use error::{Error, Result};

pub mod controller;
pub mod engine;
pub mod ledger;
pub mod output;
pub mod scripted;
pub mod snapshot;
pub mod timer;

// Async-friendly facade (capture on a dedicated worker thread)
pub mod async_api;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use controller::{LoadState, PageLoad, RunReport};
pub use engine::{EventSource, PageEngine, PageEvent, PageSettings, RasterFormat};
pub use ledger::{ResourceLedger, ResourceRecord, Stage};
pub use output::{Failure, LoadOutput, OutputMode, Reporter};

/// Title a proxy serves when it cannot reach the origin
pub const PROXY_ERROR_TITLE: &str = "502 Proxy Error";

/// Configuration for a single capture run
///
/// The defaults match what regression pipelines expect from a plain run:
/// - a 1024×1024 viewport that doubles as the capture clip
/// - a 500 ms quiescence debounce and a 45 s abandon deadline
/// - `DNT: 1` sent with every request
///
/// # Examples
///
/// ```
/// let cfg = settleshot::CaptureConfig::default();
/// assert_eq!(cfg.quiescence_ms, 500);
/// assert_eq!(cfg.headers.get("DNT").map(String::as_str), Some("1"));
/// ```
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Viewport and capture clip dimensions
    pub viewport: Viewport,
    /// Raster encoding of the screenshot
    pub format: RasterFormat,
    /// Time after which an unfinished request is flagged as timed out
    pub resource_timeout_ms: u64,
    /// Quiet period required before the screenshot is taken
    pub quiescence_ms: u64,
    /// Hard deadline for the page to finish loading at all
    pub abandon_ms: u64,
    /// Custom HTTP headers sent with every request
    pub headers: HashMap<String, String>,
    /// User agent override (engine default when `None`)
    pub user_agent: Option<String>,
    /// Shape of the emitted result
    pub output: OutputMode,
    /// Route all traffic through an HTTP proxy
    pub proxy: Option<ProxyConfig>,
    /// Load pages even when their TLS certificate does not validate
    pub ignore_certificate_errors: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let mut headers = HashMap::new();
        headers.insert("DNT".to_string(), "1".to_string());
        Self {
            viewport: Viewport::default(),
            format: RasterFormat::Png,
            resource_timeout_ms: 30000,
            quiescence_ms: 500,
            abandon_ms: 45000,
            headers,
            user_agent: None,
            output: OutputMode::Json,
            proxy: None,
            ignore_certificate_errors: true,
        }
    }
}

impl CaptureConfig {
    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(Error::ConfigError(format!(
                "viewport must be non-empty, got {}x{}",
                self.viewport.width, self.viewport.height
            )));
        }
        if self.quiescence_ms == 0 {
            return Err(Error::ConfigError("quiescence interval must be positive".into()));
        }
        if self.abandon_ms <= self.quiescence_ms {
            return Err(Error::ConfigError(format!(
                "abandon deadline ({}ms) must exceed the quiescence interval ({}ms)",
                self.abandon_ms, self.quiescence_ms
            )));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() {
                return Err(Error::ConfigError("proxy host is empty".into()));
            }
        }
        Ok(())
    }

    /// Settings applied to every page of the run
    pub fn page_settings(&self) -> PageSettings {
        PageSettings {
            viewport: self.viewport,
            navigation_timeout_ms: self.abandon_ms,
            headers: self.headers.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
        }
    }
}

/// HTTP proxy every request is routed through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    pub const DEFAULT_PORT: u16 = 80;

    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self { host: host.into(), port: port.unwrap_or(Self::DEFAULT_PORT) }
    }

    /// Proxy server string in the form browsers accept
    pub fn server(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Run one capture to completion on the calling thread
pub fn capture<E, S>(url: &str, config: &CaptureConfig, engine: &mut E, events: &mut S) -> RunReport
where
    E: PageEngine + ?Sized,
    S: EventSource + ?Sized,
{
    PageLoad::new(url, config).run(engine, events)
}

/// Launch the default backend and its event source
#[cfg(feature = "cdp")]
pub fn new_engine(config: &CaptureConfig) -> Result<(cdp::CdpEngine, engine::ChannelEvents)> {
    cdp::CdpEngine::launch(config)
}
