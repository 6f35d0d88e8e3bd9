use crate::controller::{PageLoad, RunReport};
use crate::engine::{EventSource, PageEngine};
use crate::{CaptureConfig, Error, Result};
use std::thread;
use tokio::sync::oneshot;

/// Run a capture on a dedicated worker thread.
///
/// The worker builds the engine with `factory` and drives the whole load on
/// that thread, so the engine and its event source never need to be `Send`.
/// The finished report is handed back over a oneshot channel. An error from
/// `factory` is returned as-is; the load itself always produces a report.
pub async fn capture<E, S, F>(url: &str, config: CaptureConfig, factory: F) -> Result<RunReport>
where
    E: PageEngine + 'static,
    S: EventSource + 'static,
    F: FnOnce(&CaptureConfig) -> Result<(E, S)> + Send + 'static,
{
    config.validate()?;

    let url = url.to_string();
    let (resp_tx, resp_rx): (oneshot::Sender<Result<RunReport>>, oneshot::Receiver<Result<RunReport>>) =
        oneshot::channel();

    thread::spawn(move || {
        // Initialize engine on the worker thread
        let (mut engine, mut events) = match factory(&config) {
            Ok(pair) => pair,
            Err(err) => {
                let _ = resp_tx.send(Err(err));
                return;
            }
        };

        let report = PageLoad::new(&url, &config).run(&mut engine, &mut events);
        let _ = resp_tx.send(Ok(report));
    });

    resp_rx
        .await
        .map_err(|e| Error::Other(format!("Capture worker canceled: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::LoadState;
    use crate::scripted::{ScriptedEngine, ScriptedEvents};
    use crate::PageEvent;

    #[tokio::test]
    async fn capture_runs_on_worker() {
        let report = capture("https://example.com/", CaptureConfig::default(), |_cfg: &CaptureConfig| {
            let mut events = ScriptedEvents::new();
            events.push(5, PageEvent::NavigationComplete { outcome: "success".into() });
            Ok((ScriptedEngine::new("Example", b"png".to_vec()), events))
        })
        .await
        .unwrap();

        assert_eq!(report.state, LoadState::Done);
        assert_eq!(report.output.image.as_deref(), Some(&b"png"[..]));
    }

    #[tokio::test]
    async fn factory_errors_are_returned() {
        let res = capture("https://example.com/", CaptureConfig::default(), |_cfg: &CaptureConfig| {
            Err::<(ScriptedEngine, ScriptedEvents), _>(Error::InitializationError("no chrome".into()))
        })
        .await;
        assert!(matches!(res, Err(Error::InitializationError(_))));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_launch() {
        let config = CaptureConfig { quiescence_ms: 0, ..Default::default() };
        let res = capture("https://example.com/", config, |_cfg: &CaptureConfig| {
            Ok((ScriptedEngine::new("Example", Vec::new()), ScriptedEvents::new()))
        })
        .await;
        assert!(matches!(res, Err(Error::ConfigError(_))));
    }
}
