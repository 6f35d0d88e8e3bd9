//! Final capture step: opaque background, then raster encode.

use crate::engine::PageEngine;
use crate::{CaptureConfig, Error, Result};
use log::debug;

/// Give the body an opaque background so the raster has no transparent areas.
/// Author CSS still takes precedence over the `bgcolor` attribute.
pub const NORMALIZE_BACKGROUND: &str = r#"(function() {
    if (document.body) {
        document.body.bgColor = 'white';
    }
    return true;
})()"#;

/// Normalize the background and capture the viewport clip
pub fn produce<E: PageEngine + ?Sized>(engine: &mut E, config: &CaptureConfig) -> Result<Vec<u8>> {
    let normalized = engine
        .evaluate_in_page(NORMALIZE_BACKGROUND)
        .map_err(|e| Error::RenderError(format!("Background normalization failed: {}", e)))?;
    if normalized.is_error {
        return Err(Error::RenderError(format!(
            "Background normalization threw: {}",
            normalized.value
        )));
    }

    let raster = engine.capture_raster(config.format, config.viewport)?;
    if raster.is_empty() {
        return Err(Error::RenderError("Engine returned an empty raster".into()));
    }
    debug!(
        "Captured {}x{} {:?} raster ({} bytes)",
        config.viewport.width,
        config.viewport.height,
        config.format,
        raster.len()
    );
    Ok(raster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedEngine;

    #[test]
    fn normalizes_before_capturing() {
        let mut engine = ScriptedEngine::new("Page", b"raster".to_vec());
        let bytes = produce(&mut engine, &CaptureConfig::default()).unwrap();
        assert_eq!(bytes, b"raster");
        assert_eq!(engine.evaluated, vec![NORMALIZE_BACKGROUND.to_string()]);
        assert_eq!(engine.captures, 1);
    }

    #[test]
    fn capture_failure_is_a_render_error() {
        let mut engine = ScriptedEngine::new("Page", Vec::new()).failing_capture("GPU process crashed");
        let err = produce(&mut engine, &CaptureConfig::default()).unwrap_err();
        assert!(matches!(err, Error::RenderError(_)));
    }

    #[test]
    fn empty_raster_is_a_render_error() {
        let mut engine = ScriptedEngine::new("Page", Vec::new());
        assert!(produce(&mut engine, &CaptureConfig::default()).is_err());
    }

    #[test]
    fn throwing_normalization_aborts_capture() {
        let mut engine = ScriptedEngine::new("Page", b"raster".to_vec()).throwing_scripts();
        assert!(produce(&mut engine, &CaptureConfig::default()).is_err());
        assert_eq!(engine.captures, 0);
    }
}
