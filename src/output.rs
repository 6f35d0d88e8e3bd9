//! The run's result record and its single emission.

use crate::controller::LoadState;
use crate::ledger::ResourceLedger;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use thiserror::Error as ThisError;

/// Status of a run that reached the capture step
pub const SUCCESS_STATUS: &str = "success";

/// How the result is written to standard output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputMode {
    /// Raw image bytes, nothing else
    Raw,
    /// `LoadOutput` JSON with the base64 image and the resource ledger
    #[default]
    Json,
}

/// Terminal failure classifications. None of them are retried.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The engine reported a non-success navigation outcome
    #[error("navigation failed: {0}")]
    NavigationFailure(String),

    /// The proxy answered instead of the origin
    #[error("proxy error")]
    ProxyError,

    /// Background normalization or raster capture failed
    #[error("render error: {0}")]
    RenderError(String),

    /// The page never finished loading within the abandon deadline
    #[error("abandoned")]
    AbandonedTimeout,

    /// The page loaded but rendered no text at all
    #[error("empty document")]
    EmptyDocument,
}

impl Failure {
    /// Classification string written to `LoadOutput::status`
    pub fn status(&self) -> String {
        match self {
            Failure::NavigationFailure(outcome) => outcome.clone(),
            Failure::ProxyError => "proxy error".to_string(),
            Failure::RenderError(_) => "render error".to_string(),
            Failure::AbandonedTimeout => "abandoned".to_string(),
            Failure::EmptyDocument => "empty document".to_string(),
        }
    }

    /// Controller state the failure terminates in
    pub fn state(&self) -> LoadState {
        match self {
            Failure::NavigationFailure(_) => LoadState::Failed,
            Failure::ProxyError => LoadState::ProxyError,
            Failure::RenderError(_) => LoadState::Done,
            Failure::AbandonedTimeout => LoadState::Abandoned,
            Failure::EmptyDocument => LoadState::EmptyDocument,
        }
    }
}

/// The single result record of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOutput {
    pub success: bool,
    pub status: String,
    #[serde(with = "image_base64")]
    pub image: Option<Vec<u8>>,
    pub resources: ResourceLedger,
}

impl Default for LoadOutput {
    fn default() -> Self {
        Self {
            success: false,
            status: "pending".to_string(),
            image: None,
            resources: ResourceLedger::new(),
        }
    }
}

impl LoadOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal failure; any image is discarded
    pub fn record_failure(&mut self, failure: &Failure) {
        self.success = false;
        self.status = failure.status();
        self.image = None;
    }

    /// 0 for a successful run with an image, 1 for everything else
    pub fn exit_code(&self) -> i32 {
        if self.success && self.image.is_some() {
            0
        } else {
            1
        }
    }
}

/// Writes the result exactly once; `emit` consumes the reporter.
pub struct Reporter<W: Write> {
    mode: OutputMode,
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(mode: OutputMode, out: W) -> Self {
        Self { mode, out }
    }

    pub fn emit(mut self, output: &LoadOutput) -> Result<()> {
        match self.mode {
            OutputMode::Json => {
                serde_json::to_writer(&mut self.out, output)?;
                self.out.write_all(b"\n")?;
            }
            OutputMode::Raw => {
                if let Some(image) = &output.image {
                    self.out.write_all(image)?;
                }
            }
        }
        self.out
            .flush()
            .map_err(|e| Error::OutputError(format!("Failed to flush output: {}", e)))
    }
}

mod image_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(image: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match image {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded.as_bytes()).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_output_is_a_failure() {
        let out = LoadOutput::new();
        assert!(!out.success);
        assert_eq!(out.exit_code(), 1);
        let json = serde_json::to_value(&out).unwrap();
        assert!(json["image"].is_null());
        assert_eq!(json["resources"], serde_json::json!({}));
    }

    #[test]
    fn failure_statuses_are_stable() {
        assert_eq!(Failure::NavigationFailure("fail".into()).status(), "fail");
        assert_eq!(Failure::ProxyError.status(), "proxy error");
        assert_eq!(Failure::RenderError("x".into()).status(), "render error");
        assert_eq!(Failure::AbandonedTimeout.status(), "abandoned");
        assert_eq!(Failure::RenderError("x".into()).state(), LoadState::Done);
    }

    #[test]
    fn record_failure_drops_image() {
        let mut out = LoadOutput { success: true, image: Some(vec![1, 2, 3]), ..LoadOutput::new() };
        assert_eq!(out.exit_code(), 0);
        out.record_failure(&Failure::RenderError("capture".into()));
        assert!(out.image.is_none());
        assert_eq!(out.exit_code(), 1);
    }

    #[test]
    fn json_reporter_writes_base64_image() {
        let out = LoadOutput {
            success: true,
            status: SUCCESS_STATUS.into(),
            image: Some(b"png".to_vec()),
            ..LoadOutput::new()
        };
        let mut buf = Vec::new();
        Reporter::new(OutputMode::Json, &mut buf).emit(&out).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["image"], "cG5n");
        assert_eq!(value["status"], "success");
    }

    #[test]
    fn raw_reporter_writes_only_bytes() {
        let out = LoadOutput { success: true, image: Some(vec![0x89, b'P']), ..LoadOutput::new() };
        let mut buf = Vec::new();
        Reporter::new(OutputMode::Raw, &mut buf).emit(&out).unwrap();
        assert_eq!(buf, vec![0x89, b'P']);

        let mut empty = Vec::new();
        Reporter::new(OutputMode::Raw, &mut empty).emit(&LoadOutput::new()).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let text = r#"{"success":true,"status":"success","image":"!!!","resources":{}}"#;
        assert!(serde_json::from_str::<LoadOutput>(text).is_err());
    }
}
