use anyhow::{anyhow, Context};
use clap::Parser;
use settleshot::engine::RasterFormat;
use settleshot::{CaptureConfig, LoadOutput, OutputMode, ProxyConfig, Reporter, RunReport, Viewport};
use std::collections::HashMap;
use std::io::{self, Write};

/// Load a page headlessly, wait for its network to go quiet, and write the
/// screenshot (raw) or the result record (JSON) to stdout.
#[derive(Parser, Debug)]
#[command(name = "settleshot", version, about)]
struct Cli {
    /// Page to capture
    url: String,

    /// HTTP proxy host to route all traffic through
    proxy_host: Option<String>,

    /// HTTP proxy port
    proxy_port: Option<u16>,

    /// Output shape written to stdout
    #[arg(long, value_enum, default_value_t = OutputMode::Json)]
    output: OutputMode,

    /// Raster encoding of the screenshot
    #[arg(long, value_enum, default_value_t = RasterFormat::Png)]
    format: RasterFormat,

    #[arg(long, default_value_t = 1024)]
    width: u32,

    #[arg(long, default_value_t = 1024)]
    height: u32,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 30000)]
    resource_timeout_ms: u64,

    /// Quiet period before the screenshot is taken, in milliseconds
    #[arg(long, default_value_t = 500)]
    quiescence_ms: u64,

    /// Give up if the page has not loaded after this many milliseconds
    #[arg(long, default_value_t = 45000)]
    abandon_ms: u64,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(long = "header", value_name = "NAME: VALUE")]
    headers: Vec<String>,

    /// Do not send `DNT: 1`
    #[arg(long)]
    no_dnt: bool,

    #[arg(long)]
    user_agent: Option<String>,

    /// Refuse pages whose TLS certificate does not validate
    #[arg(long)]
    strict_tls: bool,

    /// Log at debug level (stderr)
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn to_config(&self) -> anyhow::Result<CaptureConfig> {
        let mut headers = HashMap::new();
        if !self.no_dnt {
            headers.insert("DNT".to_string(), "1".to_string());
        }
        for raw in &self.headers {
            let (name, value) = raw
                .split_once(':')
                .ok_or_else(|| anyhow!("header '{}' is not in 'Name: value' form", raw))?;
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }

        let config = CaptureConfig {
            viewport: Viewport { width: self.width, height: self.height },
            format: self.format,
            resource_timeout_ms: self.resource_timeout_ms,
            quiescence_ms: self.quiescence_ms,
            abandon_ms: self.abandon_ms,
            headers,
            user_agent: self.user_agent.clone(),
            output: self.output,
            proxy: self.proxy_host.as_ref().map(|host| ProxyConfig::new(host.clone(), self.proxy_port)),
            ignore_certificate_errors: !self.strict_tls,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "cdp")]
async fn run(url: &str, config: CaptureConfig) -> anyhow::Result<RunReport> {
    settleshot::async_api::capture(url, config, settleshot::new_engine)
        .await
        .context("Capture could not start")
}

#[cfg(not(feature = "cdp"))]
async fn run(_url: &str, _config: CaptureConfig) -> anyhow::Result<RunReport> {
    Err(anyhow!("built without a rendering backend; rebuild with `--features cdp`"))
}

/// Write `output` exactly once. A failed write is logged, never retried,
/// and turns the exit status into 1.
fn emit_once<W: Write>(mode: OutputMode, out: W, output: &LoadOutput, code: i32) -> i32 {
    match Reporter::new(mode, out).emit(output) {
        Ok(()) => code,
        Err(e) => {
            log::error!("Failed to write result: {}", e);
            1
        }
    }
}

/// Emit a well-formed failure record for errors that happen before a load
fn report_setup_failure<W: Write>(mode: OutputMode, out: W, err: &anyhow::Error) -> i32 {
    log::error!("{:#}", err);
    let mut output = LoadOutput::new();
    output.status = "fail".to_string();
    emit_once(mode, out, &output, 1)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    let setup = url::Url::parse(&cli.url)
        .with_context(|| format!("invalid URL '{}'", cli.url))
        .and_then(|_| cli.to_config());
    let config = match setup {
        Ok(config) => config,
        Err(err) => std::process::exit(report_setup_failure(cli.output, io::stdout().lock(), &err)),
    };

    let mode = config.output;
    let code = match run(&cli.url, config).await {
        Ok(report) => emit_once(mode, io::stdout().lock(), &report.output, report.exit_code()),
        Err(err) => report_setup_failure(mode, io::stdout().lock(), &err),
    };
    std::process::exit(code);
}
