use std::io;

use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const MAX_LOG_FILES: usize = 10;
const DEFAULT_DIRECTIVES: &str = "info";

pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

struct LogPathCfg<'a> {
    folder: &'a Utf8Path,
    prefix: &'a str,
}

impl<'a> LogPathCfg<'a> {
    fn from_path(path: &'a Utf8Path) -> anyhow::Result<Self> {
        if path.is_dir() {
            Ok(Self {
                folder: path,
                prefix: "proxy",
            })
        } else {
            Ok(Self {
                folder: path.parent().context("invalid log path (parent)")?,
                prefix: path.file_name().context("invalid log path (file_name)")?,
            })
        }
    }
}

pub fn init(path: &Utf8Path, directives: Option<&str>) -> anyhow::Result<LoggerGuard> {
    let log_cfg = LogPathCfg::from_path(path)?;

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(log_cfg.prefix)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_cfg.folder)
        .context("couldn't create file appender")?;
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter =
        EnvFilter::try_new(directives.unwrap_or(DEFAULT_DIRECTIVES)).context("invalid log filtering directives")?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}
