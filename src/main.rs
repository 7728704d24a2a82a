#![deny(clippy::all)]

//! Tail the files matched by a configuration's globs and print every record
//! to `stdout` as one JSON object per line.

mod cli;
mod trace;

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::Parser;
use file_source::{FileConsumerConfig, Record};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{LogFormat, Opts};

#[derive(Debug, Snafu)]
enum LoadError {
    #[snafu(display("Could not read {}: {}", path.display(), source))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display("Could not parse {}: {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn load_config(path: &Path) -> Result<FileConsumerConfig, LoadError> {
    let contents = fs::read_to_string(path).context(ReadSnafu { path })?;
    toml::from_str(&contents).context(ParseSnafu { path })
}

/// Write one record as a JSON line. A failed write (usually a closed pipe)
/// stops the engine.
fn print_record(cancel: &CancellationToken, record: Record) {
    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let written = serde_json::to_writer(&mut stdout, &record)
        .map_err(io::Error::from)
        .and_then(|()| stdout.write_all(b"\n"));
    if let Err(error) = written {
        if !cancel.is_cancelled() {
            error!(message = "Failed writing record to stdout; stopping.", %error);
            cancel.cancel();
        }
    }
}

fn main() {
    let opts = Opts::parse();
    trace::init(
        opts.use_color(),
        opts.log_format == LogFormat::Json,
        opts.log_level(),
    );

    let config = match load_config(&opts.config) {
        Ok(config) => config,
        Err(error) => {
            error!(message = "Configuration error.", %error);
            std::process::exit(exitcode::CONFIG);
        }
    };

    let manager = match config.build(print_record) {
        Ok(manager) => manager,
        Err(build_error) => {
            for error in &build_error.errors {
                error!(message = "Configuration error.", %error);
            }
            std::process::exit(exitcode::CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(message = "Failed to start the runtime.", %error);
            std::process::exit(exitcode::OSERR);
        }
    };

    runtime.block_on(async move {
        let cancel = manager.cancellation_token();
        info!(
            message = "Tailing files.",
            config = %opts.config.display(),
            poll_interval = ?manager.poll_interval(),
            max_concurrent_files = manager.max_concurrent_files(),
        );
        manager
            .run(async move {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(error) = result {
                            error!(message = "Failed to listen for ctrl-c.", %error);
                        } else {
                            info!("Signal received; shutting down.");
                        }
                    }
                    _ = cancel.cancelled() => {}
                }
            })
            .await
    });

    std::process::exit(exitcode::OK);
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_a_toml_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
include = ["/var/log/*.log"]
start_at = "beginning"
poll_interval = "250ms"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.include, vec!["/var/log/*.log".to_owned()]);
        assert_eq!(config.poll_interval, std::time::Duration::from_millis(250));
    }

    #[test]
    fn reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, LoadError::Read { .. }));

        let path = dir.path().join("bad.toml");
        fs::write(&path, "include = [").unwrap();
        let malformed = load_config(&path).unwrap_err();
        assert!(matches!(malformed, LoadError::Parse { .. }));
        assert!(malformed.to_string().starts_with("Could not parse"));
    }
}
