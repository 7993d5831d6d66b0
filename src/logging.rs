use std::{ffi::OsStr, path::Path, path::PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, info, metadata::LevelFilter, trace};
use tracing_subscriber::prelude::*;

fn do_init(level: LevelFilter, logfile: Option<PathBuf>) {
    let mut message = String::from("Logging to");

    let (stdout_layer, file_layer) = match logfile {
        None => {
            message += " stdout";

            let layer = tracing_subscriber::fmt::layer().with_filter(level);
            (Some(layer), None)
        }
        Some(path) => {
            message += &format!(" file {path:?}");

            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .unwrap_or_else(|| OsStr::new("device-broker.log"));

            // Appends if the file exists.
            let file_appender = tracing_appender::rolling::never(directory, file_name);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(level);
            (None, Some(layer))
        }
    };

    let result = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(()) => debug!(message),
        Err(e) => eprintln!("Could not set up logging: {e}"),
    }
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(level: LevelFilter, logfile: Option<PathBuf>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(level, logfile);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Called before the process exits.
pub fn shutdown() {
    trace!("Shutting down");
}
