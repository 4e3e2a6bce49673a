//! Tracing initialization for the CLI.
//!
//! Diagnostics go to stderr so they never interleave with the progress bar
//! drawn on stdout. `RUST_LOG` overrides the level picked from `-v`.
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Maps the number of `-v` flags to a default level.
fn level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn init(verbosity: u8) {
    let level = level(verbosity).as_str().to_lowercase();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("usbflash={level},usbflash_core={level}"))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity > 1)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level(0), Level::WARN);
        assert_eq!(level(1), Level::DEBUG);
        assert_eq!(level(5), Level::TRACE);
    }
}
