//! Log output setup
//!
//! Embedders that install their own subscriber can skip this entirely; all
//! diagnostics go through `tracing`.

use tracing_subscriber::EnvFilter;

/// Install a compact fmt subscriber.
///
/// `RUST_LOG` takes precedence. Otherwise this crate logs at `debug` when
/// `verbose` is set and at `info` when it is not. Calling it again after a
/// subscriber is installed does nothing.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .try_init();
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "torrent2http=debug"
    } else {
        "torrent2http=info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_follows_verbosity() {
        assert_eq!(default_directive(true), "torrent2http=debug");
        assert_eq!(default_directive(false), "torrent2http=info");
    }

    #[test]
    fn test_init_is_idempotent() {
        init(true);
        init(false);
    }
}
