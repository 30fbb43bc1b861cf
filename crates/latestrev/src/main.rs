//! LatestRev.
//!
//! Serves the content of a LatestRev project over HTTP. Releases and items are resolved from the
//! content API and cached in memory and, optionally, on disk. The published release is refreshed
//! in the background, drafts can be previewed by selecting them per request.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod prefetch;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
