#![forbid(unsafe_code)]

//! Binary entrypoint that wires the Harbor services together and runs the
//! daemon until a shutdown signal arrives.

use harbor_app::{run_app, AppResult};

#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
