//! # Qliksense Operator
//!
//! Entry point: initialize the runtime, then run the controller until a shutdown
//! signal arrives.

use anyhow::Result;
use qliksense_operator::runtime::initialization::initialize;
use qliksense_operator::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init_result = initialize().await?;

    run_watch_loop(
        init_result.qliksenses,
        init_result.client,
        init_result.reconciler,
        init_result.server_state,
    )
    .await
}
