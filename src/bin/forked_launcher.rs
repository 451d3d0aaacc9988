//! task-node-forked - Forked Task Process Entry Point
//!
//! Started by a task node's supervisor with the launcher properties followed
//! by `<callback address> <registration id>`. Not meant to be run by hand.

use task_node::forked::child;
use task_node::forked::command::ChildArguments;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let arguments = ChildArguments::parse(std::env::args().skip(1))?;

    // Logs go to stderr; the supervisor relays them into the task log.
    let filter = child::log_filter(&arguments).unwrap_or_else(|| "task_node=info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(child::run(arguments))?;
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    std::process::exit(code);
}
