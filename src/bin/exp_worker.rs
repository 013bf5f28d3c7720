use std::io::BufReader;

use exp_master::child::Host;

fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr, which the master forwards.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("EXP_LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    let results_dir = std::env::var("EXP_RESULTS_DIR").unwrap_or_else(|_| "results".to_string());

    let mut host = Host::new(
        BufReader::new(std::io::stdin()),
        std::io::stdout(),
        results_dir,
    );
    host.serve()?;
    Ok(())
}
