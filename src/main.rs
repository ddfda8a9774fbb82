use anyhow::Result;
use clap::Parser;

use fragmark::app::{App, Config};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    let threads = config.threads.max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .build()?;

    runtime.block_on(App::new(config).run())?;

    Ok(())
}
