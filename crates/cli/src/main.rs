//! The `img` binary: a thin wrapper over the library entrypoint.

use anyhow::Result;

async fn run() -> Result<()> {
    img_utils::initialize_tracing();
    tracing::trace!("starting {}", img_utils::NAME);
    img_lib::cli::run_from_iter(std::env::args_os()).await
}

fn main() {
    img_utils::run_main(|| {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(run())
    })
}
