use anyhow::Result;
use clap::Parser;
use utils::version;
use vgpu_scheduler::app::ApplicationBuilder;
use vgpu_scheduler::config::Cli;
use vgpu_scheduler::config::Commands;
use vgpu_scheduler::config::ServeArgs;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(serve_args) => run_serve(*serve_args).await,
    }
}

async fn run_serve(serve_args: ServeArgs) -> Result<()> {
    let _guard = utils::logging::init(serve_args.log_dir.as_deref());

    tracing::info!("Starting vgpu-scheduler {}", &**version::VERSION);

    let app = ApplicationBuilder::new(serve_args).build().await?;

    app.run().await?;

    Ok(())
}
