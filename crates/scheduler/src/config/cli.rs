use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::serve::ServeArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler extender, admission webhook and inventory API
    Serve(Box<ServeArgs>),
}
