use clap::Parser;
use tracing_subscriber::EnvFilter;

use atomic_builder::Error;

mod workflows;

fn main() {
    let cli = workflows::Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .without_time()
        .with_target(false)
        .init();

    if let Err(err) = workflows::run(cli) {
        let typed = err.downcast_ref::<Error>();
        if let Some(Error::Privilege) = typed {
            println!("{}", Error::Privilege);
            std::process::exit(1);
        }
        eprintln!("error: {err:#}");
        std::process::exit(typed.map(Error::exit_code).unwrap_or(1));
    }
}
