use clap::Parser;

mod cli;
mod commands;

fn main() -> anyhow::Result<()> {
    let parsed = cli::Cli::parse();
    let verbosity = parsed.verbosity;

    match parsed.command {
        // The server path must fork before any runtime threads exist, so
        // it owns its runtime and logging setup.
        cli::Command::Server(args) => commands::server(args, verbosity),
        command => {
            tracing_subscriber::fmt()
                .with_max_level(verbosity.tracing_level_filter())
                .with_writer(std::io::stderr)
                .init();

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(dispatch(command))
        }
    }
}

async fn dispatch(command: cli::Command) -> anyhow::Result<()> {
    match command {
        cli::Command::Server(_) => unreachable!("handled before the runtime starts"),
        cli::Command::Stop => commands::stop().await,
        cli::Command::Init => commands::init(),
        cli::Command::Sb(args) => commands::submit(args).await,
        cli::Command::Sq { scope, summary } => {
            let all = scope.as_deref() == Some("all");
            commands::queue(all, summary).await
        }
        cli::Command::Del { spec } => commands::delete(&spec).await,
        cli::Command::Info { id } => commands::info(id).await,
        cli::Command::Log { id, tail } => commands::log(id, tail).await,
        cli::Command::Res => commands::resources().await,
    }
}
