use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();

    let cli = polyglot_survey_cli::Cli::parse();
    if let Err(err) = polyglot_survey_cli::run_cli(cli) {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
