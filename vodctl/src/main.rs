use clap::Parser;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = vodctl::Cli::parse();
    if let Err(err) = vodctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
