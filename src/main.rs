use clank::config::Config;
use clank::supervisor::Supervisor;
use clank::telemetry;

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = telemetry::init(&config);

    if let Err(e) = Supervisor::new(config).run().await {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}
