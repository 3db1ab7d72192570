use anyhow::Result;
use minicni::commands::run_cni;
use minicni::types::ErrorResult;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    // stdout is reserved for the CNI result
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    // Run the CNI plugin
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        // Output error in CNI format
        let payload = ErrorResult::from_error(&err);
        eprintln!("{}", serde_json::to_string(&payload)?);
        std::process::exit(1);
    }

    Ok(())
}
