#[tokio::main]
async fn main() {
    conductor::init_tracing();

    let mode = match conductor::parse_command() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(conductor::EXIT_CONFIG_ERROR);
        }
    };

    tracing::info!(mode = ?mode, "conductor starting");
    if let Err(err) = conductor::run(mode).await {
        tracing::error!(?err, "conductor exited with error");
        std::process::exit(conductor::exit_code_for(&err));
    }
}
