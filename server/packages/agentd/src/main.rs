fn main() {
    if let Err(err) = agentd::cli::run() {
        tracing::error!(error = %err, "agentd failed");
        std::process::exit(1);
    }
}
