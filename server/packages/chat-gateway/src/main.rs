fn main() {
    if let Err(err) = chat_gateway::cli::run_chat_gateway() {
        tracing::error!(error = %err, "chat-gateway failed");
        std::process::exit(1);
    }
}
