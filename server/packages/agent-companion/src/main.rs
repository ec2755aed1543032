use agent_companion::cli::run_agent_companion;

fn main() {
    if let Err(err) = run_agent_companion() {
        tracing::error!(error = %err, "agent-companion failed");
        std::process::exit(1);
    }
}
