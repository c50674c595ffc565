use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    post_relay_lib::cli::run().await
}
