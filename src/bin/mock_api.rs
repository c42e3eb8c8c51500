use anyhow::Result;
use parallel_sign::mock_api::{self, MockApiState};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .without_time()
        .init();

    let mut args = std::env::args().skip(1);
    let bind = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:8788".to_string());
    let organizations: Vec<String> = args.collect();

    eprintln!("parallel-sign-mock-api listening on http://{bind}");
    mock_api::run_server(&bind, MockApiState::new(organizations))
}
