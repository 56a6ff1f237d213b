mod cli;
mod server;

use cli::{Args, ServiceAction};
use droute::config::load_config;
use droute::log_sink;
use droute::Pipeline;
use log::LevelFilter;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .ok();

    let args = Args::from_args();

    if let Some(action) = args.service {
        if !matches!(action, ServiceAction::Run) {
            println!("--service {action:?} is not supported on this platform; this binary only runs in the foreground.");
            return Ok(());
        }
    }

    let data_dir = args.resolve_data_dir();
    std::fs::create_dir_all(&data_dir).ok();

    let config = load_config(&data_dir)?;
    log::info!(
        "loaded configuration: {} upstream(s), {} default fallback(s)",
        config.upstreams.len(),
        config.default.len()
    );

    let http_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .http1_title_case_headers()
        .timeout(Duration::from_secs(2))
        .build()?;

    let (log_sink, log_writer) = log_sink::spawn(data_dir.clone());

    let pipeline = Arc::new(Pipeline::new(Arc::new(config), log_sink, Arc::new(http_client)));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    server::serve(pipeline, args.port, shutdown).await?;

    log_writer.join().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_data_dir_default_next_to_executable() {
        let args = Args {
            data_dir: None,
            port: 53,
            service: None,
        };
        let resolved = args.resolve_data_dir();
        assert!(resolved.ends_with("data"));
    }

    #[test]
    fn data_dir_override_is_used_verbatim() {
        let args = Args {
            data_dir: Some("/tmp/dcompass-test-data".into()),
            port: 53,
            service: None,
        };
        assert_eq!(args.resolve_data_dir(), std::path::PathBuf::from("/tmp/dcompass-test-data"));
    }
}
