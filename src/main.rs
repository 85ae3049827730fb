#[macro_use]
extern crate log;

use stream_encoder::config;
use stream_encoder::server::Server;
use stream_encoder::version;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = config::load_config_file();

    let default_level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("{} starting", version::version_string());

    if config.encryption_password.is_empty() {
        error!(
            "missing encryption password, set {}",
            stream_encoder::config::ENV_ENCRYPTION_PASSWORD
        );
        std::process::exit(1);
    }

    if let Err(e) = Server::new(config).run().await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
