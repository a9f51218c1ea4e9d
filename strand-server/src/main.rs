use log::info;

use strand_server::AppConfig;

const DEFAULT_CONFIG: &str = "strand.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let path = std::env::args().nth(1);
    let config = match path.as_deref() {
        Some(path) => AppConfig::load(path)?,
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => AppConfig::load(DEFAULT_CONFIG)?,
        None => {
            info!("No configuration file, using defaults");
            AppConfig::default()
        }
    };

    info!("Starting Strand server...");
    let server = config.into_server()?;
    server.run().await?;
    Ok(())
}
