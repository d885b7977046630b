#[cfg(feature = "bin")]
#[macro_use]
extern crate log;

#[cfg(feature = "bin")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use redirproxy::config::Config;

    let config = Config::from_args().with_context(|| "Failed to read config")?;
    init_logger(&config)?;
    debug!("Parsed arguments: {:?}", config);

    tokio::select! {
        result = redirproxy::start_tunnel(config) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.with_context(|| "Failed to listen for shutdown signal")?;
            info!("Shutting down");
            Ok(())
        }
    }
}

#[cfg(not(feature = "bin"))]
fn main() -> anyhow::Result<()> {
    Err(anyhow::anyhow!("Binary compiled without 'bin' feature"))
}

#[cfg(feature = "bin")]
fn init_logger(config: &redirproxy::config::Config) -> anyhow::Result<()> {
    use anyhow::Context;

    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.parse_filters(&config.log);
    builder
        .try_init()
        .with_context(|| "Failed to initialize logger")
}
