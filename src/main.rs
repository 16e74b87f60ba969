use anyhow::Context as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg: stager_link::config::Config =
        stager_link::config_io::load_or_create_config("config.toml")
            .await
            .context("unable to read or create config.toml")?;

    stager_link::config::init_tracing(&cfg);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "stager-link booted");

    stager_link::app::run(cfg).await?;
    Ok(())
}
