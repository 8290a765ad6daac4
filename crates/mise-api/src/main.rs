use mise_core::Config;

// mimalloc keeps fragmentation low under many concurrent segment uploads.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    // Stores, storage, worker pool and routes
    let (state, app) = mise_api::setup::initialize_app(config).await?;

    mise_api::setup::server::start_server(state, app).await?;

    Ok(())
}
