use peloton_sync::cli::cli_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli_main().await
}
