use grid_engine::runner::SessionRunner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // APP_CREDENTIALS__API_SECRET is usually supplied through .env
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let default_config = "config/signing_proxy.toml".to_string();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => args.get(i + 1).unwrap_or(&default_config),
        None => args.get(1).unwrap_or(&default_config),
    };
    if !std::path::Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let runner = SessionRunner::new(config_path)?;

    if let Err(e) = runner.run_proxy().await {
        eprintln!("Signing proxy error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
