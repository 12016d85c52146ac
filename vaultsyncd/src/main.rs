use tracing::info;
use tracing_subscriber::EnvFilter;
use vaultsyncd::daemon::{DaemonConfig, DaemonRuntime};
use vaultsyncd::membership::SystemMembership;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vaultsyncd=info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    match parse_cli_mode(std::env::args())? {
        CliMode::Logout => {
            SystemMembership::new().logout()?;
            info!("saved membership removed");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: vaultsyncd [--logout]");
            println!("  --logout   Remove saved membership token and exit");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["vaultsyncd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_logout() {
        let mode =
            parse_cli_mode(vec!["vaultsyncd".to_string(), "--logout".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Logout);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["vaultsyncd".to_string(), "--fast".to_string()]).is_err());
    }
}
