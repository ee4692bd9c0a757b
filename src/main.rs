#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::process::ExitCode;

use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use winrm_bridge::bridge::config::{credential_from_env, schemes_from_env, target_from_env};
use winrm_bridge::bridge::{Bridge, BridgeConfig, CommandRequest, PayloadFormat};

/// Runs when no command is given on the command line
const CONNECTION_TEST: &str = "Write-Output 'Connection successful'; $env:COMPUTERNAME";

/// Build the request from the command line.
///
/// `winrm-bridge` runs the connection test, `winrm-bridge --text <script>`
/// returns raw text, anything else is expected to print JSON.
fn request_from_args(mut args: Vec<String>) -> CommandRequest {
    if args.is_empty() {
        return CommandRequest::new(CONNECTION_TEST).with_format(PayloadFormat::Text);
    }
    let text = args.first().is_some_and(|a| a == "--text");
    if text {
        args.remove(0);
    }
    let request = CommandRequest::new(args.join(" "));
    if text {
        request.with_format(PayloadFormat::Text)
    } else {
        request
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse::<Directive>()?))
        .with_writer(std::io::stderr)
        .init();

    let target = target_from_env()?;
    let credential = credential_from_env()?;
    let schemes = schemes_from_env()?;
    let request = request_from_args(std::env::args().skip(1).collect());

    let bridge = Bridge::http(BridgeConfig::from_env());
    info!(
        host = %target.host(),
        port = target.port(),
        tls = target.uses_tls(),
        principal = %credential.principal(),
        "Executing command"
    );

    let outcome = bridge
        .execute(&target, &credential, &schemes, request, &bridge.default_policy())
        .await;
    bridge.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
