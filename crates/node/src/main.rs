//! Enrolment entry point.
//!
//! Runs the registration flow once and exits:
//!
//! ```text
//! zoneport-enrol <config.toml> [key-password]
//! ```
//!
//! The optional second argument sets the private-key password; when
//! absent it defaults to the keystore password.
//!
//! Exit codes: 0 success, 1 configuration invalid, 2 truststore
//! missing/malformed, 3 request rejected by the doorman, 4 returned
//! chain failed validation.

use std::env;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use zoneport_common::NodeConfig;
use zoneport_node::registration::{RegistrationError, RegistrationHandler};

fn usage(prog: &str) -> String {
    format!(
        "Usage:\n\
         \n\
         {} <config.toml> [key-password]\n\
         \n\
         config.toml must provide at least:\n\
         my_legal_name             - the node's X.500 name\n\
         certificates_directory    - where the stores live\n\
         key_store_password        - protects node and SSL keystores\n\
         trust_store_password      - protects the truststore\n\
         doorman_url               - the registration authority",
        prog
    )
}

fn exit_code_for(error: &RegistrationError) -> u8 {
    match error {
        RegistrationError::Config(_) => 1,
        RegistrationError::TrustStore(_) => 2,
        RegistrationError::Rejected(_) => 3,
        RegistrationError::ChainValidation(_) => 4,
        // Timeouts, interrupts, and I/O failures are operational.
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        error!("{}", usage(&args[0]));
        return ExitCode::from(1);
    }

    let config = match NodeConfig::load_from_file(&args[1]) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };
    let key_password = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| config.key_store_password.clone());

    if let Err(e) = std::fs::create_dir_all(&config.certificates_directory) {
        error!(
            "cannot create certificates directory {}: {}",
            config.certificates_directory.display(),
            e
        );
        return ExitCode::from(1);
    }

    info!("zone enrolment starting for {}", config.my_legal_name);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_token.cancel();
        }
    });

    let handler = match RegistrationHandler::new(config, key_password, shutdown) {
        Ok(handler) => handler,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(exit_code_for(&e));
        }
    };

    match handler.build_keystore().await {
        Ok(()) => {
            info!("node credentials are in place");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("enrolment failed: {}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
