//! Initial configuration of a factory-default device
//!
//! Sets the management address, DNS servers and admin password in one
//! candidate configuration and commits it. The commit moves the device to its
//! new address, so the factory session is expected to die during it.

use paprep_core::ValidatedSetup;
use paprep_ssh::{DeviceSession, SessionError, Transport};
use secrecy::ExposeSecret;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Device rejected `{command}`: {output}")]
    Rejected { command: String, output: String },
    #[error("No password hash in the response to `request password-hash`")]
    MissingHash,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Apply the initial configuration and commit it
pub async fn apply_initial_config<T: Transport>(
    session: &mut DeviceSession<T>,
    setup: &ValidatedSetup,
    commit_timeout: Duration,
) -> Result<(), ProvisionError> {
    info!(new_ip = %setup.new_ip, "Applying initial configuration");

    // Hash in operational mode so the clear-text password never enters the
    // candidate configuration
    let hash_command = format!(
        "request password-hash password {}",
        setup.new_password.expose_secret()
    );
    let output = session
        .run_sensitive(&hash_command, "request password-hash password ****")
        .await?;
    let phash = parse_password_hash(&output).ok_or(ProvisionError::MissingHash)?;

    session.run_command("configure").await?;

    let result = configure(session, setup, &phash, commit_timeout).await;
    if matches!(result, Err(ProvisionError::Rejected { .. })) {
        // Leave configure mode so the session stays usable
        if let Err(e) = session.run_command("exit").await {
            debug!(error = %e, "Could not leave configure mode");
        }
    }
    result
}

async fn configure<T: Transport>(
    session: &mut DeviceSession<T>,
    setup: &ValidatedSetup,
    phash: &str,
    commit_timeout: Duration,
) -> Result<(), ProvisionError> {
    let mut commands = vec![
        format!("set deviceconfig system ip-address {}", setup.new_ip),
        format!("set deviceconfig system netmask {}", setup.netmask),
        format!("set deviceconfig system default-gateway {}", setup.gateway),
    ];
    let dns_slots = ["primary", "secondary"];
    for (slot, server) in dns_slots.iter().zip(&setup.dns_servers) {
        commands.push(format!(
            "set deviceconfig system dns-setting servers {} {}",
            slot, server
        ));
    }
    for command in &commands {
        let output = session.run_command(command).await?;
        check_config_output(command, &output)?;
    }

    let command = format!("set mgt-config users admin phash {}", phash);
    let output = session
        .run_sensitive(&command, "set mgt-config users admin phash ****")
        .await?;
    check_config_output("set mgt-config users admin phash", &output)?;
    info!("Candidate configuration staged, committing");

    match session.run_command_with_timeout("commit", commit_timeout).await {
        Ok(output) => {
            check_config_output("commit", &output)?;
            info!("Configuration committed");
            if let Err(e) = session.run_command("exit").await {
                debug!(error = %e, "Session closed after commit");
            }
            Ok(())
        }
        Err(e @ (SessionError::Command { .. } | SessionError::CommandTimeout { .. })) => {
            // The management address changed under the session
            warn!(error = %e, "Factory session lost during commit");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn check_config_output(command: &str, output: &str) -> Result<(), ProvisionError> {
    let lower = output.to_lowercase();
    if lower.contains("invalid syntax")
        || lower.contains("error")
        || lower.contains("unknown command")
        || lower.contains("validation failed")
    {
        return Err(ProvisionError::Rejected {
            command: command.to_string(),
            output: output.trim().to_string(),
        });
    }
    Ok(())
}

/// `request password-hash` prints the hash alone on a line
fn parse_password_hash(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('$') && !line.contains(char::is_whitespace))
        .map(str::to_string)
}
