//! Operator input validation
//!
//! Everything the operator supplies is checked here before any session to the
//! device is opened, so typos surface as validation errors rather than as
//! half-applied configuration.

use secrecy::SecretString;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::version::{Version, VersionError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid {field}: {value:?} is not an IPv4 address")]
    InvalidAddress { field: &'static str, value: String },
    #[error("Invalid subnet mask: {0:?}")]
    InvalidNetmask(String),
    #[error("At least one and at most two DNS servers are required (got {0})")]
    DnsServerCount(usize),
    #[error("Password {0}")]
    WeakPassword(&'static str),
    #[error("Invalid target version: {0}")]
    TargetVersion(#[from] VersionError),
}

/// Raw setup input as collected from the command line or configuration
#[derive(Clone)]
pub struct SetupInput {
    pub new_ip: String,
    pub netmask: String,
    pub gateway: String,
    pub dns_servers: Vec<String>,
    pub new_password: String,
    pub target_version: String,
}

impl fmt::Debug for SetupInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupInput")
            .field("new_ip", &self.new_ip)
            .field("netmask", &self.netmask)
            .field("gateway", &self.gateway)
            .field("dns_servers", &self.dns_servers)
            .field("new_password", &"[REDACTED]")
            .field("target_version", &self.target_version)
            .finish()
    }
}

/// Setup input after validation
#[derive(Debug)]
pub struct ValidatedSetup {
    pub new_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub new_password: SecretString,
    pub target_version: Version,
}

impl SetupInput {
    pub fn validate(&self) -> Result<ValidatedSetup, ValidationError> {
        let new_ip = parse_address("management IP", &self.new_ip)?;

        let netmask = self
            .netmask
            .trim()
            .parse::<Ipv4Addr>()
            .ok()
            .filter(|mask| is_contiguous_mask(*mask))
            .ok_or_else(|| ValidationError::InvalidNetmask(self.netmask.clone()))?;

        let gateway = parse_address("gateway", &self.gateway)?;

        let servers: Vec<&String> = self
            .dns_servers
            .iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if servers.is_empty() || servers.len() > 2 {
            return Err(ValidationError::DnsServerCount(servers.len()));
        }
        let dns_servers = servers
            .into_iter()
            .map(|s| parse_address("DNS server", s))
            .collect::<Result<Vec<_>, _>>()?;

        validate_password(&self.new_password)?;

        let target_version = Version::parse(self.target_version.trim())?;

        Ok(ValidatedSetup {
            new_ip,
            netmask,
            gateway,
            dns_servers,
            new_password: SecretString::from(self.new_password.clone()),
            target_version,
        })
    }
}

fn parse_address(field: &'static str, value: &str) -> Result<Ipv4Addr, ValidationError> {
    value
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        })
}

/// A mask is valid when its set bits are all leading
fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

const CLI_SPECIAL: [char; 7] = ['"', '\'', '`', '\\', ';', '|', '#'];

/// PAN-OS admin password policy
///
/// The password is passed to the device CLI as a single bare token, so
/// whitespace, quotes and other characters the CLI tokenizer treats
/// specially are refused.
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::WeakPassword(
            "must not contain whitespace or control characters",
        ));
    }
    if password.chars().any(|c| CLI_SPECIAL.contains(&c)) {
        return Err(ValidationError::WeakPassword(
            "must not contain quotes, backslashes, `;`, `|` or `#`",
        ));
    }
    let len = password.chars().count();
    if len < 8 {
        return Err(ValidationError::WeakPassword("must be at least 8 characters"));
    }
    if len > 31 {
        return Err(ValidationError::WeakPassword("must be 31 characters or less"));
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return Err(ValidationError::WeakPassword(
            "must contain at least one uppercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err(ValidationError::WeakPassword(
            "must contain at least one lowercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::WeakPassword("must contain at least one number"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn input() -> SetupInput {
        SetupInput {
            new_ip: "10.20.30.40".to_string(),
            netmask: "255.255.255.0".to_string(),
            gateway: "10.20.30.1".to_string(),
            dns_servers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            new_password: "Secr3tPassw0rd".to_string(),
            target_version: "11.1.4-h7".to_string(),
        }
    }

    #[test]
    fn test_valid_input() {
        let setup = input().validate().unwrap();
        assert_eq!(setup.new_ip, Ipv4Addr::new(10, 20, 30, 40));
        assert_eq!(setup.dns_servers.len(), 2);
        assert_eq!(setup.target_version.to_string(), "11.1.4-h7");
    }

    #[test]
    fn test_rejects_bad_address() {
        let mut bad = input();
        bad.new_ip = "10.20.30.400".to_string();
        assert!(matches!(
            bad.validate(),
            Err(ValidationError::InvalidAddress { field: "management IP", .. })
        ));
    }

    #[test]
    fn test_netmask_must_be_contiguous() {
        assert!(is_contiguous_mask(Ipv4Addr::new(255, 255, 255, 0)));
        assert!(is_contiguous_mask(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(is_contiguous_mask(Ipv4Addr::new(0, 0, 0, 0)));
        assert!(!is_contiguous_mask(Ipv4Addr::new(255, 0, 255, 0)));

        let mut bad = input();
        bad.netmask = "255.255.0.255".to_string();
        assert!(matches!(bad.validate(), Err(ValidationError::InvalidNetmask(_))));
    }

    #[test]
    fn test_dns_server_count() {
        let mut none = input();
        none.dns_servers = vec![String::new()];
        assert_eq!(none.validate().unwrap_err(), ValidationError::DnsServerCount(0));

        let mut three = input();
        three.dns_servers.push("9.9.9.9".to_string());
        assert_eq!(three.validate().unwrap_err(), ValidationError::DnsServerCount(3));
    }

    #[test]
    fn test_password_policy() {
        assert!(validate_password("Short1A").is_err());
        assert!(validate_password("alllowercase1").is_err());
        assert!(validate_password("ALLUPPERCASE1").is_err());
        assert!(validate_password("NoDigitsHere").is_err());
        assert!(validate_password("ThisPasswordIsWayTooLongForPanos1").is_err());
        assert!(validate_password("Admin1234").is_ok());
    }

    #[test]
    fn test_password_must_be_one_cli_token() {
        assert!(validate_password("New Pass1").is_err());
        assert!(validate_password("Tab\tPass1").is_err());
        assert!(validate_password("Quote\"Pa1ss").is_err());
        assert!(validate_password("Apos'Pa1ss").is_err());
        assert!(validate_password("Semi;colon1A").is_err());
        assert!(validate_password("Back\\slash1A").is_err());
        assert!(validate_password("Pipe|Pass1").is_err());
        assert!(validate_password("Hash#Pass1").is_err());
        assert!(validate_password("Dash-And_Dot.1").is_ok());

        let mut bad = input();
        bad.new_password = "New Pass1".to_string();
        assert!(matches!(bad.validate(), Err(ValidationError::WeakPassword(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let raw = input();
        assert!(!format!("{:?}", raw).contains("Secr3tPassw0rd"));

        let setup = raw.validate().unwrap();
        assert!(!format!("{:?}", setup).contains("Secr3tPassw0rd"));
        assert_eq!(setup.new_password.expose_secret(), "Secr3tPassw0rd");
    }

    #[test]
    fn test_version_error_surfaces_before_session() {
        let mut bad = input();
        bad.target_version = "11.1".to_string();
        assert!(matches!(bad.validate(), Err(ValidationError::TargetVersion(_))));
    }
}
