use std::fmt::Write as _;
use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::repository::{IssuanceMode, Zone};
use crate::service::cert_service::CertificateService;
use crate::types::Result;

/// Administrative commands understood by [`CertificateService::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// List zones with their expiry and last status
    Zones,
    /// Show one zone
    Zone { name: String },
    /// Register a zone
    AddZone {
        name: String,
        mode: IssuanceMode,
        domains: Vec<String>,
        ip_addresses: Vec<IpAddr>,
    },
    /// Remove a zone
    RemoveZone { name: String },
    /// Issue or renew the certificate of a zone
    Renew { name: String },
    /// List self-signers
    Signers,
    /// Create a self-signer, optionally with one intermediate
    CreateSigner { common_name: String, with_inter: bool },
    /// Issue a client certificate; prints the PKCS#12 bundle as base64
    ClientCert {
        signer: String,
        common_name: String,
        password: String,
    },
    /// List ACME accounts
    Accounts,
    /// Register (or load) the ACME account of an email
    CreateAccount { email: String },
    /// Prometheus text exposition
    Metrics,
    /// Command summary
    Help,
}

const HELP: &str = "\
zones                                   list zones
zone <name>                             show a zone
add-zone <name> <mode> [names...]       mode: self-signed:<signer> | acme[:<email>]
remove-zone <name>                      delete a zone
renew <name>                            issue or renew a zone certificate
signers                                 list self-signers
create-signer <cn> [--inter]            create a root, optionally with an intermediate
client-cert <signer> <cn> <password>    issue a PKCS#12 client bundle (base64)
accounts                                list ACME accounts
create-account <email>                  register an ACME account
metrics                                 dump metrics
help                                    this text";

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| Error::InvalidRequest(format!("Missing argument <{}>", name)))
}

fn parse_mode(value: &str) -> Result<IssuanceMode> {
    match value.split_once(':') {
        Some(("self-signed", issuer)) if !issuer.is_empty() => Ok(IssuanceMode::SelfSigned {
            issuer: issuer.to_string(),
        }),
        Some(("acme", email)) if !email.is_empty() => Ok(IssuanceMode::Acme {
            email: Some(email.to_string()),
        }),
        None if value == "acme" => Ok(IssuanceMode::Acme { email: None }),
        _ => Err(Error::InvalidRequest(format!("Invalid issuance mode '{}'", value))),
    }
}

impl AdminCommand {
    /// Parse a command line. Unknown commands are rejected here.
    pub fn parse(command: &str, args: &[String]) -> Result<Self> {
        let cmd = match command {
            "zones" => AdminCommand::Zones,
            "zone" => AdminCommand::Zone {
                name: arg(args, 0, "name")?.to_string(),
            },
            "add-zone" => {
                let name = arg(args, 0, "name")?.to_string();
                let mode = parse_mode(arg(args, 1, "mode")?)?;
                let mut domains = Vec::new();
                let mut ip_addresses = Vec::new();
                for value in args.iter().skip(2) {
                    match value.parse::<IpAddr>() {
                        Ok(ip) => ip_addresses.push(ip),
                        Err(_) => domains.push(value.clone()),
                    }
                }
                AdminCommand::AddZone {
                    name,
                    mode,
                    domains,
                    ip_addresses,
                }
            }
            "remove-zone" => AdminCommand::RemoveZone {
                name: arg(args, 0, "name")?.to_string(),
            },
            "renew" => AdminCommand::Renew {
                name: arg(args, 0, "name")?.to_string(),
            },
            "signers" => AdminCommand::Signers,
            "create-signer" => AdminCommand::CreateSigner {
                common_name: arg(args, 0, "cn")?.to_string(),
                with_inter: args.iter().skip(1).any(|a| a == "--inter"),
            },
            "client-cert" => AdminCommand::ClientCert {
                signer: arg(args, 0, "signer")?.to_string(),
                common_name: arg(args, 1, "cn")?.to_string(),
                password: arg(args, 2, "password")?.to_string(),
            },
            "accounts" => AdminCommand::Accounts,
            "create-account" => AdminCommand::CreateAccount {
                email: arg(args, 0, "email")?.to_string(),
            },
            "metrics" => AdminCommand::Metrics,
            "help" => AdminCommand::Help,
            other => return Err(Error::InvalidRequest(format!("Unknown command '{}'", other))),
        };
        Ok(cmd)
    }
}

fn describe_mode(mode: &IssuanceMode) -> String {
    match mode {
        IssuanceMode::SelfSigned { issuer } => format!("self-signed:{}", issuer),
        IssuanceMode::Acme { email: Some(email) } => format!("acme:{}", email),
        IssuanceMode::Acme { email: None } => "acme".to_string(),
    }
}

fn zone_line(zone: &Zone) -> String {
    let expires = zone
        .expires_at()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".into());
    let status = zone
        .last_status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".into());
    format!("{}\t{}\t{}\t{}", zone.name, describe_mode(&zone.mode), expires, status)
}

impl CertificateService {
    /// Parse and run one administrative command
    pub async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let cmd = AdminCommand::parse(command, args)?;
        self.execute(cmd).await
    }

    /// Run one administrative command and render its result as text
    pub async fn execute(&self, cmd: AdminCommand) -> Result<String> {
        let repository = self.repository();
        match cmd {
            AdminCommand::Zones => {
                let zones = repository.list_zones("").await?;
                Ok(zones.iter().map(zone_line).collect::<Vec<_>>().join("\n"))
            }
            AdminCommand::Zone { name } => {
                let zone = repository.get_zone(&name).await?;
                let mut out = zone_line(&zone);
                if !zone.domains.is_empty() {
                    let _ = write!(out, "\ndomains: {}", zone.domains.join(", "));
                }
                if !zone.ip_addresses.is_empty() {
                    let ips: Vec<String> = zone.ip_addresses.iter().map(|ip| ip.to_string()).collect();
                    let _ = write!(out, "\nip_addresses: {}", ips.join(", "));
                }
                if let Some(error) = &zone.last_error {
                    let _ = write!(out, "\nlast_error: {}", error);
                }
                Ok(out)
            }
            AdminCommand::AddZone {
                name,
                mode,
                domains,
                ip_addresses,
            } => {
                if repository.find_zone(&name).await?.is_some() {
                    return Err(Error::InvalidRequest(format!("Zone '{}' already exists", name)));
                }
                let mut zone = Zone::new(name, mode);
                zone.domains = domains;
                zone.ip_addresses = ip_addresses;
                zone.check_sans()?;
                repository.save_zone(&zone).await?;
                Ok(format!("zone {} added", zone.name))
            }
            AdminCommand::RemoveZone { name } => {
                if repository.delete_zone(&name).await? {
                    Ok(format!("zone {} removed", name))
                } else {
                    Err(Error::NotFound(format!("Zone '{}'", name)))
                }
            }
            AdminCommand::Renew { name } => {
                let zone = self.renew_certificate(&name, &CancellationToken::new()).await?;
                Ok(zone_line(&zone))
            }
            AdminCommand::Signers => {
                let signers = repository.list_self_signers("").await?;
                Ok(signers
                    .iter()
                    .map(|s| format!("{}\tdepth={}\t{}", s.name, s.nodes.len(), s.created_at.to_rfc3339()))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            AdminCommand::CreateSigner {
                common_name,
                with_inter,
            } => {
                let signer = self.create_self_signer(&common_name, with_inter).await?;
                Ok(format!("self-signer {} created (depth {})", signer.name, signer.nodes.len()))
            }
            AdminCommand::ClientCert {
                signer,
                common_name,
                password,
            } => {
                let bundle = self
                    .issue_client_certificate(&signer, &common_name, &password)
                    .await?;
                Ok(STANDARD.encode(bundle))
            }
            AdminCommand::Accounts => {
                let accounts = repository.list_acme_accounts("").await?;
                Ok(accounts
                    .iter()
                    .map(|a| format!("{}\t{}\t{}", a.email, a.registration.body.status, a.registration.uri))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            AdminCommand::CreateAccount { email } => {
                let account = self.create_acme_account(&email).await?;
                Ok(format!("{}\t{}", account.email, account.registration.uri))
            }
            AdminCommand::Metrics => self.metrics().render(),
            AdminCommand::Help => Ok(HELP.to_string()),
        }
    }
}
