//! `cloudctl`'s command tree: `user-create`, `user-list`,
//! `project-create`, `role-add`, `floating-create`, `network-create`,
//! plus read-only `describe-*` commands this repo adds for local
//! operability.
//!
//! Most of these commands are nova-manage-style: they open the same
//! directory/state backends `cloudd` does and mutate them directly,
//! rather than round-tripping through the EC2 HTTP surface.

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cloud_controller::config::{DirectoryDriver, DirectorySection};
use cloud_core::model::{FixedIp, FixedIpState, FloatingIp, Role};
use cloud_directory::fake::FakeDirectory;
use cloud_directory::ldap::LdapDirectory;
use cloud_directory::Directory;
use cloud_state::{SqliteStateStore, StateStore};
use colored::Colorize;
use rand::Rng;

use crate::display;

#[derive(Parser)]
#[command(name = "cloudctl", version, about = "Admin CLI for the cloud control plane")]
pub struct Cli {
    /// Directory backend to provision against.
    #[arg(long, global = true, default_value = "fake")]
    directory: DirectoryArg,

    /// LDAP URL, used only when `--directory ldap`.
    #[arg(long, global = true)]
    ldap_url: Option<String>,

    /// Path to the `cloud-state` SQLite database file.
    #[arg(long, global = true, default_value = "cloud.db")]
    state: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectoryArg {
    Fake,
    Ldap,
}

impl From<DirectoryArg> for DirectoryDriver {
    fn from(value: DirectoryArg) -> Self {
        match value {
            DirectoryArg::Fake => DirectoryDriver::Fake,
            DirectoryArg::Ldap => DirectoryDriver::Ldap,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Cloudadmin,
    Itsec,
    Sysadmin,
    Netadmin,
    Developer,
    Projectmanager,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Cloudadmin => Role::CloudAdmin,
            RoleArg::Itsec => Role::ItSec,
            RoleArg::Sysadmin => Role::SysAdmin,
            RoleArg::Netadmin => Role::NetAdmin,
            RoleArg::Developer => Role::Developer,
            RoleArg::Projectmanager => Role::ProjectManager,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a user in the directory.
    UserCreate {
        id: String,
        #[arg(long)]
        access_key: Option<String>,
        #[arg(long)]
        secret_key: Option<String>,
        #[arg(long)]
        admin: bool,
    },
    /// List every user currently known to the directory.
    ///
    /// The fake backend has no "list all" primitive (it is keyed for
    /// point lookups only, mirroring the real LDAP driver); this
    /// command is only meaningful against a backend that supports
    /// enumeration and currently reports that limitation.
    UserList,
    /// Create a project; the manager becomes its first member.
    ProjectCreate {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        manager: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Grant `user` a role, optionally scoped to `project`.
    RoleAdd {
        user_id: String,
        role: RoleArg,
        #[arg(long)]
        project: Option<String>,
    },
    /// Seed a floating IP into a host's pool.
    FloatingCreate {
        host: String,
        address: String,
    },
    /// Seed a network's fixed-IP pool from a CIDR block.
    NetworkCreate {
        network_id: String,
        /// e.g. 10.0.0.0/29 — reserves `.1` as gateway, frees the rest.
        cidr: String,
    },
    /// List instances in a project.
    DescribeInstances { project_id: String },
    /// List volumes in a project.
    DescribeVolumes { project_id: String },
    /// List security groups in a project.
    DescribeSecurityGroups { project_id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} failed to start async runtime: {e:#}", "error:".red().bold());
            return ExitCode::from(1);
        }
    };

    match rt.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(1)
        }
    }
}

fn random_key(len: usize) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

fn open_directory(cli: &Cli) -> Result<Arc<dyn Directory>> {
    let driver: DirectoryDriver = cli.directory.into();
    match driver {
        DirectoryDriver::Fake => Ok(Arc::new(FakeDirectory::new())),
        DirectoryDriver::Ldap => {
            let mut section = DirectorySection::default();
            if let Some(url) = &cli.ldap_url {
                section.ldap.ldap_url = url.clone();
            }
            Ok(Arc::new(LdapDirectory::new(section.ldap)))
        }
    }
}

async fn open_state(cli: &Cli) -> Result<Arc<dyn StateStore>> {
    let url = format!("sqlite://{}?mode=rwc", cli.state);
    let store = SqliteStateStore::connect(&url)
        .await
        .with_context(|| format!("failed to open state store at {}", cli.state))?;
    Ok(Arc::new(store))
}

async fn dispatch(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::UserCreate { id, access_key, secret_key, admin } => {
            let directory = open_directory(&cli)?;
            let access_key = access_key.clone().unwrap_or_else(|| random_key(20));
            let secret_key = secret_key.clone().unwrap_or_else(|| random_key(40));
            let user = directory.create_user(id, &access_key, &secret_key, *admin).await?;
            println!("{}", "created user".green());
            display::print_user(&user);
            Ok(())
        }
        Command::UserList => {
            bail!("user enumeration is not supported by this directory backend; look up a user with its access key instead");
        }
        Command::ProjectCreate { id, name, manager, description } => {
            let directory = open_directory(&cli)?;
            let name = name.clone().unwrap_or_else(|| id.clone());
            let description = description.clone().unwrap_or_default();
            let project = directory.create_project(id, &name, manager, &description).await?;
            println!("{}", "created project".green());
            display::print_project(&project);
            Ok(())
        }
        Command::RoleAdd { user_id, role, project } => {
            let directory = open_directory(&cli)?;
            let role: Role = (*role).into();
            directory.add_role(user_id, role, project.as_deref()).await?;
            println!(
                "{} granted {:?} to {} {}",
                "ok:".green().bold(),
                role,
                user_id,
                project.as_deref().map(|p| format!("in project {p}")).unwrap_or_else(|| "globally".to_string())
            );
            Ok(())
        }
        Command::FloatingCreate { host, address } => {
            let store = open_state(&cli).await?;
            let existing = store.get_floating_ip(address).await;
            if existing.is_ok() {
                bail!("floating ip {address} already exists in the pool");
            }
            store
                .insert_floating_ip(&FloatingIp {
                    address: address.clone(),
                    host: host.clone(),
                    project_id: None,
                    fixed_ip_id: None,
                    auto_assigned: false,
                })
                .await?;
            println!("{} added {address} to {host}'s floating ip pool", "ok:".green().bold());
            Ok(())
        }
        Command::NetworkCreate { network_id, cidr } => {
            let store = open_state(&cli).await?;
            let addresses = expand_cidr(cidr)?;
            let mut created = 0usize;
            for (i, address) in addresses.iter().enumerate() {
                // .1 is the implicit gateway: reserved, never handed to an instance.
                let reserved = i == 0;
                store
                    .insert_fixed_ip(&FixedIp {
                        address: address.to_string(),
                        network_id: network_id.clone(),
                        instance_id: None,
                        state: FixedIpState::Free,
                        reserved,
                        virtual_interface_id: None,
                    })
                    .await?;
                created += 1;
            }
            println!(
                "{} seeded {created} fixed ips for network {network_id} from {cidr}",
                "ok:".green().bold()
            );
            Ok(())
        }
        Command::DescribeInstances { project_id } => {
            let store = open_state(&cli).await?;
            let instances = store.list_instances_by_project(project_id).await?;
            display::print_instances(&instances);
            Ok(())
        }
        Command::DescribeVolumes { project_id } => {
            let store = open_state(&cli).await?;
            let volumes = store.list_volumes_by_project(project_id).await?;
            display::print_volumes(&volumes);
            Ok(())
        }
        Command::DescribeSecurityGroups { project_id } => {
            let store = open_state(&cli).await?;
            let groups = store.list_security_groups_by_project(project_id).await?;
            display::print_security_groups(&groups);
            Ok(())
        }
    }
}

/// Expands an IPv4 CIDR block into its host addresses, in order
/// (network and broadcast addresses included for `/31` and smaller
/// prefixes aside — this is an address pool seeder, not a router).
fn expand_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    let (base, prefix) = cidr.split_once('/').ok_or_else(|| anyhow::anyhow!("cidr must be in a.b.c.d/n form"))?;
    let base: Ipv4Addr = base.parse().with_context(|| format!("invalid cidr address: {base}"))?;
    let prefix: u32 = prefix.parse().with_context(|| format!("invalid cidr prefix: {prefix}"))?;
    if prefix > 32 {
        bail!("cidr prefix must be <= 32");
    }
    let host_bits = 32 - prefix;
    if host_bits > 16 {
        bail!("refusing to seed more than 65536 addresses from one cidr block");
    }
    let network = u32::from(base) & (!0u32 << host_bits);
    let count = 1u32 << host_bits;
    Ok((0..count).map(|i| Ipv4Addr::from(network + i)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_cidr_slash_29_yields_eight_addresses() {
        let addrs = expand_cidr("10.0.0.0/29").unwrap();
        assert_eq!(addrs.len(), 8);
        assert_eq!(addrs[0].to_string(), "10.0.0.0");
        assert_eq!(addrs[7].to_string(), "10.0.0.7");
    }

    #[test]
    fn expand_cidr_rejects_missing_prefix() {
        assert!(expand_cidr("10.0.0.0").is_err());
    }

    #[test]
    fn expand_cidr_rejects_huge_block() {
        assert!(expand_cidr("10.0.0.0/8").is_err());
    }
}
