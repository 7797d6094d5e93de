//! Firewall Rule Compiler (C7): compiles pure, testable
//! `FirewallChain`/`FirewallRule` value types first, and only then
//! renders them to `iptables-restore` text and applies the whole delta
//! with a single `restore` invocation, rather than checking and
//! patching individual rules one at a time.

use std::fmt::Write as _;

use cloud_core::error::Result;
use cloud_core::model::{Protocol, ProviderFirewallRule, SecurityGroup};

use crate::shell;

/// IP family a compiled chain set targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// A single ACCEPT/DROP rule within a chain. Deliberately minimal: the
/// compiler only ever emits ACCEPT rules plus one terminal DROP per
/// per-instance chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallRule {
    Jump { target: String },
    AcceptTcpUdp { protocol: Protocol, from_port: i32, to_port: i32, source: String },
    AcceptIcmp { icmp_type: Option<i32>, source: String },
    Drop,
}

/// A named, ordered list of rules — one iptables chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallChain {
    pub name: String,
    pub rules: Vec<FirewallRule>,
}

/// The full compiled output for one instance: one chain set per family,
/// the instance chain plus every chain it jumps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRuleset {
    pub family: Family,
    pub chains: Vec<FirewallChain>,
}

fn provider_chain_name() -> String {
    "provider".to_string()
}

fn sg_chain_name(group_id: &str) -> String {
    format!("sg-{group_id}")
}

fn instance_chain_name(instance_id: &str) -> String {
    format!("inst-{instance_id}")
}

/// Expands a security-group rule's source into concrete CIDRs: a literal
/// CIDR stays as-is; a `source_group_id` expands to one rule per
/// member-IP of that group.
fn expand_sources(cidr: &Option<String>, source_group_id: &Option<String>, member_ips: &dyn Fn(&str) -> Vec<String>) -> Vec<String> {
    if let Some(cidr) = cidr {
        return vec![cidr.clone()];
    }
    if let Some(group_id) = source_group_id {
        return member_ips(group_id);
    }
    Vec::new()
}

/// Compiles the provider chain: one ACCEPT per global rule, evaluated
/// before any security-group chain.
pub fn compile_provider_chain(rules: &[ProviderFirewallRule], family: Family) -> FirewallChain {
    let mut chain_rules = Vec::new();
    for rule in rules {
        if family == Family::V6 && !rule.cidr.contains(':') {
            continue;
        }
        if family == Family::V4 && rule.cidr.contains(':') {
            continue;
        }
        chain_rules.push(match rule.protocol {
            Protocol::Icmp => FirewallRule::AcceptIcmp {
                icmp_type: if rule.from_port == -1 { None } else { Some(rule.from_port) },
                source: rule.cidr.clone(),
            },
            Protocol::Tcp | Protocol::Udp => FirewallRule::AcceptTcpUdp {
                protocol: rule.protocol,
                from_port: rule.from_port,
                to_port: rule.to_port,
                source: rule.cidr.clone(),
            },
        });
    }
    FirewallChain { name: provider_chain_name(), rules: chain_rules }
}

/// Compiles one security group's chain: one ACCEPT per rule, CIDR or
/// security-group sources expanded via `member_ips`.
pub fn compile_security_group_chain(group: &SecurityGroup, family: Family, member_ips: &dyn Fn(&str) -> Vec<String>) -> FirewallChain {
    let mut chain_rules = Vec::new();
    for rule in &group.rules {
        let sources = expand_sources(&rule.cidr, &rule.source_group_id, member_ips);
        for source in sources {
            let is_v6 = source.contains(':');
            if (family == Family::V6) != is_v6 {
                continue;
            }
            chain_rules.push(match rule.protocol {
                Protocol::Icmp => FirewallRule::AcceptIcmp {
                    icmp_type: if rule.from_port == -1 { None } else { Some(rule.from_port) },
                    source,
                },
                Protocol::Tcp | Protocol::Udp => FirewallRule::AcceptTcpUdp {
                    protocol: rule.protocol,
                    from_port: rule.from_port,
                    to_port: rule.to_port,
                    source,
                },
            });
        }
    }
    FirewallChain { name: sg_chain_name(&group.id), rules: chain_rules }
}

/// Compiles the full chain set for one instance: per-instance chain
/// jumping to `provider` then to every bound security-group chain, then
/// a terminal DROP.
pub fn compile_instance_ruleset(
    instance_id: &str,
    groups: &[SecurityGroup],
    provider_rules: &[ProviderFirewallRule],
    family: Family,
    member_ips: &dyn Fn(&str) -> Vec<String>,
) -> CompiledRuleset {
    let mut chains = Vec::new();

    let mut instance_rules = vec![FirewallRule::Jump { target: provider_chain_name() }];
    for group in groups {
        instance_rules.push(FirewallRule::Jump { target: sg_chain_name(&group.id) });
    }
    instance_rules.push(FirewallRule::Drop);
    chains.push(FirewallChain { name: instance_chain_name(instance_id), rules: instance_rules });

    chains.push(compile_provider_chain(provider_rules, family));
    for group in groups {
        chains.push(compile_security_group_chain(group, family, member_ips));
    }

    CompiledRuleset { family, chains }
}

fn rule_to_iptables(chain: &str, rule: &FirewallRule) -> String {
    match rule {
        FirewallRule::Jump { target } => format!("-A {chain} -j {}", sg_or_provider_target(target)),
        FirewallRule::AcceptTcpUdp { protocol, from_port, to_port, source } => {
            let proto = match protocol {
                Protocol::Tcp => "tcp",
                Protocol::Udp => "udp",
                Protocol::Icmp => unreachable!("icmp handled separately"),
            };
            format!("-A {chain} -p {proto} -s {source} --dport {from_port}:{to_port} -j ACCEPT")
        }
        FirewallRule::AcceptIcmp { icmp_type, source } => match icmp_type {
            Some(t) => format!("-A {chain} -p icmp -s {source} --icmp-type {t} -j ACCEPT"),
            None => format!("-A {chain} -p icmp -s {source} -j ACCEPT"),
        },
        FirewallRule::Drop => format!("-A {chain} -j DROP"),
    }
}

fn sg_or_provider_target(target: &str) -> String {
    target.to_string()
}

/// Renders a compiled chain set into `iptables-restore`/`ip6tables-restore`
/// text: a `*filter` table with one `:chain - [0:0]` declaration and the
/// rendered rules for every chain, terminated by `COMMIT`. Deterministic:
/// two compilations of the same input yield byte-identical text.
pub fn render(ruleset: &CompiledRuleset) -> String {
    let mut out = String::new();
    out.push_str("*filter\n");
    for chain in &ruleset.chains {
        writeln!(out, ":{} - [0:0]", chain.name).unwrap();
    }
    for chain in &ruleset.chains {
        for rule in &chain.rules {
            writeln!(out, "{}", rule_to_iptables(&chain.name, rule)).unwrap();
        }
    }
    out.push_str("COMMIT\n");
    out
}

/// Applies a rendered ruleset to the running kernel via a single
/// `iptables-restore`/`ip6tables-restore` invocation — an atomic delta
/// apply, not a per-rule idempotency check.
pub fn apply(ruleset: &CompiledRuleset) -> Result<()> {
    let text = render(ruleset);
    let binary = match ruleset.family {
        Family::V4 => "iptables-restore",
        Family::V6 => "ip6tables-restore",
    };
    shell::run_with_stdin(binary, &["--noflush"], &text)
}
