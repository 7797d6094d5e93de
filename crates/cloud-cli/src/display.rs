//! Plain `colored`-highlighted table output. This workspace's CLI
//! stack has no table-layout crate, so columns are hand-aligned rather
//! than rendered through one.

use cloud_core::model::{Instance, Project, SecurityGroup, User, Volume};
use colored::Colorize;

pub fn print_user(user: &User) {
    println!("  {:<12} {}", "id".dimmed(), user.id);
    println!("  {:<12} {}", "access_key".dimmed(), user.access_key);
    println!("  {:<12} {}", "admin".dimmed(), user.admin);
}

pub fn print_project(project: &Project) {
    println!("  {:<12} {}", "id".dimmed(), project.id);
    println!("  {:<12} {}", "name".dimmed(), project.name);
    println!("  {:<12} {}", "manager".dimmed(), project.manager_user_id);
    println!("  {:<12} {}", "members".dimmed(), project.member_user_ids.join(", "));
}

pub fn print_instances(instances: &[Instance]) {
    if instances.is_empty() {
        println!("(no instances)");
        return;
    }
    println!("{:<12} {:<12} {:<10} {:<16} {:<16}", "ID", "TYPE", "STATE", "PRIVATE IP", "PUBLIC IP");
    for instance in instances {
        println!(
            "{:<12} {:<12} {:<10} {:<16} {:<16}",
            instance.ec2_id,
            instance.instance_type_id,
            format!("{:?}", instance.state).to_lowercase(),
            instance.private_ip.as_deref().unwrap_or("-"),
            instance.public_ip.as_deref().unwrap_or("-"),
        );
    }
}

pub fn print_volumes(volumes: &[Volume]) {
    if volumes.is_empty() {
        println!("(no volumes)");
        return;
    }
    println!("{:<12} {:<6} {:<12} {:<10} {:<16}", "ID", "SIZE", "STATUS", "ATTACH", "INSTANCE");
    for volume in volumes {
        println!(
            "{:<12} {:<6} {:<12} {:<10} {:<16}",
            volume.ec2_id,
            volume.size_gb,
            format!("{:?}", volume.status).to_lowercase(),
            format!("{:?}", volume.attach_status).to_lowercase(),
            volume.instance_uuid.as_deref().unwrap_or("-"),
        );
    }
}

pub fn print_security_groups(groups: &[SecurityGroup]) {
    if groups.is_empty() {
        println!("(no security groups)");
        return;
    }
    for group in groups {
        println!("{} {}", group.name.bold(), format!("({})", group.id).dimmed());
        for rule in &group.rules {
            let source = rule
                .cidr
                .as_deref()
                .or(rule.source_group_id.as_deref())
                .unwrap_or("-");
            println!(
                "  {:?} {}-{} from {}",
                rule.protocol, rule.from_port, rule.to_port, source
            );
        }
    }
}
