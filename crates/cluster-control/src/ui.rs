//! Console output helpers for the CLI.

use colored::Colorize;

use crate::report::BatchReport;
use crate::state::ClusterState;

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(60).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(60).bright_black());
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print one line per instance, then a summary.
pub fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        let label = format!("[{}] {} ({})", outcome.index, outcome.name, outcome.instance_id);
        match &outcome.result {
            Ok(()) => println!("  {} {label}", "✓".green()),
            Err(message) => println!("  {} {label}: {}", "✗".red(), message.red()),
        }
    }

    let failed = report.failures().count();
    let total = report.outcomes.len();
    if failed == 0 {
        print_success(&format!("{} succeeded on {total} instance(s)", report.operation));
    } else {
        print_warning(&format!(
            "{} failed on {failed} of {total} instance(s)",
            report.operation
        ));
    }
}

/// Print the recorded resources and per-instance status.
pub fn print_state(state: &ClusterState) {
    let dash = |v: Option<&str>| v.unwrap_or("-").to_string();

    print_section(&format!("Cluster {}", state.name));
    print_kv("Phase", &state.phase.to_string());
    print_kv("Region", &state.region);
    print_kv("Updated", &state.updated_at);
    print_kv("VPC", &dash(state.network.vpc_id.as_deref()));
    print_kv("Subnet", &dash(state.network.subnet_id.as_deref()));
    print_kv(
        "Internet gateway",
        &dash(state.network.internet_gateway_id.as_deref()),
    );
    print_kv("Security group", &dash(state.security_group_id.as_deref()));
    print_kv(
        "Key pair",
        &dash(state.key_pair.as_ref().map(|k| k.name.as_str())),
    );
    if let Some(eip) = &state.elastic_ip {
        print_kv("Elastic IP", &format!("{} ({})", eip.public_ip, eip.allocation_id));
    }
    if let Some(key) = &state.deploy_key {
        print_kv(
            "Deploy key",
            &format!("{} on {}/{}", key.key_id, key.owner, key.repo),
        );
    }

    println!();
    println!(
        "  {:<4} {:<16} {:<20} {:<16} {:<10}",
        "#", "NAME", "INSTANCE", "PUBLIC IP", "SERVICE"
    );
    println!("  {}", "-".repeat(70).bright_black());
    for instance in &state.instances {
        println!(
            "  {:<4} {:<16} {:<20} {:<16} {:<10}",
            instance.index,
            instance.name,
            instance.instance_id,
            instance.public_ip.as_deref().unwrap_or("-"),
            instance.service.to_string()
        );
    }
}
