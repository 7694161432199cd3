//! CLI output for doas

use crate::rules::{Decision, RuleOptions};
use colored::Colorize;
use std::io::IsTerminal;
use std::path::Path;

/// Word printed by `-C` for a decision
pub fn check_verdict(decision: &Decision<'_>) -> &'static str {
    match decision {
        Decision::Permit(rule) if rule.options.contains(RuleOptions::NOPASS) => "permit nopass",
        Decision::Permit(_) => "permit",
        Decision::Deny | Decision::NotAuthorized => "deny",
    }
}

/// Print the `-C` verdict on stdout
pub fn print_check_result(decision: &Decision<'_>) {
    let verdict = check_verdict(decision);
    if !std::io::stdout().is_terminal() {
        println!("{}", verdict);
        return;
    }
    match decision {
        Decision::Permit(_) => println!("{}", verdict.green()),
        Decision::Deny | Decision::NotAuthorized => println!("{}", verdict.red()),
    }
}

/// Print the `-C` summary when no command was given
pub fn print_config_ok(path: &Path, rules: usize) {
    let line = format!("{}: {} rule(s), no errors", path.display(), rules);
    if std::io::stdout().is_terminal() {
        println!("{}", line.green());
    } else {
        println!("{}", line);
    }
}

/// Print an error line on stderr
pub fn print_error(message: &dyn std::fmt::Display) {
    if std::io::stderr().is_terminal() {
        eprintln!("{} {}", "doas:".red().bold(), message);
    } else {
        eprintln!("doas: {}", message);
    }
}

/// Print usage hint when no command was given
pub fn print_usage() {
    eprintln!("usage: doas [-Lns] [-C config] [-u user] command [args]");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parse_line;

    #[test]
    fn test_check_verdicts() {
        let nopass = parse_line("permit nopass alice", 1).unwrap().unwrap();
        let plain = parse_line("permit persist alice", 1).unwrap().unwrap();

        assert_eq!(check_verdict(&Decision::Permit(&nopass)), "permit nopass");
        assert_eq!(check_verdict(&Decision::Permit(&plain)), "permit");
        assert_eq!(check_verdict(&Decision::Deny), "deny");
        assert_eq!(check_verdict(&Decision::NotAuthorized), "deny");
    }
}
