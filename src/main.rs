mod audit;
mod auth;
mod cli;
mod error;
mod exec;
mod groups;
mod output;
mod privilege;
mod procinfo;
mod rules;
mod settings;
mod timestamp;

use clap::Parser;
use cli::{Args, Mode};
use error::{DoasError, Result};
use groups::GroupDatabase;
use nix::unistd::{getgrouplist, getuid, Gid, User};
use privilege::{PathPolicy, TargetIdentity};
use rules::{Decision, Request, Rule, RuleOptions};
use settings::Settings;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use timestamp::{TimestampCache, TimestampState};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            debug!("Exiting on error: {:?}", e);
            output::print_error(&e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Logging goes to stderr. Only root may raise the level: debug output
/// explains rule decisions, which other principals must not learn.
fn init_logging(verbose: u8) {
    let privileged = getuid().is_root();
    let default = match if privileged { verbose } else { 0 } {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = if privileged {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    } else {
        EnvFilter::new(default)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args) -> Result<i32> {
    let settings = settings::load()?;
    let invoker = lookup_uid()?;

    match args.mode() {
        Mode::Usage => {
            output::print_usage();
            Ok(1)
        }
        Mode::ClearPersist => {
            TimestampCache::new(&settings.timestamp_dir, settings.persist_window()).clear()?;
            Ok(0)
        }
        Mode::Check { config, command } => check(
            &settings,
            &invoker,
            &args.user,
            &config,
            &command,
            privilege::revert_to_invoker,
        ),
        Mode::Shell => {
            let program = login_shell(&invoker);
            execute(&settings, args, &invoker, &program, &[])
        }
        Mode::Run(command) => execute(&settings, args, &invoker, &command[0], &command[1..]),
    }
}

fn lookup_uid() -> Result<User> {
    let uid = getuid();
    User::from_uid(uid)?.ok_or_else(|| DoasError::UnknownUser(uid.to_string()))
}

fn lookup_name(name: &str) -> Result<User> {
    User::from_name(name)?.ok_or_else(|| DoasError::UnknownUser(name.to_string()))
}

/// Shell for `-s`: `$SHELL`, then the invoker's passwd entry, then `/bin/sh`.
fn login_shell(invoker: &User) -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ if !invoker.shell.as_os_str().is_empty() => invoker.shell.to_string_lossy().into_owned(),
        _ => "/bin/sh".to_string(),
    }
}

/// All groups of `user`, primary group included.
fn group_ids(user: &User) -> Result<Vec<Gid>> {
    let name = CString::new(user.name.as_bytes())
        .map_err(|_| DoasError::UnknownUser(user.name.clone()))?;
    Ok(getgrouplist(&name, user.gid)?)
}

/// Resolve `program` against the invoker's `PATH`.
fn resolve(program: &str) -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir()?;
    let search_path = std::env::var_os("PATH");
    Ok(exec::resolve_command(program, search_path.as_deref(), &cwd))
}

/// `-C`: report what `config` decides for the invoker, without acting on it.
///
/// `drop_privilege` runs before `config` is opened, so the file is read with
/// the invoker's own rights.
fn check<F>(
    settings: &Settings,
    invoker: &User,
    target: &str,
    config: &Path,
    command: &[String],
    drop_privilege: F,
) -> Result<i32>
where
    F: FnOnce() -> Result<()>,
{
    drop_privilege()?;
    let ruleset = rules::load(config)?;

    let Some((program, cmd_args)) = command.split_first() else {
        output::print_config_ok(config, ruleset.len());
        return Ok(0);
    };

    let gids = group_ids(invoker)?;
    let resolved = resolve(program)?;
    let groups = GroupDatabase::new(&settings.group_path);
    let request = Request {
        user: &invoker.name,
        gids: &gids,
        target,
        command: resolved.as_deref(),
        args: cmd_args,
    };
    let decision = ruleset.resolve(&request, &groups)?;
    output::print_check_result(&decision);

    Ok(match decision {
        Decision::Permit(_) => 0,
        Decision::Deny | Decision::NotAuthorized => 1,
    })
}

/// Authorize, authenticate, then run the command as the target in a child.
fn execute(
    settings: &Settings,
    args: &Args,
    invoker: &User,
    program: &str,
    cmd_args: &[String],
) -> Result<i32> {
    settings::verify_root_owned(&settings.rules_path)?;
    let ruleset = rules::load(&settings.rules_path)?;
    if ruleset.is_empty() {
        warn!("{} contains no rules", settings.rules_path.display());
    }
    let groups = GroupDatabase::new(&settings.group_path);
    let gids = group_ids(invoker)?;

    let resolved = resolve(program)?;
    let request = Request {
        user: &invoker.name,
        gids: &gids,
        target: &args.user,
        command: resolved.as_deref(),
        args: cmd_args,
    };

    let rule = match ruleset.resolve(&request, &groups)? {
        Decision::Permit(rule) => rule,
        Decision::Deny | Decision::NotAuthorized => {
            let line = audit::command_line(Path::new(program), cmd_args);
            audit::command_refused(&invoker.name, &args.user, &line);
            return Err(DoasError::NotAuthorized);
        }
    };
    debug!("Permitted by line {}: {}", rule.line, rule);

    let target = TargetIdentity::from_user(&lookup_name(&args.user)?)?;
    let command_path =
        resolved.ok_or_else(|| DoasError::CommandNotFound(program.to_string()))?;

    if rule.options.contains(RuleOptions::SETENV) {
        debug!("setenv has no effect");
    }

    let cache = TimestampCache::new(&settings.timestamp_dir, settings.persist_window());
    let mut gateway = if authentication_required(rule, || cache.open()) {
        if args.non_interactive {
            return Err(DoasError::AuthenticationRequired);
        }
        let mut gateway = auth::gateway(&settings.pam_service, &invoker.name);
        if let Err(e) = auth::authenticate(gateway.as_mut()) {
            audit::authentication_failed(&invoker.name);
            return Err(e);
        }
        if rule.options.contains(RuleOptions::PERSIST) {
            if let Err(e) = cache.set_after_auth() {
                warn!("Failed to set timestamp: {}", e);
            }
        }
        Some(gateway)
    } else {
        None
    };

    let kept_path = std::env::var("PATH").ok();
    let path = match (&kept_path, rule.options.contains(RuleOptions::KEEPENV)) {
        (Some(kept), true) => PathPolicy::Keep(kept),
        _ => PathPolicy::Safe(&settings.safe_path),
    };

    if !rule.options.contains(RuleOptions::NOLOG) {
        let line = audit::command_line(&command_path, cmd_args);
        audit::command_executed(&invoker.name, &args.user, &line);
    }

    let code = exec::run_as(&command_path, cmd_args, || {
        privilege::transition(&target, path)
    });

    // still privileged: the identity switch happened in the child
    if let Some(gateway) = gateway.as_mut() {
        if !auth::finish(gateway.as_mut()) {
            debug!("Session for {} was not closed cleanly", invoker.name);
        }
    }

    code
}

/// Whether the principal has to authenticate before `rule` applies.
///
/// `timestamp` is only consulted for `persist` rules without `nopass`.
/// Timestamp problems never skip authentication.
fn authentication_required<F>(rule: &Rule, timestamp: F) -> bool
where
    F: FnOnce() -> Result<TimestampState>,
{
    if rule.options.contains(RuleOptions::NOPASS) {
        return false;
    }
    if !rule.options.contains(RuleOptions::PERSIST) {
        return true;
    }
    match timestamp() {
        Ok(TimestampState::Valid) => false,
        Ok(TimestampState::Absent) => true,
        Err(e) => {
            warn!("Ignoring timestamp record: {}", e);
            true
        }
    }
}
