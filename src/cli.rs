use clap::Parser;
use std::path::PathBuf;

/// doas - execute commands as another user
///
/// Authorization comes from the rule file; see doas.conf(5).
#[derive(Parser, Debug, Clone)]
#[command(name = "doas")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run a command as root
    doas systemctl restart nginx

    # Run a command as another user
    doas -u www ls /var/www

    # Start a shell as root
    doas -s

    # Check what a rule file allows for a command
    doas -C /etc/doas.conf /usr/bin/reboot

    # Forget the remembered authentication of this session
    doas -L
")]
pub struct Args {
    /// Run as this user instead of root
    #[arg(short = 'u', value_name = "USER", default_value = "root")]
    pub user: String,

    /// Non-interactive: fail instead of prompting for a password
    #[arg(short = 'n')]
    pub non_interactive: bool,

    /// Run a shell ($SHELL or the invoker's login shell) as the target
    #[arg(short = 's', conflicts_with_all = ["clear_persist", "check_config"])]
    pub shell: bool,

    /// Clear the persisted authentication of this session and exit
    #[arg(short = 'L', conflicts_with_all = ["shell", "check_config"])]
    pub clear_persist: bool,

    /// Parse the given rule file and report the decision for COMMAND
    #[arg(short = 'C', value_name = "CONFIG")]
    pub check_config: Option<PathBuf>,

    /// Enable verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command to run, followed by its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// What the invocation asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Run a command (program and arguments)
    Run(Vec<String>),
    /// Run a shell ($SHELL or the invoker's login shell) as the target
    Shell,
    /// Remove the persist record
    ClearPersist,
    /// Report the rule file decision without acting on it
    Check {
        config: PathBuf,
        command: Vec<String>,
    },
    /// Nothing to do; print usage
    Usage,
}

impl Args {
    pub fn mode(&self) -> Mode {
        if let Some(config) = &self.check_config {
            return Mode::Check {
                config: config.clone(),
                command: self.command.clone(),
            };
        }
        if self.clear_persist {
            return Mode::ClearPersist;
        }
        if self.shell {
            return Mode::Shell;
        }
        if self.command.is_empty() {
            return Mode::Usage;
        }
        Mode::Run(self.command.clone())
    }
}
