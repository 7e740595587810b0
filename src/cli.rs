//! Action-word command line of the supervisor binary. The first argument is
//! normalized (leading `-`/`/` stripped, aliases folded) before matching, so
//! `silver --run`, `silver /run` and `silver run` are all the same request.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Install,
    Uninstall,
    Start,
    Stop,
    Run,
    Validate,
    Command,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub action: Action,
    /// Arguments after the action word (the command name and its extras for
    /// `command`).
    pub args: Vec<String>,
}

pub fn parse(args: &[String]) -> Invocation {
    let Some(first) = args.first() else {
        return Invocation {
            action: Action::Help,
            args: Vec::new(),
        };
    };

    let word = normalize(first);
    let action = match word.as_str() {
        "install" => Action::Install,
        "uninstall" => Action::Uninstall,
        "start" => Action::Start,
        "stop" => Action::Stop,
        "run" => Action::Run,
        "validate" => Action::Validate,
        "command" => Action::Command,
        _ => Action::Help,
    };

    Invocation {
        action,
        args: args[1..].to_vec(),
    }
}

fn normalize(arg: &str) -> String {
    let stripped = arg.trim_start_matches(['-', '/']);
    match stripped {
        "setup" => "install",
        "remove" | "delete" => "uninstall",
        "check" | "test" => "validate",
        other => other,
    }
    .to_string()
}

pub fn usage(exe_name: &str, display_name: &str, description: &str) -> String {
    let mut out = String::new();
    if !display_name.is_empty() {
        out.push_str(&format!("{display_name}\n"));
    }
    if !description.is_empty() {
        out.push_str(&format!("{description}\n"));
    }
    out.push_str(&format!(
        "\nUsage:\n\
         {exe_name} [install|uninstall|start|stop|command|validate|run|help] [command-name]\n\
         \x20 install   - Install the service.\n\
         \x20 uninstall - Remove/uninstall the service.\n\
         \x20 start     - Start an installed service.\n\
         \x20 stop      - Stop an installed service.\n\
         \x20 validate  - Test the configuration file.\n\
         \x20 run       - Run the service in command-line mode.\n\
         \x20 command   - Run a configured command [command-name].\n\
         \x20 help      - This usage message.\n"
    ));
    out
}
