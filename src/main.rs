use owo_colors::OwoColorize;
use silver::cli::{self, Action};
use silver::config::{self, ReplacementVars};
use silver::exec::{ERROR_EXIT_CODE, ExecConfig, Executable};
use silver::panic_guard;
use silver::pathutil::find_last_file;
use silver::proxy;
use silver::supervisor::{self, Supervisor};
use silver::svcmgr::{self, ServiceIdentity};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = cli::parse(&args);

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("ERROR: Unable to determine executable path - {e}");
            return 1;
        }
    };
    let root = exe.parent().unwrap_or(Path::new(".")).to_path_buf();
    let service_name = supervisor::service_name_from_exe(&exe);
    let config_path = config::config_file_path(&exe);
    let vars = ReplacementVars {
        service_name: service_name.clone(),
        service_root: root.to_string_lossy().into_owned(),
    };

    if invocation.action == Action::Help {
        print_usage(&config_path, &vars, &service_name);
        return 1;
    }

    // All relative paths in the config resolve against the service root.
    if let Err(e) = std::env::set_current_dir(&root) {
        eprintln!("ERROR: Unable to set working directory - {e}");
        return 1;
    }

    match invocation.action {
        Action::Validate => match config::load_config(&config_path, &vars) {
            Ok(_) => {
                println!("{}", "Config is valid".green());
                0
            }
            Err(e) => {
                eprintln!("{} Invalid config - {e}", "ERROR:".red().bold());
                1
            }
        },
        Action::Command => run_command(&config_path, &vars, &invocation.args),
        Action::Run => run_supervisor(root, config_path, &vars, &service_name),
        Action::Install | Action::Uninstall | Action::Start | Action::Stop => {
            control_service(&invocation.action, &root, &config_path, &vars, &service_name)
        }
        Action::Help => unreachable!("help is handled above"),
    }
}

fn print_usage(config_path: &Path, vars: &ReplacementVars, service_name: &str) {
    // Best-effort: the usage header is nicer with the configured names, but
    // a broken config must not hide the usage text.
    let conf = config::load_config(config_path, vars).ok();
    let (display_name, description) = conf
        .map(|c| {
            (
                c.service_description.display_name,
                c.service_description.description,
            )
        })
        .unwrap_or_default();
    print!("{}", cli::usage(service_name, &display_name, &description));
}

fn control_service(
    action: &Action,
    root: &Path,
    config_path: &Path,
    vars: &ReplacementVars,
    service_name: &str,
) -> i32 {
    let conf = config::load_config(config_path, vars).ok();
    let identity = match &conf {
        Some(c) => ServiceIdentity {
            name: if c.service_description.name.is_empty() {
                service_name.to_string()
            } else {
                c.service_description.name.clone()
            },
            display_name: if c.service_description.display_name.is_empty() {
                service_name.to_string()
            } else {
                c.service_description.display_name.clone()
            },
            description: c.service_description.description.clone(),
        },
        None => ServiceIdentity {
            name: service_name.to_string(),
            display_name: service_name.to_string(),
            description: String::new(),
        },
    };

    let result = match action {
        Action::Install => svcmgr::install(&identity).map(|()| {
            if let Err(e) = proxy::persist_current_proxy(root) {
                eprintln!("WARNING: could not persist proxy configuration: {e}");
            }
        }),
        Action::Uninstall => svcmgr::uninstall(&identity),
        Action::Start => svcmgr::start(&identity),
        Action::Stop => svcmgr::stop(&identity),
        _ => unreachable!("not a service-control action"),
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {e}", "ERROR:".red().bold());
            1
        }
    }
}

/// `command <name> [extra...]`: look up the configured command, append the
/// extra arguments, run it attached to the console, and exit with the
/// child's code.
fn run_command(config_path: &Path, vars: &ReplacementVars, args: &[String]) -> i32 {
    let conf = match config::load_config(config_path, vars) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} Invalid config - {e}", "ERROR:".red().bold());
            return 1;
        }
    };

    let requested = args.first().map(String::as_str).unwrap_or_default();
    let Some(command) = conf.commands.iter().find(|c| c.name == requested) else {
        eprint!("{} Unknown command '{requested}'. ", "ERROR:".red().bold());
        if conf.commands.is_empty() {
            eprintln!("There are no commands configured!");
        } else {
            eprintln!("Valid commands are:");
            for command in &conf.commands {
                eprintln!("    {}", command.name);
            }
        }
        return 1;
    };

    let mut exec_cfg = ExecConfig::new(find_last_file(&command.path));
    exec_cfg.args = command.args.clone();
    exec_cfg.args.extend(args.iter().skip(1).cloned());
    exec_cfg.exec_timeout = Duration::from_secs(command.timeout_secs);
    // No logger: console mode hands the child our stdio.
    exec_cfg.logger = None;

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} {e}", "ERROR:".red().bold());
            return 1;
        }
    };
    match runtime.block_on(Executable::new(exec_cfg).execute(&CancellationToken::new())) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "ERROR:".red().bold());
            ERROR_EXIT_CODE
        }
    }
}

/// Foreground supervisor run under the panic guard. A config error on this
/// initial start is fatal; reload errors later keep the running generation.
fn run_supervisor(
    root: PathBuf,
    config_path: PathBuf,
    vars: &ReplacementVars,
    service_name: &str,
) -> i32 {
    // Pre-read the bits the panic handler needs; the supervisor re-loads the
    // config itself.
    let (crash_log_file, stop_file) = config::load_config(&config_path, vars)
        .map(|c| {
            (
                c.service_config.crash_log_file,
                Some(c.service_config.stop_file),
            )
        })
        .unwrap_or_default();

    let guard_root = root.clone();
    let name = service_name.to_string();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || -> i32 {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("{} {e}", "ERROR:".red().bold());
                return 1;
            }
        };
        runtime.block_on(async move {
            let mut supervisor = match Supervisor::new(root, config_path, &name) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("{} Invalid service config - '{e}'", "ERROR:".red().bold());
                    return 1;
                }
            };
            supervisor.run().await;
            0
        })
    }));

    match outcome {
        Ok(code) => code,
        Err(payload) => panic_guard::handle_panic(
            &guard_root,
            &crash_log_file,
            stop_file.as_deref(),
            payload,
        ),
    }
}
