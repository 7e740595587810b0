use clap::Parser;
use silver::{profile, proxy, update};
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(
    name = "silver-updater",
    about = "Check a signed manifest endpoint and apply updates",
    version,
    after_help = "To generate or modify the installation profile:\n\
                  \x20 profile-set-random-id\n\
                  \x20\tGenerate a unique random id for this installation.\n\
                  \x20 profile-set-id <id-string>\n\
                  \x20\tUse the id-string as the unique identity.\n\
                  \x20 profile-set-channel <channel-string>\n\
                  \x20\tUse the channel-string as the distribution channel."
)]
struct Cli {
    /// Set version file
    #[arg(short = 'f', default_value = update::VERSION_FILE)]
    version_file: String,

    /// Display current installed version and exit
    #[arg(short = 'v')]
    show_version: bool,

    /// Override current installed version
    #[arg(short = 'c')]
    override_version: Option<String>,

    /// Set HTTP proxy in format http://server:port
    #[arg(short = 'p')]
    proxy: Option<String>,

    /// Base64 Ed25519 public key used to verify the update manifest
    #[arg(short = 'k', long = "key")]
    public_key: Option<String>,

    /// Debug only: support non-https update checks for testing
    #[arg(long = "http")]
    allow_http: bool,

    /// Update check URL
    url: Option<String>,
}

fn main() {
    std::process::exit(run());
}

fn updater_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn run() -> i32 {
    let raw: Vec<String> = std::env::args().collect();

    // The profile subcommands sit outside the flag grammar.
    match raw.get(1).map(String::as_str) {
        Some("profile-set-random-id") if raw.len() == 2 => {
            return profile_result(profile::set_random_id(&updater_dir()));
        }
        Some("profile-set-id") if raw.len() == 3 => {
            return profile_result(profile::set_id(&updater_dir(), &raw[2]));
        }
        Some("profile-set-channel") if raw.len() == 3 => {
            return profile_result(profile::set_channel(&updater_dir(), &raw[2]));
        }
        _ => {}
    }

    let cli = Cli::parse();

    let install_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let version_path = install_root.join(&cli.version_file);

    if cli.show_version {
        println!("Current version: {}", update::read_current_version(&version_path));
        return 0;
    }

    let Some(check_url) = cli.url.clone() else {
        eprintln!("ERROR: An update check URL is required. See --help.");
        return 2;
    };

    if !cli.allow_http && !check_url.to_lowercase().starts_with("https") {
        eprintln!("ERROR: The update URL must be HTTPS for security reasons!");
        return 1;
    }

    if let Some(proxy_url) = proxy::discover_proxy(cli.proxy.as_deref(), &install_root) {
        // Exported before the HTTP client exists; reqwest reads it when the
        // first request is built.
        unsafe { std::env::set_var(proxy::HTTP_PROXY_ENV, proxy_url) };
    }

    let mut opts = update::UpdateOptions::new(install_root);
    opts.version_file = cli.version_file.clone();
    opts.override_version = cli.override_version.clone();
    opts.public_key = cli.public_key.clone();
    opts.profile_dir = updater_dir();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };

    match runtime.block_on(update::upgrade_if_required(&check_url, &opts)) {
        Ok(false) => {
            println!("No upgrade required");
            0
        }
        Ok(true) => {
            println!(
                "Upgrade successful at {}.",
                chrono::Local::now().format("%d %b %y %H:%M %Z")
            );
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            1
        }
    }
}

fn profile_result(result: Result<(), profile::ProfileError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("ERROR: {e}");
            1
        }
    }
}
