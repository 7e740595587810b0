use clap::{Parser, Subcommand};
use silver::jsonsig;
use std::io::Read;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "silver-sign",
    about = "Generate Ed25519 key pairs and sign or verify JSON documents",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a new key pair
    Generate {
        /// File to save the public key to (default: stdout)
        #[arg(long = "public-key")]
        public_key: Option<PathBuf>,
        /// File to save the private key to (default: stdout)
        #[arg(long = "private-key")]
        private_key: Option<PathBuf>,
    },
    /// Sign a JSON document
    Sign {
        /// File containing the private key
        #[arg(long = "private-key")]
        private_key: PathBuf,
        /// File to read the JSON document from (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,
        /// File to write the signed JSON document to (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Verify a signed JSON document
    Verify {
        /// File containing the public key
        #[arg(long = "public-key")]
        public_key: PathBuf,
        /// File to read the signed JSON document from (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Generate {
            public_key,
            private_key,
        } => generate(public_key, private_key),
        Command::Sign {
            private_key,
            input,
            output,
        } => sign(&private_key, input, output),
        Command::Verify { public_key, input } => verify(&public_key, input),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn read_input(input: Option<PathBuf>) -> color_eyre::Result<Vec<u8>> {
    match input {
        Some(path) => Ok(std::fs::read(path)?),
        None => {
            let mut bytes = Vec::new();
            std::io::stdin().read_to_end(&mut bytes)?;
            Ok(bytes)
        }
    }
}

fn generate(
    public_key_file: Option<PathBuf>,
    private_key_file: Option<PathBuf>,
) -> color_eyre::Result<()> {
    let (public_key, private_key) = jsonsig::generate_keys();

    match public_key_file {
        Some(path) => std::fs::write(path, &public_key)?,
        None => println!("Public Key:\n{public_key}\n"),
    }
    match private_key_file {
        Some(path) => std::fs::write(path, &private_key)?,
        None => println!("Private Key:\n{private_key}"),
    }
    Ok(())
}

fn sign(
    private_key_file: &PathBuf,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
) -> color_eyre::Result<()> {
    let private_key = std::fs::read_to_string(private_key_file)?;
    let payload = read_input(input)?;

    let signed = jsonsig::sign(&payload, private_key.trim())?;

    match output {
        Some(path) => std::fs::write(path, &signed)?,
        None => println!("{}", String::from_utf8_lossy(&signed)),
    }
    Ok(())
}

fn verify(public_key_file: &PathBuf, input: Option<PathBuf>) -> color_eyre::Result<()> {
    let public_key = std::fs::read_to_string(public_key_file)?;
    let payload = read_input(input)?;

    jsonsig::verify(&payload, public_key.trim())?;
    println!("Verification successful!");
    Ok(())
}
