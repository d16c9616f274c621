//! # `relay_envelope`: Envelope Key and Payload Tool
//!
//! Operator companion to the relay binaries. It creates AES keys in the
//! base64 form the subscriber expects, and seals or opens envelopes the same
//! way the crawlers and the subscriber do (gzip, then AES-CBC with a random
//! IV, then base64).
//!
//! ## Usage
//!
//! ```bash
//! # New 256-bit key
//! relay_envelope keygen --bits 256
//!
//! # Seal a JSON file, key taken from RELAY_AES_KEY
//! relay_envelope encrypt --input payload.json --output payload.env
//!
//! # Open an envelope read from stdin
//! cat payload.env | relay_envelope decrypt --key "$KEY"
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use relay_common::codec::{EnvelopeCodec, generate_key};

#[derive(Parser, Debug)]
#[command(
    name = "relay_envelope",
    about = "Create relay keys and seal or open telemetry envelopes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a new random AES key, base64 encoded.
    Keygen {
        /// Key size in bits: 128, 192 or 256.
        #[arg(long, default_value_t = 256)]
        bits: usize,
    },
    /// Compress, encrypt and base64 encode a payload.
    Encrypt(CodecArgs),
    /// Reverse `encrypt`.
    Decrypt(CodecArgs),
}

#[derive(Args, Debug)]
struct CodecArgs {
    /// Base64 AES key.
    #[arg(long, env = "RELAY_AES_KEY", hide_env_values = true)]
    key: String,

    /// Input file; stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading {}", path.display())),
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text).context("reading stdin")?;
            Ok(text)
        }
    }
}

fn write_output(path: Option<&Path>, text: &str) -> Result<()> {
    match path {
        Some(path) => fs::write(path, text).with_context(|| format!("writing {}", path.display())),
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", text)?;
            Ok(())
        }
    }
}

fn seal(key: &str, plaintext: &str) -> Result<String> {
    let codec = EnvelopeCodec::from_base64_key(key)?;
    Ok(codec.encrypt(plaintext)?)
}

fn open(key: &str, envelope: &str) -> Result<String> {
    let codec = EnvelopeCodec::from_base64_key(key)?;
    codec
        .decrypt(envelope.trim())
        .map_err(|_| anyhow!("envelope could not be opened with this key"))
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Keygen { bits } => {
            let key = generate_key(bits)?;
            write_output(None, &key)
        }
        Command::Encrypt(args) => {
            let plaintext = read_input(args.input.as_deref())?;
            write_output(args.output.as_deref(), &seal(&args.key, &plaintext)?)
        }
        Command::Decrypt(args) => {
            let envelope = read_input(args.input.as_deref())?;
            write_output(args.output.as_deref(), &open(&args.key, &envelope)?)
        }
    }
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("relay_envelope: {:#}", e);
        std::process::exit(1);
    }
}
