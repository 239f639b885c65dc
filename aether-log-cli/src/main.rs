use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(about = "The aether-log command line tool.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generates the ECDH key pair.
    GenKeys(GenKeys),
    /// Decodes a block-framed binary log file into a readable text file.
    Decode(Decode),
}

#[derive(Args)]
struct GenKeys;

impl GenKeys {
    fn exec(self) {
        let (secret_key, public_key) = aether_log::gen_key_pair();

        println!("ECDH Keys:");
        println!("-----------");
        println!("Secret Key: {}", hex(&secret_key));
        println!("Public Key: {}", hex(&public_key));
    }
}

#[derive(Args)]
struct Decode {
    /// Path to the log file (`.xlog`) or buffer file (`.mmap3`).
    path: String,
    /// Path to the destination file.
    ///
    /// If it is not specified, a `.log` file is generated next to `path`.
    #[arg(short, long)]
    output: Option<String>,
    /// The hex-encoded secret key, required for encrypted logs.
    #[arg(short, long)]
    secret_key: Option<String>,
}

impl Decode {
    fn exec(self) {
        println!("Decoding ...");
        let output = self.output.unwrap_or_else(|| self.path.clone() + ".log");
        let secret_key = self.secret_key.and_then(|key| parse_secret_key(&key));
        if let Err(err) = aether_log::decode_to_file(&self.path, output, secret_key) {
            println!("Error: {err}");
        }
    }
}

impl Command {
    #[inline]
    fn exec(self) {
        match self {
            Self::GenKeys(gen_keys) => gen_keys.exec(),
            Self::Decode(decode) => decode.exec(),
        }
    }
}

fn parse_secret_key(key: &str) -> Option<aether_log::SecretKey> {
    if key.len() % 2 != 0 {
        return None;
    }
    (0..key.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&key[i..i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .ok()?
        .try_into()
        .ok()
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        _ = write!(out, "{byte:02x}");
        out
    })
}

fn main() {
    Cli::parse().command.exec();
}
