use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use p25kfd_lib::crc::crc16;
use p25kfd_lib::link::{build_kmm_frame, ResponseKind};
use p25kfd_lib::messages::modify_key_command;
use p25kfd_lib::sim::{SimPlatform, SimRadio};
use p25kfd_lib::{AlgorithmId, KeyItem, KfdProtocol, MessageId, TwiConfig};

#[derive(Parser)]
#[command(name = "p25kfd", about = "Diagnostics for the P25 manual rekeying core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify the KMM CRC against the published check vector.
    CrcCheck,
    /// Build a ModifyKeyCommand envelope and hex-dump it.
    Frame {
        #[arg(long, default_value_t = 1)]
        keyset: u8,
        #[arg(long, value_parser = parse_hex_u16)]
        sln: u16,
        #[arg(long, value_parser = parse_hex_u16)]
        key_id: u16,
        /// Algorithm id, hex (84 = AES-256).
        #[arg(long, default_value = "84", value_parser = parse_hex_u8)]
        algorithm: u8,
        /// Key material as hex.
        #[arg(long)]
        key_hex: String,
    },
    /// Run a keyload against the simulated radio and print progress.
    Demo {
        #[arg(long, default_value_t = 3)]
        keys: usize,
    },
}

fn parse_hex_u8(value: &str) -> Result<u8, String> {
    u8::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|err| err.to_string())
}

fn parse_hex_u16(value: &str) -> Result<u16, String> {
    u16::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|err| err.to_string())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    match Cli::parse().command {
        Command::CrcCheck => crc_check(),
        Command::Frame { keyset, sln, key_id, algorithm, key_hex } => {
            frame(keyset, sln, key_id, algorithm, &key_hex)
        }
        Command::Demo { keys } => demo(keys),
    }
}

fn crc_check() -> anyhow::Result<()> {
    let crc = crc16(b"123456789");
    println!("crc16(\"123456789\") = 0x{crc:04X} (expected 0x6F91)");
    if crc != 0x6F91 {
        bail!("CRC table does not match the KFDtool-compatible variant");
    }
    Ok(())
}

fn frame(keyset: u8, sln: u16, key_id: u16, algorithm: u8, key_hex: &str) -> anyhow::Result<()> {
    let material = hex::decode(key_hex).context("key material is not valid hex")?;
    let key = KeyItem::new(keyset, sln, key_id, AlgorithmId::from(algorithm), material)?;
    let body = modify_key_command(std::slice::from_ref(&key))?;
    let envelope = build_kmm_frame(MessageId::ModifyKeyCommand, ResponseKind::Immediate, &body);

    println!("{} key, sln 0x{:04X}, key id 0x{:04X}", key.algorithm_id, key.sln, key.key_id);
    println!("kmm body   ({:3} bytes): {}", body.len(), hex::encode_upper(&body));
    println!("twi frame  ({:3} bytes): {}", envelope.len(), hex::encode_upper(&envelope));
    Ok(())
}

fn demo(count: usize) -> anyhow::Result<()> {
    let config = TwiConfig::default();
    let mut kfd = KfdProtocol::new(SimPlatform::new(SimRadio::default()), config)?;

    let keys: Vec<KeyItem> = (1..=count as u16)
        .map(|n| {
            let material = (0..32).map(|i| (n as u8).wrapping_add(i)).collect();
            KeyItem::new(1, n, n, AlgorithmId::Aes256, material)
        })
        .collect::<Result<_, _>>()?;

    let mut on_progress = |current: usize, total: usize, message: &str| {
        println!("[{current}/{total}] {message}");
    };
    let result = kfd.keyload_multiple(&keys, Some(&mut on_progress));
    println!(
        "{}: {} (status {})",
        if result.success { "ok" } else { "failed" },
        result.message,
        result.status
    );
    if !result.success {
        bail!("simulated keyload failed");
    }
    Ok(())
}
