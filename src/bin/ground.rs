use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use fswrt::framing::{DeframeOutcome, FprimeFraming, FramingProtocol, PacketType, PACKET_TYPE_SIZE};
use fswrt::svc::cmd_dispatcher::command_packet;
use fswrt::svc::cmd_sequencer::{CmdSequencer, SequenceFile};
use fswrt::svc::file_uplink::FilePacket;
use fswrt::svc::CommandDispatcher;
use fswrt::{EventRecord, Severity, TopologyConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "50000";
/// Base ids of the reference deployment's command handlers.
const CMD_DISP_BASE: u32 = 0x1000;
const CMD_SEQ_BASE: u32 = 0x1100;
const FILE_CHUNK: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("fswrt-ground")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Ground console for a running fswrt deployment")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Deployment host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Deployment ground link port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("wait")
                .short("w")
                .long("wait")
                .value_name("SECONDS")
                .help("How long to print downlinked events after sending")
                .takes_value(true)
                .default_value("3")
                .global(true),
        )
        .subcommand(SubCommand::with_name("listen").about("Print downlinked events until interrupted"))
        .subcommand(SubCommand::with_name("no-op").about("Send the dispatcher's no-op command"))
        .subcommand(
            SubCommand::with_name("send")
                .about("Send a raw command")
                .arg(Arg::with_name("opcode").required(true).help("Opcode, decimal or 0x-prefixed hex"))
                .arg(Arg::with_name("args").help("Argument bytes as hex")),
        )
        .subcommand(
            SubCommand::with_name("run-seq")
                .about("Uplink a JSON sequence and start it")
                .arg(Arg::with_name("file").required(true).help("Sequence JSON file")),
        )
        .subcommand(SubCommand::with_name("cancel-seq").about("Cancel the running sequence"))
        .subcommand(
            SubCommand::with_name("upload")
                .about("Uplink a file")
                .arg(Arg::with_name("file").required(true).help("Local file to send"))
                .arg(Arg::with_name("name").required(true).help("Destination name")),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let wait: u64 = matches.value_of("wait").unwrap_or("3").parse()?;
    let framing = FprimeFraming::new(TopologyConfig::reference().max_frame_payload);

    let mut stream = TcpStream::connect((host, port)).await?;
    println!("{} {}:{}", "connected to".bright_green(), host, port);

    let payloads = match matches.subcommand() {
        ("listen", _) => Vec::new(),
        ("no-op", _) => vec![command_packet(CMD_DISP_BASE + CommandDispatcher::OPCODE_NO_OP, &[])],
        ("send", Some(sub)) => vec![raw_command(sub)?],
        ("run-seq", Some(sub)) => {
            let text = std::fs::read_to_string(sub.value_of("file").unwrap_or_default())?;
            let sequence: SequenceFile = serde_json::from_str(&text)?;
            let encoded = sequence.encode()?;
            println!("{} {} commands, {} bytes", "sequence".bright_cyan(), sequence.commands.len(), encoded.len());
            vec![command_packet(CMD_SEQ_BASE + CmdSequencer::OPCODE_CS_RUN, &encoded)]
        }
        ("cancel-seq", _) => vec![command_packet(CMD_SEQ_BASE + CmdSequencer::OPCODE_CS_CANCEL, &[])],
        ("upload", Some(sub)) => {
            let data = std::fs::read(sub.value_of("file").unwrap_or_default())?;
            let name = sub.value_of("name").unwrap_or_default();
            FilePacket::split(name, &data, FILE_CHUNK).iter().map(FilePacket::encode).collect()
        }
        _ => Vec::new(),
    };

    for payload in &payloads {
        let frame = framing.frame_to_vec(payload)?;
        stream.write_all(&frame).await?;
    }
    if !payloads.is_empty() {
        println!("{} {} packet(s)", "uplinked".bright_green(), payloads.len());
    }

    let listen_forever = matches.subcommand_name() == Some("listen");
    let mut pending = Vec::new();
    let mut buf = vec![0u8; 4096];
    let deadline = time::sleep(Duration::from_secs(wait));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    println!("{}", "link closed".yellow());
                    break;
                }
                pending.extend_from_slice(&buf[..n]);
                drain_frames(&framing, &mut pending);
            }
            _ = &mut deadline, if !listen_forever => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn raw_command(matches: &ArgMatches<'_>) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let opcode = matches.value_of("opcode").unwrap_or("0");
    let opcode = match opcode.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => opcode.parse()?,
    };
    let args = match matches.value_of("args") {
        Some(hex) => parse_hex(hex)?,
        None => Vec::new(),
    };
    Ok(command_packet(opcode, &args))
}

fn parse_hex(text: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if text.len() % 2 != 0 {
        return Err("hex arguments need an even number of digits".into());
    }
    let mut bytes = Vec::with_capacity(text.len() / 2);
    for i in (0..text.len()).step_by(2) {
        bytes.push(u8::from_str_radix(&text[i..i + 2], 16)?);
    }
    Ok(bytes)
}

fn drain_frames(framing: &FprimeFraming, pending: &mut Vec<u8>) {
    loop {
        match framing.deframe(pending.as_slice()) {
            DeframeOutcome::NeedMore(_) => return,
            DeframeOutcome::Discard(n) => {
                println!("{} {} bytes", "discarded".red(), n);
                pending.drain(..n);
            }
            DeframeOutcome::Frame { payload, consumed } => {
                print_packet(&pending[payload]);
                pending.drain(..consumed);
            }
        }
    }
}

fn print_packet(payload: &[u8]) {
    match PacketType::of(payload) {
        Some(PacketType::Log) => match serde_json::from_slice::<EventRecord>(&payload[PACKET_TYPE_SIZE..]) {
            Ok(event) => print_event(&event),
            Err(e) => println!("{} {}", "bad event:".red(), e),
        },
        Some(other) => println!("{} {:?} ({} bytes)", "packet".dimmed(), other, payload.len()),
        None => println!("{} ({} bytes)", "unknown packet".red(), payload.len()),
    }
}

fn print_event(event: &EventRecord) {
    let severity = format!("{:?}", event.severity);
    let severity = match event.severity {
        Severity::Fatal => severity.bright_red().bold(),
        Severity::WarningHi => severity.bright_red(),
        Severity::WarningLo => severity.yellow(),
        Severity::Command => severity.bright_cyan(),
        Severity::ActivityHi | Severity::ActivityLo => severity.bright_green(),
        Severity::Diagnostic => severity.dimmed(),
    };
    println!(
        "{} {:>10} {:#06x} {}: {}",
        event.timestamp_ms.to_string().dimmed(),
        severity,
        event.id,
        event.source.bright_white(),
        event.text
    );
}
