use clap::{App, Arg};
use crossbeam_channel::Sender;
use fswrt::svc::{ChannelTransport, TransportPeer};
use fswrt::{Deployment, TopologyConfig};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_ADDRESS: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "50000";
const DOWNLINK_BROADCAST_BUFFER_SIZE: usize = 256;
const UPLINK_READ_SIZE: usize = 4096;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("fswrt-deployment")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Runs the reference flight software topology behind a TCP ground link")
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .value_name("ADDRESS")
                .help("Address to accept the ground connection on")
                .takes_value(true)
                .default_value(DEFAULT_ADDRESS),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port for the ground link")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "Port must be a number".into())),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON topology configuration; the reference configuration when absent")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("period")
                .long("period-ms")
                .value_name("MS")
                .help("Rate group driver tick period")
                .takes_value(true)
                .default_value("1000")
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Period must be a positive number of milliseconds".into()),
                }),
        )
        .get_matches();

    tracing_subscriber::fmt::init();

    let config = match matches.value_of("config") {
        Some(path) => TopologyConfig::load(Path::new(path))?,
        None => TopologyConfig::reference(),
    };
    let address = matches.value_of("address").unwrap_or(DEFAULT_ADDRESS);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let period: u64 = matches.value_of("period").unwrap_or("1000").parse()?;

    let (transport, peer) = ChannelTransport::pair();
    let deployment = Deployment::setup(&config, Box::new(transport))?;

    let (downlink_tx, _) = broadcast::channel(DOWNLINK_BROADCAST_BUFFER_SIZE);
    spawn_downlink_pump(peer.clone(), downlink_tx.clone());

    let listener = TcpListener::bind((address, port)).await?;
    info!("ground link listening on {}:{}", address, port);
    let uplink = peer.uplink.clone();
    let server = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("ground connected: {}", addr);
                    let uplink = uplink.clone();
                    let downlink_rx = downlink_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = bridge(stream, uplink, downlink_rx).await {
                            warn!("ground {} error: {}", addr, e);
                        }
                        info!("ground {} disconnected", addr);
                    });
                }
                Err(e) => error!("failed to accept connection: {}", e),
            }
        }
    });
    drop(peer);

    let mut interval = time::interval(Duration::from_millis(period));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = deployment.cycle() {
                    error!("cycle failed: {}", e);
                }
                if deployment.halt_requested() {
                    error!("fatal announced, halting");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }

    server.abort();
    deployment.teardown();
    Ok(())
}

/// Moves downlinked frames off the blocking channel onto the broadcast
/// channel that ground connections subscribe to. Ends when the com driver
/// is dropped at teardown.
fn spawn_downlink_pump(peer: TransportPeer, downlink_tx: broadcast::Sender<Vec<u8>>) {
    thread::spawn(move || {
        for frame in peer.downlink.iter() {
            // No subscribers is not an error: frames are simply lost.
            let _ = downlink_tx.send(frame);
        }
    });
}

async fn bridge(
    stream: TcpStream,
    uplink: Sender<Vec<u8>>,
    mut downlink_rx: broadcast::Receiver<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut reader, mut writer) = stream.into_split();

    let downlink_task = tokio::spawn(async move {
        loop {
            match downlink_rx.recv().await {
                Ok(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!("failed to downlink frame: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("ground lagging, {} frames lost", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut buf = vec![0u8; UPLINK_READ_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if uplink.send(buf[..n].to_vec()).is_err() {
            break;
        }
    }

    downlink_task.abort();
    Ok(())
}
