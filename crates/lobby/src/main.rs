mod config;
mod driver;
mod simulation;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::DriverConfig;
use driver::Driver;
use sprocket::net::{LOBBY_PORT, MAX_PLAYERS};
use sprocket::{FaultInjection, NetConfig};

#[derive(Parser)]
#[command(name = "sprocket-lobby")]
#[command(about = "Headless LAN lobby and race driver")]
struct Args {
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    #[arg(short, long, default_value_t = LOBBY_PORT, help = "TCP game port")]
    port: u16,

    #[arg(long, help = "UDP discovery port, defaults to the game port")]
    lobby_port: Option<u16>,

    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::BROADCAST))]
    broadcast: IpAddr,

    #[arg(short, long, default_value = "PLAYER")]
    name: String,

    #[arg(short, long, help = "Log per-frame traffic")]
    verbose: bool,

    #[arg(long, help = "Cross-check vehicle positions every frame")]
    check_positions: bool,

    #[arg(long, help = "Ignore datagrams that are not our advertisement")]
    validate_advertisement: bool,

    #[arg(long, default_value_t = 30)]
    frame_rate: u32,

    #[arg(long, default_value_t = 0x5EED, help = "Shared race seed")]
    seed: u64,

    #[arg(long, help = "Host only: sends to each client fail after this many frames")]
    fail_sends_after: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a lobby and race once enough players joined
    Host {
        #[arg(long, default_value_t = 2, help = "Players, host included")]
        players: usize,

        #[arg(long, default_value_t = 300)]
        frames: u32,

        #[arg(long, default_value_t = 0)]
        track: u8,

        #[arg(long, default_value_t = 0)]
        mode: u8,
    },
    /// Join the first lobby found, or a host given by address
    Join {
        #[arg(long)]
        address: Option<SocketAddr>,

        #[arg(long, default_value_t = 10)]
        search_secs: u64,

        #[arg(long, default_value_t = 0)]
        vehicle: u16,
    },
    /// List advertised lobbies
    Search {
        #[arg(long, default_value_t = 5)]
        secs: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let net_config = NetConfig {
        bind_ip: args.bind,
        lobby_port: args.lobby_port.unwrap_or(args.port),
        game_port: args.port,
        broadcast_ip: args.broadcast,
        player_name: args.name,
        check_positions: args.check_positions,
        validate_advertisement: args.validate_advertisement,
        ..Default::default()
    };

    let mut config = DriverConfig {
        frame_rate: args.frame_rate,
        seed: args.seed,
        faults: args.fail_sends_after.map(|frames| FaultInjection {
            fail_sends: true,
            fail_after_frames: frames,
        }),
        ..Default::default()
    };

    match args.command {
        Command::Host {
            players,
            frames,
            track,
            mode,
        } => {
            config.min_players = players.clamp(2, MAX_PLAYERS);
            config.frames = frames;
            config.track_num = track;
            config.game_mode = mode;
            Driver::new(net_config, config).host()?;
        }
        Command::Join {
            address,
            search_secs,
            vehicle,
        } => {
            config.search_time = Duration::from_secs(search_secs);
            config.vehicle_type = vehicle;
            Driver::new(net_config, config).join(address)?;
        }
        Command::Search { secs } => {
            driver::search(&net_config, Duration::from_secs(secs))?;
        }
    }

    log::info!("Done");
    Ok(())
}
