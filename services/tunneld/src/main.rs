use chassis::config::{self, DaemonConfig};
use chassis::logging;
use clap::{App, Arg};
use conduit::bus::LocalBus;
use conduit::introspect::{Introspect, DEFAULT_REFRESH};
use conduit::net::frame::TunnelParams;
use conduit::net::server::TunnelServer;
use conduit::net::DEFAULT_PORT;
use std::net::{SocketAddr, ToSocketAddrs};
use std::process;
use std::sync::atomic::AtomicBool;

fn main() {
    let matches = App::new("tunneld")
        .version("0.1.0")
        .about("Bridges publish/subscribe bus traffic to remote peers over TCP or fragmented UDP.")
        .arg(
            Arg::with_name("SERVER_ADDR")
                .help("Remote tunnel server as addr[:port]; listen-only when omitted"),
        )
        .arg(
            Arg::with_name("channels_recv")
                .short("r")
                .long("channels_recv")
                .takes_value(true)
                .help("Regex of channels the remote end should forward to us (anchored automatically)"),
        )
        .arg(
            Arg::with_name("channels_send")
                .short("s")
                .long("channels_send")
                .takes_value(true)
                .help("Regex of channels forwarded to the remote end (anchored automatically)"),
        )
        .arg(
            Arg::with_name("udp")
                .short("u")
                .long("udp")
                .help("Request datagram transport instead of the TCP stream"),
        )
        .arg(
            Arg::with_name("fec")
                .short("f")
                .long("fec")
                .takes_value(true)
                .help("Apply forward error correction at the given rate (> 1); implies --udp"),
        )
        .arg(
            Arg::with_name("dup")
                .short("d")
                .long("dup")
                .takes_value(true)
                .help("Send every datagram N times instead of coding; implies --udp"),
        )
        .arg(
            Arg::with_name("wait_time_ms")
                .short("w")
                .long("wait-time-ms")
                .takes_value(true)
                .help("Coalesce outbound messages for up to this many milliseconds"),
        )
        .arg(
            Arg::with_name("tcp_max_age_ms")
                .short("m")
                .long("tcp-max-age-ms")
                .takes_value(true)
                .help("Drop queued TCP messages older than this; 0 queues indefinitely"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("Control port to listen on"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("TOML config file; flags override its values"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug severity"),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("Log warnings and errors only"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => match config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error reading config file {}: {}", path, err);
                process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };

    if let Some(value) = matches.value_of("channels_recv") {
        config.channels_recv = value.to_owned();
    }
    if let Some(value) = matches.value_of("channels_send") {
        config.channels_send = value.to_owned();
    }
    if matches.is_present("udp") {
        config.udp = true;
    }
    if let Some(value) = matches.value_of("port") {
        config.port = parse_flag("--port", value);
    }
    if let Some(value) = matches.value_of("wait_time_ms") {
        config.max_delay_ms = parse_flag("--wait-time-ms", value);
    }
    if let Some(value) = matches.value_of("tcp_max_age_ms") {
        config.tcp_max_age_ms = parse_flag("--tcp-max-age-ms", value);
    }
    if let Some(value) = matches.value_of("fec") {
        let rate: f32 = parse_flag("--fec", value);
        if rate < 1.0 {
            eprintln!("--fec rate must be at least 1");
            process::exit(1);
        }
        config.fec = rate;
        config.udp = true;
    }
    if let Some(value) = matches.value_of("dup") {
        let copies: u32 = parse_flag("--dup", value);
        if copies < 1 {
            eprintln!("--dup must be at least 1");
            process::exit(1);
        }
        // negative rates request plain duplication
        config.fec = -(copies as f32);
        config.udp = true;
    }
    if matches.is_present("verbose") {
        config.log_level = "debug".to_owned();
    }
    if matches.is_present("quiet") {
        config.log_level = "warning".to_owned();
    }

    let log = logging::init(&config.log_level);

    let bus = LocalBus::new();
    let handle = bus.handle();
    let introspect = Introspect::new(handle.clone(), DEFAULT_REFRESH, log.clone());

    let mut server = match TunnelServer::new(config.port, handle, introspect, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::crit!(log, "failed to start tunnel server"; "error" => ?err);
            process::exit(1);
        }
    };

    if let Some(spec) = matches.value_of("SERVER_ADDR") {
        let addr = match resolve(spec) {
            Ok(addr) => addr,
            Err(err) => {
                logging::crit!(log, "bad server address"; "addr" => spec, "error" => %err);
                process::exit(1);
            }
        };

        let params = TunnelParams {
            udp: config.udp,
            fec: config.fec,
            max_delay_ms: config.max_delay_ms,
            tcp_max_age_ms: config.tcp_max_age_ms,
            udp_port: 0,
            channels: config.channels_send.clone(),
        };

        logging::info!(log, "connecting";
                       "peer" => %addr,
                       "send_channels" => %config.channels_send,
                       "recv_channels" => %config.channels_recv);

        if let Err(err) = server.connect_to_peer(&addr, params, &config.channels_recv) {
            logging::crit!(log, "could not connect to server"; "error" => ?err);
            process::exit(1);
        }
    } else {
        logging::info!(log, "not connecting to any servers");
    }

    let stop = AtomicBool::new(false);
    if let Err(err) = server.run(&stop) {
        logging::crit!(log, "reactor failed"; "error" => %err);
        process::exit(1);
    }
}

fn parse_flag<T: std::str::FromStr>(flag: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid value for {}: {}", flag, value);
        process::exit(1);
    })
}

/// Resolves `host[:port]`, falling back to the default control port.
fn resolve(spec: &str) -> Result<SocketAddr, String> {
    let (host, port) = match spec.rfind(':') {
        Some(split) => {
            let port = spec[split + 1..]
                .parse::<u16>()
                .map_err(|_| format!("bad port in {}", spec))?;
            (&spec[..split], port)
        }
        None => (spec, DEFAULT_PORT),
    };

    (host, port)
        .to_socket_addrs()
        .map_err(|err| err.to_string())?
        .next()
        .ok_or_else(|| format!("{} did not resolve", host))
}
