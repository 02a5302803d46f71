use std::io::ErrorKind;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use ncplink_common::bus::{SerialControl, SerialError, SerialRead, SerialWrite};
use ncplink_common::time::{Clock, TimeDiff};
use ncplink_link::profile::{LinkProfile, ResetMethod, SerialFlowControl};
use ncplink_link::LinkEngine;
use ncplink_transport::{TransportAdapter, TransportError, TransportEvent};
use nix::time::{clock_gettime, ClockId};
use serial2::{FlowControl, SerialPort, Settings};

#[derive(Clone, Copy)]
struct MonotonicInstant {
    nanos: u64,
}

#[derive(Clone)]
struct MonotonicClock;

impl Clock for MonotonicClock {
    type TInstant = MonotonicInstant;

    fn current_instant(&self) -> MonotonicInstant {
        let time = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("monotonic clock unavailable");
        MonotonicInstant { nanos: (time.tv_sec() * 1_000_000_000 + time.tv_nsec()) as u64 }
    }

    fn diff(&self, newer: MonotonicInstant, older: MonotonicInstant) -> TimeDiff {
        if newer.nanos >= older.nanos {
            TimeDiff::Forward(Duration::from_nanos(newer.nanos - older.nanos))
        } else {
            TimeDiff::Backward(Duration::from_nanos(older.nanos - newer.nanos))
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ProfileArg {
    NcpRtscts115200,
    NcpXonxoff57600,
    AvrXonxoff38400,
}

impl ProfileArg {
    fn resolve(self) -> LinkProfile {
        match self {
            ProfileArg::NcpRtscts115200 => LinkProfile::ncp_rtscts_115200(),
            ProfileArg::NcpXonxoff57600 => LinkProfile::ncp_xonxoff_57600(),
            ProfileArg::AvrXonxoff38400 => LinkProfile::avr_xonxoff_38400(),
        }
    }
}

/// Host-side driver for the serial NCP link. Opens the port, brings the
/// peer through the RST/RSTACK handshake, and sends one test command.
#[derive(Parser, Debug)]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0
    port: String,

    #[clap(long, value_enum, default_value_t = ProfileArg::NcpRtscts115200)]
    profile: ProfileArg,

    /// Overrides the profile's baud rate.
    #[clap(long)]
    baud_rate: Option<u32>,

    /// Bytes to send as a single command once the link comes up.
    #[clap(long, value_delimiter = ',', default_value = "1,2,3,4")]
    command: Vec<u8>,

    #[clap(long, action = clap::ArgAction::Count)]
    trace: u8,
}

struct SerialBus {
    port: SerialPort,
}

impl SerialRead for SerialBus {
    fn read_byte(&mut self) -> Result<u8, SerialError> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(SerialError::WouldBlock),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(SerialError::WouldBlock),
            Err(_) => Err(SerialError::Io),
        }
    }
}

impl SerialWrite for SerialBus {
    fn write_byte(&mut self, byte: u8) -> Result<(), SerialError> {
        match self.port.write(&[byte]) {
            Ok(1) => Ok(()),
            Ok(_) => Err(SerialError::WouldBlock),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(SerialError::WouldBlock),
            Err(_) => Err(SerialError::Io),
        }
    }

    fn is_tx_busy(&self) -> bool {
        false
    }
}

impl SerialControl for SerialBus {
    fn pulse_reset(&mut self, hold: Duration) {
        let _ = self.port.set_rts(false);
        std::thread::sleep(hold);
        let _ = self.port.set_rts(true);
    }
}

fn open_port(path: &str, profile: &LinkProfile) -> SerialPort {
    let stop_bits = profile.stop_bits;
    let port = SerialPort::open(path, move |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(profile.baud_rate).unwrap();
        settings.set_char_size(serial2::CharSize::Bits8);
        settings.set_parity(serial2::Parity::None);
        settings.set_stop_bits(if stop_bits >= 2 { serial2::StopBits::Two } else { serial2::StopBits::One });
        settings.set_flow_control(match profile.flow_control {
            SerialFlowControl::Hardware => FlowControl::RtsCts,
            SerialFlowControl::Software => FlowControl::XonXoff,
            SerialFlowControl::None => FlowControl::None,
        });
        Ok(settings)
    })
    .unwrap_or_else(|e| panic!("failed to open {path}: {e}"));
    port.set_read_timeout(Duration::from_millis(10)).expect("failed to set read timeout");
    port
}

fn main() {
    let args = Args::parse();
    let level = match args.trace {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    let mut profile = args.profile.resolve();
    if let Some(baud) = args.baud_rate {
        profile.baud_rate = baud;
    }
    if matches!(profile.reset_method, ResetMethod::None) {
        profile.reset_method = ResetMethod::RstFrame;
    }

    let port = open_port(&args.port, &profile);
    let mut bus = SerialBus { port };

    const RX_BUFFERS: usize = 8;
    const TX_BUFFERS: usize = RX_BUFFERS + ncplink_link::TX_POOL_HEADROOM;
    let engine: LinkEngine<TX_BUFFERS, RX_BUFFERS, MonotonicClock> = LinkEngine::new(MonotonicClock, profile);
    let mut adapter = TransportAdapter::new(engine, MonotonicClock);
    adapter.init(&mut bus);

    info!("waiting for link to come up on {}", args.port);
    let mut command_sent = false;
    let mut got_response = false;
    let mut reconnect_attempts: u32 = 0;
    const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    loop {
        loop {
            match adapter.poll(&mut bus) {
                Ok(Some(TransportEvent::Response(payload))) => {
                    info!("response: {:02x?}", payload.as_slice());
                    got_response = true;
                }
                Ok(Some(TransportEvent::Callback(payload))) => {
                    info!("callback: {:02x?}", payload.as_slice());
                }
                Ok(None) => break,
                Err(TransportError::Link(e)) => {
                    warn!("link error: {e:?}");
                }
                Err(e) => {
                    error!("transport error: {e}");
                    break;
                }
            }
        }

        if got_response {
            info!("demo command answered, closing link");
            adapter.close();
            std::process::exit(0);
        }

        adapter.tick(&mut bus);
        if let Err(e) = adapter.check_timeout() {
            warn!("command timed out: {e}");
        }

        if !command_sent && adapter.engine().is_connected() {
            match adapter.send_command(&args.command) {
                Ok(()) => {
                    info!("sent command {:02x?}", args.command);
                    command_sent = true;
                }
                Err(e) => warn!("could not send command yet: {e}"),
            }
        }

        if adapter.engine().state() == ncplink_link::LinkState::Failed {
            match adapter.engine().last_local_fatal() {
                Some(reason) => error!("link failed locally ({reason:?}), resetting peer"),
                None => error!("link failed (peer reset reason: {:?}), resetting peer", adapter.engine().last_reset_reason()),
            }
            reconnect_attempts += 1;
            if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                error!("giving up after {reconnect_attempts} failed reconnect attempts");
                std::process::exit(1);
            }
            adapter.init(&mut bus);
            command_sent = false;
        }
    }
}
