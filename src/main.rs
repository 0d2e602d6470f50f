use aether_ipc::{Channel, ChannelConfig, ChannelEvent, EventSender};
use std::io::{self, Read};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default time to keep printing backend events after a send.
const DEFAULT_WAIT_MS: u64 = 1000;

fn print_usage() {
    eprintln!(
        "aether-ipc - talk to the AetherVisor backend over its pipe

Usage:
  aether-ipc [options] exec      <file|->   # run a script
  aether-ipc [options] analyze   <file|->   # ask for a SAFE/UNSAFE verdict
  aether-ipc [options] inject    <process>  # attach backend to a process
  aether-ipc [options] configure <value>    # set the sensitivity value
  aether-ipc [options] shutdown             # ask the backend to exit
  aether-ipc [options] listen               # print events until disconnected
  aether-ipc [options] pipe                 # print pipe path

Options:
  --pipe NAME     Pipe name (default AetherVisor_Session_Pipe)
  --timeout MS    Connect timeout (default 5000)
  --wait MS       How long to print events after a send (default 1000)

Backend events are printed to stdout as one JSON object per line.

Environment:
  AETHER_PIPE_DIR             Override pipe directory
  AETHER_PIPE_NAME            Override pipe name
  AETHER_CONNECT_TIMEOUT_MS   Override connect timeout
  RUST_LOG                    Log filter (default info)"
    );
}

struct Options {
    config: ChannelConfig,
    wait: Duration,
    command: Vec<String>,
}

fn parse_ms(flag: &str, value: Option<&String>) -> io::Result<Duration> {
    value
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} expects milliseconds", flag),
            )
        })
}

fn parse_options(args: &[String]) -> io::Result<Options> {
    let mut config = ChannelConfig::from_env();
    let mut wait = Duration::from_millis(DEFAULT_WAIT_MS);
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--pipe" => {
                i += 1;
                let name = args.get(i).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "--pipe expects a name")
                })?;
                config = config.pipe_name(name.as_str());
            }
            "--timeout" => {
                i += 1;
                config = config.connect_timeout(parse_ms("--timeout", args.get(i))?);
            }
            "--wait" => {
                i += 1;
                wait = parse_ms("--wait", args.get(i))?;
            }
            _ => break,
        }
        i += 1;
    }
    Ok(Options {
        config,
        wait,
        command: args[i..].to_vec(),
    })
}

/// Read a script from a path, or stdin for `-`.
fn read_script(source: &str) -> io::Result<String> {
    if source == "-" {
        let mut script = String::new();
        io::stdin().read_to_string(&mut script)?;
        Ok(script)
    } else {
        std::fs::read_to_string(source)
    }
}

fn required<'a>(command: &'a [String], what: &str) -> io::Result<&'a str> {
    command.get(1).map(|s| s.as_str()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} required", what),
        )
    })
}

fn print_event(event: &ChannelEvent) {
    println!("{}", serde_json::to_string(event).unwrap_or_default());
}

/// Print events until `deadline` (if any) or until the connection ends.
fn drain_events(rx: &Receiver<ChannelEvent>, deadline: Option<Instant>) {
    loop {
        let event = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                        return
                    }
                }
            }
            None => match rx.recv() {
                Ok(event) => event,
                Err(_) => return,
            },
        };
        print_event(&event);
        if matches!(event, ChannelEvent::Disconnected { .. }) {
            return;
        }
    }
}

enum Command {
    Exec(String),
    Analyze(String),
    Inject(String),
    Configure(f64),
    Shutdown,
    Listen,
}

fn parse_command(args: &[String]) -> io::Result<Command> {
    let name = args.first().map(|s| s.as_str()).unwrap_or("");
    let command = match name {
        "exec" => Command::Exec(read_script(required(args, "script file")?)?),
        "analyze" => Command::Analyze(read_script(required(args, "script file")?)?),
        "inject" => Command::Inject(required(args, "process name")?.to_string()),
        "configure" => {
            let raw = required(args, "value")?;
            let value = raw.parse::<f64>().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid value: {}", raw),
                )
            })?;
            Command::Configure(value)
        }
        "shutdown" => Command::Shutdown,
        "listen" => Command::Listen,
        "" => {
            print_usage();
            std::process::exit(1);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    };
    Ok(command)
}

fn run(options: Options) -> io::Result<()> {
    let Options {
        config,
        wait,
        command,
    } = options;

    if command.first().map(|s| s.as_str()) == Some("pipe") {
        println!("{}", config.pipe_path().display());
        return Ok(());
    }
    let command = parse_command(&command)?;

    let channel = Channel::new(config);
    let (sender, rx) = EventSender::new();
    channel.subscribe(Arc::new(sender));
    channel
        .connect(channel.config().connect_timeout)
        .map_err(io::Error::other)?;

    let sent = match &command {
        Command::Exec(script) => channel.send_execute_script(script),
        Command::Analyze(script) => channel.send_analyze_script(script),
        Command::Inject(process) => channel.send_inject(process),
        Command::Configure(value) => channel.send_configure(*value),
        Command::Shutdown => channel.send_shutdown(),
        Command::Listen => {
            drain_events(&rx, None);
            return Ok(());
        }
    };
    sent.map_err(io::Error::other)?;

    // A wait too large for a deadline means until the backend goes away.
    drain_events(&rx, Instant::now().checked_add(wait));
    channel.disconnect();
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }
    if matches!(args[1].as_str(), "-h" | "--help" | "help") {
        print_usage();
        return;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let result = parse_options(&args[1..]).and_then(run);

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
