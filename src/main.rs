use eyre::WrapErr;
use lexopt::prelude::*;
use std::path::PathBuf;
use tcp_forward::{config, Mapping, Proxy};
use tokio::{select, sync::oneshot};

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    // Initialize logging based on command-line flags before argument parsing
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--debug".to_string()) {
        std::env::set_var("RUST_LOG", "debug");
    } else if args.contains(&"-v".to_string()) || args.contains(&"--verbose".to_string()) {
        std::env::set_var("RUST_LOG", "info");
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let mut config_file = None::<PathBuf>;
    let mut inline = Vec::<Mapping>::new();

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next().wrap_err("parse arguments")? {
        match arg {
            Long("config") | Short('c') if config_file.is_none() => {
                config_file = Some(parser.value().wrap_err("--config")?.into());
            }
            Long("map") | Short('m') => {
                let value = parser.value().wrap_err("--map")?;
                let spec = value.to_string_lossy();
                inline.push(
                    config::parse_inline(&spec).wrap_err_with(|| format!("--map {spec}"))?,
                );
            }
            // Already applied to RUST_LOG above
            Short('v') | Long("verbose") | Long("debug") => {}
            Short('V') | Long("version") => {
                println!("{}", version());
                return Ok(());
            }
            Short('h') | Long("help") => {
                usage(0);
            }
            _ => return Err(arg.unexpected()).wrap_err("unexpected argument"),
        }
    }

    let mut mappings = match &config_file {
        Some(path) => config::load(path)?,
        None if std::path::Path::new(config::DEFAULT_FILE).exists() => {
            config::load(config::DEFAULT_FILE)?
        }
        None if inline.is_empty() => {
            tracing::warn!("File {} does not exist", config::DEFAULT_FILE);
            Vec::new()
        }
        None => Vec::new(),
    };
    mappings.extend(inline);
    let mappings = config::validate(mappings);

    if mappings.is_empty() {
        tracing::info!("Nothing to do.");
        return Ok(());
    }

    tracing::info!("Starting {}", version());
    let proxy = Proxy::new(mappings).wrap_err("create forwarder")?;
    for (name, addr) in proxy.bound() {
        tracing::info!("Forwarding '{name}' from {addr}");
    }
    let running = proxy.spawn().wrap_err("spawn forwarder thread")?;

    tracing::info!("Type 'exit' without quotes to close program");
    select! {
        // A closed stdin drops the sender; only Ctrl-C is left then
        Ok(()) = exit_command() => {}
        res = tokio::signal::ctrl_c() => res.wrap_err("listen for ctrl-c")?,
    }

    tracing::info!("Stopping forwarder");
    tokio::task::spawn_blocking(move || running.stop())
        .await
        .wrap_err("join forwarder")??;
    Ok(())
}

/// Watches stdin for the `exit` command on a plain thread; tokio's stdin
/// would keep the runtime from shutting down while a read is pending.
fn exit_command() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) if line.trim() == "exit" => {
                    let _ = tx.send(());
                    return;
                }
                Ok(_) => tracing::info!("Type 'exit' without quotes to close program"),
                Err(e) => {
                    tracing::error!("read stdin: {e}");
                    return;
                }
            }
        }
    });
    rx
}

fn version() -> String {
    format!(
        "{} {} ({})",
        env!("CARGO_BIN_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    )
}

/// Displays help information and exits with the specified code.
fn usage(exit_with: i32) -> ! {
    let bin = std::env::args()
        .next()
        .unwrap_or_else(|| String::from(env!("CARGO_BIN_NAME")));

    eprintln!("{}", version());
    eprintln!();
    eprintln!("DESCRIPTION:");
    eprintln!("    Forwards TCP connections accepted on local ports to fixed remote addresses.");
    eprintln!("    All tunnels are served from a single event loop thread.");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    {bin} [OPTIONS] [--config <FILE>] [--map <NAME=LOCAL:HOST:PORT>]...");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config <FILE>     Properties file with mappings (default: {})", config::DEFAULT_FILE);
    eprintln!("    -m, --map <SPEC>        Add a mapping NAME=LOCAL_PORT:HOST:REMOTE_PORT (repeatable)");
    eprintln!("    -v, --verbose           Enable informational logging");
    eprintln!("    --debug                 Enable debug logging");
    eprintln!("    -V, --version           Print version and exit");
    eprintln!("    -h, --help              Show this help message");
    eprintln!();
    eprintln!("CONFIG FILE:");
    eprintln!("    <name>.localPort = <port>      Port to listen on (all interfaces)");
    eprintln!("    <name>.remoteHost = <host>     Host to forward to");
    eprintln!("    <name>.remotePort = <port>     Port to forward to");
    eprintln!();
    eprintln!("    Incomplete mappings and mappings reusing a local port are skipped.");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    {bin} --config /etc/tcp-forward/proxy.properties");
    eprintln!("    {bin} -v --map web=8080:10.0.0.7:80 --map ssh=2222:gateway:22");
    eprintln!();
    eprintln!("Type 'exit' or press Ctrl-C to stop.");
    std::process::exit(exit_with);
}
