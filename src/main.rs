//! reqsock CLI - talk to or run a request/reply server on a local socket.
//!
//! See the `reqsock` library for the messaging layer itself.

use std::io::{self, BufRead, Write};
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqsock::{logging, Client, Config, PeerState, Server, Value};

#[derive(Parser)]
#[command(name = "reqsock")]
#[command(about = "Local request/reply messaging over Unix sockets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive client: send named requests and print the replies
    Client {
        /// Socket path (absolute, or relative to the runtime directory)
        path: String,
    },
    /// Demo server answering PING, ECHO and INCREMENT
    Serve {
        /// Socket path (absolute, or relative to the runtime directory)
        path: String,
    },
    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    logging::init(&config);

    match cli.command {
        Commands::Client { path } => run_client(&path, &config),
        Commands::Serve { path } => run_server(&path, &config),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

// ─── Client REPL ───────────────────────────────────────────────────────────

fn print_help() {
    println!("help\tprints this message");
    println!("quit\texits the client");
    println!("send\tsends a request, usage: send <request-name> [json-args]");
}

/// Parse request arguments as JSON, falling back to a plain string.
fn parse_args(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::None;
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

fn run_client(path: &str, config: &Config) -> Result<()> {
    let mut client = Client::new(path, config, true)
        .with_context(|| format!("Failed to create client for {path}"))?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("Failed to read stdin")?;
        let line = line.trim();

        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match command {
            "" => {}
            "help" => print_help(),
            "quit" | "exit" => {
                println!("exiting...");
                break;
            }
            "send" => {
                let rest = rest.trim_start();
                let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if name.is_empty() {
                    println!("usage: send <request-name> [json-args]");
                    continue;
                }
                if !client.is_connected() {
                    if let Err(e) = client.connect() {
                        println!("error: not connected: {e}");
                        continue;
                    }
                }

                let (tx, rx) = mpsc::channel();
                let sent = client.call(name, &parse_args(args), move |result| {
                    let _ = tx.send(result);
                });
                if let Err(e) = sent {
                    println!("error: {e}");
                    continue;
                }
                match rx.recv() {
                    Ok(Ok(value)) => println!("success: {value}"),
                    Ok(Err(e)) => println!("error: {e}"),
                    Err(_) => println!("error: reply callback dropped"),
                }
            }
            other => println!("unknown command {other:?}, type 'help'"),
        }
    }

    client.disconnect();
    Ok(())
}

// ─── Demo server ───────────────────────────────────────────────────────────

fn register_demo_handlers(server: &Server) -> Result<()> {
    server.set_request_handler("PING", |r, _, _| r.reply_ok(&Value::Int(42)).is_ok())?;
    server.set_request_handler("ECHO", |r, _, args| r.reply_ok(args).is_ok())?;
    server.set_request_handler("INCREMENT", |r, _, args| {
        let sent = match args {
            Value::Int(i) => {
                let next = i
                    .checked_add(1)
                    .map_or_else(|| Value::Long(i64::from(*i) + 1), Value::Int);
                r.reply_ok(&next)
            }
            Value::Long(l) => r.reply_ok(&Value::Long(l.wrapping_add(1))),
            _ => r.reply_error("expected an integer"),
        };
        sent.is_ok()
    })?;
    Ok(())
}

fn run_server(path: &str, config: &Config) -> Result<()> {
    let mut server = Server::new(path, config, false)
        .with_context(|| format!("Failed to create server at {path}"))?;
    register_demo_handlers(&server)?;
    server.set_peer_handler(|fd, state| match state {
        PeerState::Connected => println!("peer {fd} connected"),
        PeerState::Disconnected => println!("peer {fd} disconnected"),
    });

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    server.start().context("Failed to start server")?;
    println!("listening on {} (Ctrl-C to stop)", server.path().display());

    let _ = rx.recv();
    println!("shutting down");
    server.stop();
    Ok(())
}
