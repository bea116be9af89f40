use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use rdma_pacer::admission::{client, Reply, Request};

/// Talks to a running pacer's admission socket.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the admission socket.
    #[arg(long, default_value = "/tmp/rdma_socket")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request a flow slot and print it.
    Join,
    /// Release a flow slot.
    Quit { slot: u16 },
    /// Ask for the peer's directional flag.
    Read,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let request = match args.command {
        Command::Join => Request::Join,
        Command::Quit { slot } => Request::Quit(slot),
        Command::Read => Request::Read,
    };

    match client::request(&args.socket, request) {
        Ok(Reply::Slot(slot)) => {
            println!("{}", slot);
            ExitCode::SUCCESS
        }
        Ok(Reply::Ok) => ExitCode::SUCCESS,
        Ok(reply) => {
            eprintln!("request refused: {:?}", reply);
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
