//! One-shot hall-call client.
//!
//! Sends `CALL <src> <dst>` to the controller and prints the outcome.
//! Failing to reach the controller is an error (exit 1); a well-formed
//! `UNAVAILABLE` answer is a normal run.

use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use log::debug;

use liftcore::floor::Floor;
use liftcore::proto::{self, Message};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Request a lift from one floor to another")]
struct Args {
    /// Pickup floor (e.g. 3 or B1)
    from: String,

    /// Drop-off floor
    to: String,

    /// Controller address
    #[arg(long, default_value = liftcore::CONTROLLER_ADDR)]
    controller: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let from: Floor = args
        .from
        .parse()
        .with_context(|| format!("invalid pickup floor {:?}", args.from))?;
    let to: Floor = args
        .to
        .parse()
        .with_context(|| format!("invalid drop-off floor {:?}", args.to))?;

    debug!("asking {} for {} -> {}", args.controller, from, to);
    let mut stream = TcpStream::connect(&args.controller)
        .with_context(|| format!("cannot reach the controller at {}", args.controller))?;
    stream
        .set_read_timeout(Some(REPLY_TIMEOUT))
        .context("cannot arm the reply timeout")?;

    proto::write_frame(&mut stream, &Message::Call { from, to }.encode())
        .context("cannot send the call")?;
    let reply = proto::read_frame(&mut stream)
        .context("cannot read the controller's reply")?
        .context("controller closed the connection without a reply")?;

    match Message::parse(&reply) {
        Ok(Message::Assigned { name }) => println!("Car {} is arriving.", name),
        Ok(Message::Unavailable) => {
            println!("Sorry, no car is available to take this request.")
        }
        _ => bail!("unexpected reply {:?}", reply),
    }
    Ok(())
}
