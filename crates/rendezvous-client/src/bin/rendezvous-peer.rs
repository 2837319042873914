//! Rendezvous peer: drives one side of a handshake against a gateway with
//! fixed descriptors. Useful for smoke-testing a deployment.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rendezvous_client::{parse_gateway_url, Peer, PeerOutcome, StaticEngine};
use rendezvous_common::{init_tracing_with_default, SessionId};

#[derive(Parser, Debug)]
#[command(name = "rendezvous-peer")]
#[command(about = "Rendezvous peer - exchange descriptors through a gateway")]
struct Args {
    /// Gateway signaling URL
    #[arg(long, env = "RENDEZVOUS_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Local descriptor to publish
    #[arg(long, default_value = "v=0")]
    descriptor: String,

    /// Local candidates to trickle (repeatable)
    #[arg(long = "candidate")]
    candidates: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a session and publish an offer
    Offer,

    /// Join a session and answer its offer
    Answer {
        /// Session id printed by the offering side
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing_with_default(&format!(
        "rendezvous_client={0},rendezvous_peer={0}",
        args.log_level
    ));

    let url = parse_gateway_url(&args.url)?;
    let (engine, events) = StaticEngine::new(args.descriptor.clone(), args.candidates.clone());

    let mut peer = match &args.command {
        Command::Offer => {
            let peer = Peer::offer(&url, engine, events).await?;
            println!("Session: {}", peer.session_id());
            peer
        }
        Command::Answer { session } => {
            let session_id =
                SessionId::parse(session).ok_or_else(|| anyhow!("invalid session id: {}", session))?;
            Peer::answer(&url, engine, events, session_id).await?
        }
    };

    let outcome = tokio::select! {
        outcome = peer.run() => outcome?,
        _ = tokio::signal::ctrl_c() => PeerOutcome::Disconnected,
    };

    let engine = peer.hang_up().await;
    if let Some(remote) = engine.remote_descriptor() {
        println!("Remote descriptor: {}", remote);
    }
    for candidate in engine.remote_candidates() {
        println!("Remote candidate:  {}", candidate);
    }
    println!("Outcome: {:?}", outcome);
    Ok(())
}
