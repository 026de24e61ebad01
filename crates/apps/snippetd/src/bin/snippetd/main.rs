mod bootstrap;

use clap::Parser;
use snippet_rpc::{PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "snippetd")]
struct Args {
    /// Address to listen on; overrides the config file.
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Require every session to open with a `handshake` carrying the secret.
    #[arg(long)]
    require_handshake: bool,
    #[arg(long)]
    capability_level: Option<u32>,
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    println!("SNIPPET START, PROTOCOL {} {}", PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION);
    let context = bootstrap::bootstrap(args).await?;
    if let Some(secret) = &context.secret {
        println!("SNIPPET SECRET, {secret}");
    }
    println!("SNIPPET SERVING, PORT {}", context.addr.port());

    let server = Arc::clone(&context.server);
    tokio::select! {
        served = server.serve(context.listener) => served?,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            log::info!("snippetd: interrupted, shutting down");
            context.server.shutdown();
            let dispatcher = Arc::clone(context.server.dispatcher());
            tokio::task::spawn_blocking(move || dispatcher.shutdown()).await?;
        }
    }
    Ok(())
}
