//! Runs a tiny echo service and a client against it in one process.
//!
//! ```text
//! RUST_LOG=debug cargo run -p minirpc --example echo
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use minirpc::{ConnectionSet, Protocol, Status};
use serde::{Deserialize, Serialize};

const ECHO: u32 = 1;
const SHOUT: u32 = 2;
const STATS: u32 = 3;

#[derive(Serialize, Deserialize, Debug)]
struct Stats {
    echoes: u64,
    peer: String,
}

struct Session {
    peer: String,
    echoes: AtomicU64,
}

fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let server_protocol = Protocol::<Arc<Session>>::builder("echo")
        .handles(ECHO, |conn, text: String| {
            if text.is_empty() {
                return Err(Status::Application(Status::APPLICATION_BASE));
            }
            conn.context().echoes.fetch_add(1, Ordering::Relaxed);
            Ok(text)
        })
        .handles(SHOUT, |conn, text: String| {
            tracing::info!(peer = %conn.context().peer, "{}", text.to_uppercase());
            Ok(())
        })
        .handles(STATS, |conn, (): ()| {
            let session = conn.context();
            Ok(Stats {
                echoes: session.echoes.load(Ordering::Relaxed),
                peer: session.peer.clone(),
            })
        })
        .build()?;

    let idle = Arc::new(Session {
        peer: "-".to_string(),
        echoes: AtomicU64::new(0),
    });
    let server = ConnectionSet::create(server_protocol, idle);
    server.start_dispatch(2)?;
    let addr = server.listen("127.0.0.1:0", |peer| {
        Arc::new(Session {
            peer: peer.to_string(),
            echoes: AtomicU64::new(0),
        })
    })?;

    let client_protocol = Protocol::<()>::builder("echo")
        .sends::<String, String>(ECHO)
        .sends::<String, ()>(SHOUT)
        .sends::<(), Stats>(STATS)
        .build()?;
    let client = ConnectionSet::create(client_protocol, ());
    client.start_dispatch(1)?;
    let conn = client
        .connect(addr, ())
        .with_context(|| format!("connecting to {}", addr))?;

    for word in ["alpha", "beta", "gamma"] {
        let echoed: String = conn.call(ECHO, &word.to_string())?;
        println!("echo: {}", echoed);
    }
    conn.call_no_reply(SHOUT, &"hello from the client".to_string())?;

    match conn.call::<String, String>(ECHO, &String::new()) {
        Err(e) => println!("empty echo rejected: {}", e),
        Ok(text) => println!("unexpected echo: {:?}", text),
    }

    let stats: Stats = conn.call_timeout(STATS, &(), Duration::from_secs(1))?;
    println!("server saw {} echoes from {}", stats.echoes, stats.peer);

    conn.close()?;
    client.shutdown();
    server.shutdown();
    Ok(())
}
