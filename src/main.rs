use axum::Json;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use replica_map::channel::gossip::GossipChannel;
use replica_map::map::handlers::*;
use replica_map::map::protocol::{GetResponse, PutRequest, PutResponse, StatusResponse};
use replica_map::map::store::ReplicatedMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind <addr:port> [--seed <addr:port>]", args[0]);
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");
    let http_addr = SocketAddr::new(bind_addr.ip(), bind_addr.port() + 1000);

    tracing::info!("Starting node on {}", bind_addr);
    if seed_nodes.is_empty() {
        tracing::info!("Starting as seed node (founder)");
    } else {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    }

    // 1. Group channel (UDP gossip + HTTP delivery):
    let channel = GossipChannel::new(bind_addr, http_addr, seed_nodes).await?;
    tracing::info!("Node ID: {}", channel.local.id);
    channel.clone().start().await;

    // 2. Replicated map:
    let sessions = ReplicatedMap::<String, SessionRecord>::new(channel.clone(), "sessions");
    sessions.on_local_promotion(|key, record| {
        tracing::info!("Took ownership of session '{}' (user {})", key, record.user);
    });
    sessions.clone().start().await;

    // 3. HTTP router:
    let app = Router::new()
        .route("/put", post(handle_put_session))
        .route("/get/:key", get(handle_get_session))
        .route("/remove/:key", post(handle_remove_session))
        .route("/status", get(handle_status_session))
        .route("/internal/message", post(handle_message))
        .route("/internal/state/:map_id", get(handle_state))
        .layer(Extension(sessions.clone()))
        .layer(Extension(channel.clone()));

    // 4. Stats reporter:
    let stats_channel = channel.clone();
    let stats_map = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_channel.alive_members();
            tracing::info!(
                "Cluster stats: {} alive node(s), {} local entr(ies)",
                alive.len(),
                stats_map.len()
            );
            for member in alive {
                tracing::info!(
                    "  - {} gossip={} http={} (inc={})",
                    member.id,
                    member.gossip_addr,
                    member.http_addr,
                    member.incarnation
                );
            }
        }
    });

    // 5. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    user: String,
    data: String,
}

async fn handle_put_session(
    map: Extension<Arc<ReplicatedMap<String, SessionRecord>>>,
    json: Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>) {
    handle_put::<String, SessionRecord>(map, json).await
}

async fn handle_get_session(
    map: Extension<Arc<ReplicatedMap<String, SessionRecord>>>,
    key: Path<String>,
) -> (StatusCode, Json<GetResponse>) {
    handle_get::<String, SessionRecord>(map, key).await
}

async fn handle_remove_session(
    map: Extension<Arc<ReplicatedMap<String, SessionRecord>>>,
    key: Path<String>,
) -> (StatusCode, Json<PutResponse>) {
    handle_remove::<String, SessionRecord>(map, key).await
}

async fn handle_status_session(
    map: Extension<Arc<ReplicatedMap<String, SessionRecord>>>,
    channel: Extension<Arc<GossipChannel>>,
) -> Json<StatusResponse> {
    handle_status::<String, SessionRecord>(map, channel).await
}
