use anyhow::Context;
use anyhow::Result;
use haven::cli::Opts;
use haven::db::Store;
use haven::ledger::GatewayClient;
use haven::logger;
use haven::node::Node;
use haven::routes;
use haven::routes::AppState;
use overlay_node::node::OverlayConfig;
use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::metadata::LevelFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::read();

    logger::init_tracing(LevelFilter::DEBUG, opts.json)?;

    let secret = std::env::var("SECRET").context("SECRET environment variable is not set")?;
    let admin_key = std::env::var("ADMIN_KEY").ok();
    if admin_key.is_none() {
        tracing::warn!("ADMIN_KEY not set, administrator endpoints are disabled");
    }

    let data_dir = opts.data_dir()?;
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir).context("Could not create data dir")?;
    }

    let store = Arc::new(Store::open(&data_dir.join("haven.db"))?);

    let bootstrap = opts.bootstrap().context("Invalid bootstrap multiaddress")?;
    let is_seed = bootstrap.is_none();

    let group_topic = if opts.group.is_empty() {
        let topic = format!("group-{}", random_hash());
        #[allow(clippy::print_stdout)]
        {
            println!("Generated group topic (share it out-of-band): {topic}");
        }
        topic
    } else {
        opts.group.clone()
    };

    let node = Node::start(
        OverlayConfig {
            tcp_port: opts.node_tcp,
            udp_port: opts.node_udp,
            bootstrap,
        },
        store.clone(),
        group_topic,
    )
    .await?;

    if is_seed {
        let peer_id = node.overlay.peer_id();
        #[allow(clippy::print_stdout)]
        for addr in node.overlay.listen_addrs().await? {
            println!("Bootstrap against this node with: -b {addr}/p2p/{peer_id}");
        }
    }

    let oracle = Arc::new(GatewayClient::new(opts.gateway.clone()));
    let auth = haven::auth::Authenticator::new(
        secret,
        admin_key,
        store.clone(),
        node.group_keys.clone(),
    );

    let app_state = Arc::new(AppState {
        node,
        store,
        auth,
        oracle,
    });
    let router = routes::router(app_state);

    let tls_config =
        axum_server::tls_rustls::RustlsConfig::from_pem_file("cert.pem", "key.pem")
            .await
            .context("Failed to load TLS key pair from cert.pem / key.pem")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], opts.http_port));
    tracing::info!(%addr, "Server started");

    axum_server::bind_rustls(addr, tls_config)
        .serve(router.into_make_service())
        .await
        .context("Failed to run server")?;

    Ok(())
}

/// A fresh random hash for naming an ad-hoc group topic.
fn random_hash() -> String {
    let mut random_bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut random_bytes);

    hex::encode(Sha256::digest(random_bytes))
}
