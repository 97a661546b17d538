use archon::{api, config, logging};
use clap::Parser;
use tokio::net::TcpListener;

/// Archon knowledge-management backend.
#[derive(Parser, Debug)]
#[command(name = "archon", version, about)]
struct Args {
    /// Port override; falls back to `SERVER_PORT`, then the 8180-8199 scan.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    config::init_config();
    logging::init_tracing();

    let state = api::AppState::initialize()
        .await
        .expect("Failed to initialize application state");
    let app = api::create_router(state);

    let (listener, port) = bind_listener(args.port)
        .await
        .expect("Failed to bind listener");
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await.unwrap();
}

async fn bind_listener(override_port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = override_port.or(config.server_port) {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 8180..=8199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 8180-8199",
    ))
}
