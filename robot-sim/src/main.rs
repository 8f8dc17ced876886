mod sim;

use graphnav_shared::{codec, now_ms, RpcEnvelope};
use sim::SimRobot;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:50051".to_string());

    let listener = TcpListener::bind(&address).await?;
    info!("Robot simulator listening on {}", address);

    // One robot, shared by every client connection
    let robot = Arc::new(Mutex::new(SimRobot::new()));

    loop {
        let (socket, addr) = listener.accept().await?;
        info!("Connection from: {}", addr);

        let robot = robot.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(socket, addr, robot).await {
                error!("Connection {} failed: {}", addr, e);
            }
        });
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    addr: SocketAddr,
    robot: Arc<Mutex<SimRobot>>,
) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;

    let mut decoder = codec::FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            info!("Client disconnected: {}", addr);
            return Ok(());
        }
        decoder.extend(&buf[..n]);

        // Process all complete frames
        while let Some(envelope) = decoder.decode_next()? {
            let request_id = envelope.request_id;
            let Some(call) = envelope.request.and_then(|r| r.call) else {
                warn!("[{}] id={} frame without a request", addr, request_id);
                continue;
            };

            debug!("[{}] id={} {}", addr, request_id, call_name(&call));
            let response = robot.lock().await.handle(call, now_ms());

            let frame = codec::encode(&RpcEnvelope::response(request_id, response))?;
            socket.write_all(&frame).await?;
        }
    }
}

fn call_name(call: &graphnav_shared::rpc_request::Call) -> &'static str {
    use graphnav_shared::rpc_request::Call::*;
    match call {
        GetLocalizationState(_) => "get_localization_state",
        SetLocalization(_) => "set_localization",
        DownloadGraph(_) => "download_graph",
        UploadGraph(_) => "upload_graph",
        UploadWaypointSnapshot(_) => "upload_waypoint_snapshot",
        UploadEdgeSnapshot(_) => "upload_edge_snapshot",
        NavigateTo(_) => "navigate_to",
        NavigateToAnchor(_) => "navigate_to_anchor",
        NavigateRoute(_) => "navigate_route",
        NavigationFeedback(_) => "navigation_feedback",
        ClearGraph(_) => "clear_graph",
        GetRobotState(_) => "get_robot_state",
        PowerOnMotors(_) => "power_on_motors",
        SafePowerOffMotors(_) => "safe_power_off_motors",
        AcquireLease(_) => "acquire_lease",
        RetainLease(_) => "retain_lease",
        ReturnLease(_) => "return_lease",
    }
}
