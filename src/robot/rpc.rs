//! Framed RPC client for the robot navigation service
//!
//! One TCP connection carries length-prefixed `RpcEnvelope`s. Requests are
//! matched to responses by `request_id`, so calls from concurrent tasks can
//! share the link.

use super::{handle_to_wire, CommandHandle, RobotClient, RobotError};
use crate::config::RobotConnectionConfig;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use graphnav_shared::codec::{self, FrameDecoder};
use graphnav_shared::rpc_request::Call;
use graphnav_shared::rpc_response::Reply;
use graphnav_shared::{
    Empty, Graph, Lease, LeaseRequest, LocalizationState, NavigateRouteRequest,
    NavigateToAnchorRequest, NavigateToRequest, NavigationFeedbackRequest, NavigationStatus,
    RobotState, Route, RpcEnvelope, RpcErrorCode, RpcResponse, Se3Pose, SetLocalizationRequest,
    Snapshot, UploadGraphRequest, UploadGraphResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// Robot client over a single framed TCP connection
pub struct RpcRobotClient {
    client_name: String,
    request_timeout: Duration,
    next_request_id: AtomicU64,
    /// Encoded frames waiting to be written
    outbound_tx: mpsc::Sender<Bytes>,
    /// Calls waiting for their response
    pending: PendingCalls,
}

impl RpcRobotClient {
    /// Connect to the robot and start the connection task
    pub async fn connect(config: &RobotConnectionConfig) -> anyhow::Result<Self> {
        let stream = timeout(config.connect_timeout(), TcpStream::connect(&config.address))
            .await
            .with_context(|| format!("Timed out connecting to {}", config.address))?
            .with_context(|| format!("Failed to connect to {}", config.address))?;
        stream.set_nodelay(true)?;

        info!("[RPC] Connected to robot at {}", config.address);

        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(100);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        let pending_clone = pending.clone();
        tokio::spawn(async move {
            if let Err(e) = connection_loop(stream, outbound_rx, &pending_clone).await {
                error!("[RPC] Connection error: {}", e);
            }
            // Dropping the senders fails every call still waiting
            pending_clone.lock().await.clear();
            warn!("[RPC] Robot connection closed");
        });

        Ok(Self {
            client_name: config.client_name.clone(),
            request_timeout: config.request_timeout(),
            next_request_id: AtomicU64::new(0),
            outbound_tx,
            pending,
        })
    }

    /// Send one request and wait for its reply
    async fn call(&self, name: &'static str, call: Call) -> Result<Reply, RobotError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = codec::encode(&RpcEnvelope::request(request_id, call))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self.outbound_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(RobotError::Disconnected);
        }

        debug!("[RPC] -> {} (id={})", name, request_id);

        let response = match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RobotError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                return Err(RobotError::Timeout {
                    call: name,
                    waited: self.request_timeout,
                });
            }
        };

        match response.reply {
            Some(Reply::Error(e)) => {
                let code = RpcErrorCode::try_from(e.code).unwrap_or(RpcErrorCode::ErrorUnknown);
                if code == RpcErrorCode::ErrorAlreadyClaimed {
                    Err(RobotError::AlreadyClaimed)
                } else {
                    Err(RobotError::Rejected {
                        call: name,
                        message: format!("{:?}: {}", code, e.message),
                    })
                }
            }
            Some(reply) => Ok(reply),
            None => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn call_ack(&self, name: &'static str, call: Call) -> Result<(), RobotError> {
        match self.call(name, call).await? {
            Reply::Ack(_) => Ok(()),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn call_command(
        &self,
        name: &'static str,
        call: Call,
    ) -> Result<Option<CommandHandle>, RobotError> {
        match self.call(name, call).await? {
            Reply::Command(c) => Ok(CommandHandle::from_wire(c.command_id)),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    fn lease_request(&self, lease: Option<&Lease>) -> LeaseRequest {
        LeaseRequest {
            client_name: self.client_name.clone(),
            lease: lease.cloned(),
        }
    }
}

#[async_trait]
impl RobotClient for RpcRobotClient {
    async fn get_localization_state(&self) -> Result<LocalizationState, RobotError> {
        let name = "get_localization_state";
        match self.call(name, Call::GetLocalizationState(Empty {})).await? {
            Reply::LocalizationState(state) => Ok(state),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn set_localization(&self, request: &SetLocalizationRequest) -> Result<(), RobotError> {
        self.call_ack("set_localization", Call::SetLocalization(request.clone()))
            .await
    }

    async fn download_graph(&self) -> Result<Option<Graph>, RobotError> {
        let name = "download_graph";
        match self.call(name, Call::DownloadGraph(Empty {})).await? {
            Reply::Graph(response) => Ok(response.graph),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn upload_graph(
        &self,
        graph: &Graph,
        generate_new_anchoring: bool,
    ) -> Result<UploadGraphResponse, RobotError> {
        let name = "upload_graph";
        let request = UploadGraphRequest {
            graph: Some(graph.clone()),
            generate_new_anchoring,
        };
        match self.call(name, Call::UploadGraph(request)).await? {
            Reply::UploadGraph(response) => Ok(response),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn upload_waypoint_snapshot(&self, snapshot: &Snapshot) -> Result<(), RobotError> {
        self.call_ack(
            "upload_waypoint_snapshot",
            Call::UploadWaypointSnapshot(snapshot.clone()),
        )
        .await
    }

    async fn upload_edge_snapshot(&self, snapshot: &Snapshot) -> Result<(), RobotError> {
        self.call_ack("upload_edge_snapshot", Call::UploadEdgeSnapshot(snapshot.clone()))
            .await
    }

    async fn navigate_to(
        &self,
        waypoint_id: &str,
        cmd_duration_secs: f64,
        command: Option<CommandHandle>,
    ) -> Result<Option<CommandHandle>, RobotError> {
        let request = NavigateToRequest {
            waypoint_id: waypoint_id.to_string(),
            cmd_duration_secs,
            command_id: handle_to_wire(command),
        };
        self.call_command("navigate_to", Call::NavigateTo(request))
            .await
    }

    async fn navigate_to_anchor(
        &self,
        seed_tform_goal: &Se3Pose,
        cmd_duration_secs: f64,
        command: Option<CommandHandle>,
    ) -> Result<Option<CommandHandle>, RobotError> {
        let request = NavigateToAnchorRequest {
            seed_tform_goal: Some(seed_tform_goal.clone()),
            cmd_duration_secs,
            command_id: handle_to_wire(command),
        };
        self.call_command("navigate_to_anchor", Call::NavigateToAnchor(request))
            .await
    }

    async fn navigate_route(
        &self,
        route: &Route,
        cmd_duration_secs: f64,
    ) -> Result<Option<CommandHandle>, RobotError> {
        let request = NavigateRouteRequest {
            route: Some(route.clone()),
            cmd_duration_secs,
        };
        self.call_command("navigate_route", Call::NavigateRoute(request))
            .await
    }

    async fn navigation_feedback(
        &self,
        command: CommandHandle,
    ) -> Result<NavigationStatus, RobotError> {
        let name = "navigation_feedback";
        let request = NavigationFeedbackRequest {
            command_id: command.id(),
        };
        match self.call(name, Call::NavigationFeedback(request)).await? {
            Reply::Feedback(feedback) => Ok(NavigationStatus::try_from(feedback.status)
                .unwrap_or(NavigationStatus::StatusUnknown)),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn clear_graph(&self) -> Result<(), RobotError> {
        self.call_ack("clear_graph", Call::ClearGraph(Empty {})).await
    }

    async fn get_robot_state(&self) -> Result<RobotState, RobotError> {
        let name = "get_robot_state";
        match self.call(name, Call::GetRobotState(Empty {})).await? {
            Reply::RobotState(state) => Ok(state),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn power_on_motors(&self) -> Result<(), RobotError> {
        self.call_ack("power_on_motors", Call::PowerOnMotors(Empty {}))
            .await
    }

    async fn safe_power_off_motors(&self) -> Result<(), RobotError> {
        self.call_ack("safe_power_off_motors", Call::SafePowerOffMotors(Empty {}))
            .await
    }

    async fn acquire_lease(&self) -> Result<Lease, RobotError> {
        let name = "acquire_lease";
        match self
            .call(name, Call::AcquireLease(self.lease_request(None)))
            .await?
        {
            Reply::Lease(response) => response.lease.ok_or(RobotError::UnexpectedResponse(name)),
            _ => Err(RobotError::UnexpectedResponse(name)),
        }
    }

    async fn retain_lease(&self, lease: &Lease) -> Result<(), RobotError> {
        self.call_ack("retain_lease", Call::RetainLease(self.lease_request(Some(lease))))
            .await
    }

    async fn return_lease(&self, lease: &Lease) -> Result<(), RobotError> {
        self.call_ack("return_lease", Call::ReturnLease(self.lease_request(Some(lease))))
            .await
    }
}

/// Pump frames between the socket and the waiting calls
async fn connection_loop(
    stream: TcpStream,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    pending: &PendingCalls,
) -> Result<(), RobotError> {
    let (mut reader, mut writer) = stream.into_split();

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => writer.write_all(&frame).await?,
                    // Client dropped
                    None => return Ok(()),
                }
            }

            result = reader.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(RobotError::Disconnected);
                }
                decoder.extend(&read_buf[..n]);

                while let Some(envelope) = decoder.decode_next()? {
                    dispatch_response(envelope, pending).await;
                }
            }
        }
    }
}

async fn dispatch_response(envelope: RpcEnvelope, pending: &PendingCalls) {
    let Some(response) = envelope.response else {
        warn!("[RPC] Ignoring non-response frame id={}", envelope.request_id);
        return;
    };

    match pending.lock().await.remove(&envelope.request_id) {
        Some(tx) => {
            // Receiver gone means the caller already timed out
            let _ = tx.send(response);
        }
        None => {
            debug!("[RPC] Late response for id={}", envelope.request_id);
        }
    }
}
