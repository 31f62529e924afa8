//! Surfacecast server entry point
//!
//! Streams a synthetic test-pattern surface to WebRTC viewers. Signaling is
//! line-delimited JSON: one request per line on stdin, one response or
//! session event per line on stdout. Requests for one session are handled
//! in the order they were read; different sessions proceed concurrently.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin surfacecast-server -- --framerate 15 --width 1280 --height 720
//!
//! # Requests
//! {"id":1,"op":"start","session_id":"tab-1"}   # omit session_id to get a generated one
//! {"id":2,"op":"create_offer","session_id":"tab-1"}
//! {"id":3,"op":"apply_answer","session_id":"tab-1","answer":{"type":"answer","sdp":"..."}}
//! {"id":4,"op":"reconfigure_scale","session_id":"tab-1","scale":0.5}
//! {"id":5,"op":"stop","session_id":"tab-1"}
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surfacecast_webrtc::{
    BuiltinEncoders, EncodeConfig, IceCandidate, InputEvent, RtcPeerFactory, SessionDescription,
    SessionEvent, StreamConfig, StreamController, TestPatternSurface, VideoCodec,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Surfacecast server
///
/// Streams remote surfaces over WebRTC data channels, with signaling over
/// stdin/stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML stream configuration; flags below override it
    #[arg(short, long, env = "SURFACECAST_CONFIG")]
    config: Option<PathBuf>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "SURFACECAST_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// Codec preference, most preferred first (comma-separated)
    #[arg(long, value_delimiter = ',', env = "SURFACECAST_CODECS")]
    codecs: Vec<VideoCodec>,

    /// Viewport width in CSS pixels
    #[arg(long, env = "SURFACECAST_WIDTH")]
    width: Option<u32>,

    /// Viewport height in CSS pixels
    #[arg(long, env = "SURFACECAST_HEIGHT")]
    height: Option<u32>,

    /// Device scale factor applied to the viewport
    #[arg(long, env = "SURFACECAST_SCALE")]
    scale: Option<f64>,

    /// Capture and encode framerate
    #[arg(long, env = "SURFACECAST_FRAMERATE")]
    framerate: Option<u32>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "SURFACECAST_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// One signaling request line
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    session_id: String,
    #[serde(flatten)]
    op: Operation,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Operation {
    Start {
        #[serde(default)]
        config: Option<StreamConfig>,
    },
    CreateOffer,
    ApplyAnswer {
        answer: SessionDescription,
    },
    AddIceCandidate {
        candidate: IceCandidate,
    },
    ReconfigureViewport {
        width: u32,
        height: u32,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    ReconfigureScale {
        scale: f64,
    },
    HandleNavigation,
    DispatchInput {
        event: InputEvent,
    },
    Stop,
    GetStats,
}

fn default_scale() -> f64 {
    1.0
}

/// One stdout line
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Output {
    Response {
        id: Value,
        ok: bool,
        #[serde(skip_serializing_if = "Value::is_null")]
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Event {
        event: SessionEvent,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl Output {
    fn ok(id: Value, result: Value) -> Self {
        Output::Response {
            id,
            ok: true,
            result,
            error: None,
        }
    }

    fn error(id: Value, code: &str, message: String) -> Self {
        Output::Response {
            id,
            ok: false,
            result: Value::Null,
            error: Some(ErrorBody {
                code: code.to_string(),
                message,
            }),
        }
    }
}

fn init_tracing(format: LogFormat) {
    // Logs go to stderr; stdout carries signaling
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn build_config(args: &Args) -> anyhow::Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => StreamConfig::default(),
    };

    if !args.stun_servers.is_empty() {
        config = config.with_stun_servers(args.stun_servers.clone());
    }
    if !args.codecs.is_empty() {
        let mut codecs = args.codecs.iter().copied();
        if let Some(first) = codecs.next() {
            config.encode = config.encode.with_codec(first);
        }
        config = config.with_codec_fallbacks(codecs.collect());
    }
    if args.width.is_some() || args.height.is_some() {
        let encode: EncodeConfig = config.encode.with_dimensions(
            args.width.unwrap_or(config.encode.width),
            args.height.unwrap_or(config.encode.height),
        );
        config = config.with_encode(encode);
    }
    if let Some(scale) = args.scale {
        config = config.with_scale(scale);
    }
    if let Some(framerate) = args.framerate {
        config.encode.framerate = framerate;
    }

    config.validate()?;
    Ok(config)
}

async fn handle(controller: &StreamController, defaults: &StreamConfig, request: Request) -> Output {
    let Request { id, session_id, op } = request;
    let sid = session_id.as_str();

    let result: surfacecast_webrtc::Result<Value> = match op {
        Operation::Start { config } => {
            let config = config.unwrap_or_else(|| defaults.clone());
            let surface = Arc::new(TestPatternSurface::new(config.encode.framerate));
            controller
                .start(sid, config, surface)
                .await
                .map(|()| serde_json::json!({ "session_id": sid }))
        }
        Operation::CreateOffer => controller
            .create_offer(sid)
            .await
            .and_then(|offer| Ok(serde_json::to_value(offer)?)),
        Operation::ApplyAnswer { answer } => {
            controller.apply_answer(sid, answer).await.map(|()| Value::Null)
        }
        Operation::AddIceCandidate { candidate } => controller
            .add_ice_candidate(sid, candidate)
            .await
            .map(|()| Value::Null),
        Operation::ReconfigureViewport {
            width,
            height,
            scale,
        } => controller
            .reconfigure_viewport(sid, width, height, scale)
            .await
            .map(|()| Value::Null),
        Operation::ReconfigureScale { scale } => controller
            .reconfigure_scale(sid, scale)
            .await
            .map(|()| Value::Null),
        Operation::HandleNavigation => controller
            .handle_navigation(sid)
            .await
            .map(|()| Value::Null),
        Operation::DispatchInput { event } => controller
            .dispatch_input(sid, event)
            .await
            .map(|()| Value::Null),
        Operation::Stop => controller.stop(sid).await.map(|()| Value::Null),
        Operation::GetStats => match controller.get_stats(sid).await {
            Some(stats) => serde_json::to_value(stats).map_err(Into::into),
            None => Ok(Value::Null),
        },
    };

    match result {
        Ok(value) => Output::ok(id, value),
        Err(e) => {
            debug!(session_id = sid, "request failed: {}", e);
            Output::error(id, e.code(), e.to_string())
        }
    }
}

type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, Output> + Send + Sync>;
type Queues = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Request>>>>;

/// Fans requests out to one sequential worker per session id
///
/// A worker exits after handling a `stop` with nothing queued behind it;
/// its queue is removed under the same lock `dispatch` takes, so no request
/// is ever handed to a worker that is going away.
struct SessionRouter {
    queues: Queues,
    handler: Handler,
    outputs: mpsc::UnboundedSender<Output>,
}

impl SessionRouter {
    fn new(handler: Handler, outputs: mpsc::UnboundedSender<Output>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            handler,
            outputs,
        }
    }

    fn dispatch(&self, mut request: Request) {
        if request.session_id.is_empty() && matches!(request.op, Operation::Start { .. }) {
            request.session_id = uuid::Uuid::new_v4().to_string();
        }

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&request.session_id) {
            if let Err(mpsc::error::SendError(request)) = queue.send(request) {
                // Only possible once the router itself is shutting down
                warn!(session_id = %request.session_id, "session worker gone, dropping request");
            }
            return;
        }

        let session_id = request.session_id.clone();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let _ = queue_tx.send(request);
        queues.insert(session_id.clone(), queue_tx);
        drop(queues);

        debug!(session_id = %session_id, "starting session worker");
        tokio::spawn(run_session_worker(
            session_id,
            queue_rx,
            Arc::clone(&self.handler),
            self.outputs.clone(),
            Arc::clone(&self.queues),
        ));
    }

    /// Stop accepting requests; workers exit once their queues drain
    fn close(self) {
        self.queues.lock().clear();
    }
}

async fn run_session_worker(
    session_id: String,
    mut queue: mpsc::UnboundedReceiver<Request>,
    handler: Handler,
    outputs: mpsc::UnboundedSender<Output>,
    queues: Queues,
) {
    let mut next = queue.recv().await;
    while let Some(request) = next {
        let stopping = matches!(request.op, Operation::Stop);
        let _ = outputs.send(handler(request).await);

        next = if stopping {
            let mut registry = queues.lock();
            match queue.try_recv() {
                Ok(request) => Some(request),
                Err(_) => {
                    registry.remove(&session_id);
                    None
                }
            }
        } else {
            queue.recv().await
        };
    }
    debug!(session_id = %session_id, "session worker finished");
}

async fn write_outputs(mut outputs: mpsc::UnboundedReceiver<Output>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(output) = outputs.recv().await {
        let mut line = serde_json::to_vec(&output)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = Arc::new(build_config(&args)?);
    info!(
        version = surfacecast_webrtc::version(),
        codec = %config.encode.codec,
        fallbacks = ?config.codec_fallbacks,
        width = config.encode.width,
        height = config.encode.height,
        scale = config.scale,
        "surfacecast server starting"
    );

    let (controller, mut events) =
        StreamController::new(Arc::new(RtcPeerFactory), Arc::new(BuiltinEncoders));
    let controller = Arc::new(controller);

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_outputs(output_rx));

    let event_tx = output_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_tx.send(Output::Event { event }).is_err() {
                break;
            }
        }
    });

    let handler: Handler = {
        let controller = Arc::clone(&controller);
        let config = Arc::clone(&config);
        Arc::new(move |request: Request| -> BoxFuture<'static, Output> {
            let controller = Arc::clone(&controller);
            let config = Arc::clone(&config);
            Box::pin(async move { handle(&controller, &config, request).await })
        })
    };
    let router = SessionRouter::new(handler, output_tx.clone());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("ctrl-c received, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed, shutting down");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let request: Request = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("invalid request: {}", e);
                        let _ = output_tx.send(Output::error(Value::Null, "invalid_request", e.to_string()));
                        continue;
                    }
                };

                router.dispatch(request);
            }
        }
    }

    router.close();
    controller.stop_all().await;
    drop(output_tx);
    drop(controller);
    // Event forwarder holds a sender until the controller is gone
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    info!("surfacecast server stopped");
    Ok(())
}
