use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::{debug, error, info};
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

use landmark_serve::{Artifact, ArtifactSource, ChannelOrder, HostConfig, ModelHost, TfLoader};

mod routes;

use routes::AppState;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "landmark-http",
    about = "HTTP service classifying uploaded landmark images with TensorFlow"
)]
struct ServerArgs {
    #[structopt(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
    bind: SocketAddr,

    #[structopt(
        long,
        env = "MODEL_PATH",
        default_value = "final_model.pb",
        parse(from_os_str),
        help = "Frozen GraphDef file or SavedModel directory"
    )]
    model_path: PathBuf,

    #[structopt(
        long,
        env = "MODEL_SOURCE",
        help = "URL or gdrive:<id> to fetch the model from when it is missing"
    )]
    model_source: Option<String>,

    #[structopt(
        long,
        env = "COUNTS_PATH",
        default_value = "train.csv",
        parse(from_os_str),
        help = "Training index CSV used for per-class sample counts"
    )]
    counts_path: PathBuf,

    #[structopt(long, env = "COUNTS_SOURCE")]
    counts_source: Option<String>,

    #[structopt(long, env = "COUNTS_COLUMN", default_value = "landmark_id")]
    counts_column: String,

    #[structopt(
        long,
        env = "CHANNEL_ORDER",
        default_value = "bgr",
        help = "Channel order the model was trained with (rgb or bgr)"
    )]
    channel_order: ChannelOrder,

    #[structopt(long, env = "INPUT_OP", default_value = "serving_default_input_1")]
    input_op: String,

    #[structopt(long, env = "OUTPUT_OP", default_value = "StatefulPartitionedCall")]
    output_op: String,

    #[structopt(long, env = "MAX_UPLOAD_BYTES", default_value = "16777216")]
    max_upload_bytes: u64,

    #[structopt(
        long,
        env = "LAZY_LOAD",
        default_value = "false",
        parse(try_from_str),
        help = "Load the model on the first request instead of at startup"
    )]
    lazy_load: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("could not install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::init();
    let args = ServerArgs::from_args();

    let model_source = ArtifactSource::optional(args.model_source.as_deref())?;
    let counts_source = ArtifactSource::optional(args.counts_source.as_deref())?;

    let config = HostConfig {
        model: Artifact::new(args.model_path, model_source),
        counts: Some(Artifact::new(args.counts_path, counts_source)),
        counts_column: args.counts_column,
        channel_order: args.channel_order,
    };
    let loader = TfLoader {
        input_op: args.input_op,
        output_op: args.output_op,
    };

    let state = Arc::new(AppState {
        host: ModelHost::new(loader, config),
        max_upload_bytes: args.max_upload_bytes,
    });

    if args.lazy_load {
        info!("Deferring model load to the first request");
    } else {
        let s = Arc::clone(&state);
        tokio::task::spawn_blocking(move || s.host.ensure_loaded().map(|_| ())).await??;
    }

    let make_service = make_service_fn(move |conn: &AddrStream| {
        let state = Arc::clone(&state);
        let remote = conn.remote_addr();

        let service = service_fn(move |req| {
            debug!("request from {}", remote);
            routes::handle(req, Arc::clone(&state))
        });

        async move { Ok::<_, Infallible>(service) }
    });

    let server = Server::try_bind(&args.bind)?.serve(make_service);
    info!("Listening on http://{}", server.local_addr());

    server.with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}
