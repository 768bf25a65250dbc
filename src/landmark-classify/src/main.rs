use std::error::Error;
use std::fs;
use std::path::PathBuf;
use structopt::StructOpt;

use landmark_serve::{
    Artifact, ArtifactSource, ChannelOrder, HostConfig, ModelHost, TfLoader, Timer,
};

use log::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "landmark-classify",
    about = "CLI app to classify a landmark image with TensorFlow"
)]
struct CmdArgs {
    #[structopt(
        help = "Frozen GraphDef file or SavedModel directory",
        parse(from_os_str)
    )]
    model_path: PathBuf,

    #[structopt(help = "Image file or http(s) URL to classify")]
    image: String,

    #[structopt(long, env = "MODEL_SOURCE", help = "Where to fetch a missing model from")]
    model_source: Option<String>,

    #[structopt(long, parse(from_os_str), help = "Training index CSV for sample counts")]
    counts_path: Option<PathBuf>,

    #[structopt(long)]
    counts_source: Option<String>,

    #[structopt(long, default_value = "landmark_id")]
    counts_column: String,

    #[structopt(long, default_value = "bgr")]
    channel_order: ChannelOrder,

    #[structopt(long, default_value = "serving_default_input_1")]
    input_op: String,

    #[structopt(long, default_value = "StatefulPartitionedCall")]
    output_op: String,
}

fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn read_image(location: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    if !is_url(location) {
        return Ok(fs::read(location)?);
    }

    let mut t = Timer::new_start(&format!("Fetching image from {}", location));
    let bytes = reqwest::blocking::get(location)?
        .error_for_status()?
        .bytes()?;
    t.stop();

    Ok(bytes.to_vec())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CmdArgs::from_args();

    let model_source = ArtifactSource::optional(args.model_source.as_deref())?;
    let counts_source = ArtifactSource::optional(args.counts_source.as_deref())?;

    let config = HostConfig {
        model: Artifact::new(args.model_path, model_source),
        counts: args
            .counts_path
            .map(|path| Artifact::new(path, counts_source)),
        counts_column: args.counts_column,
        channel_order: args.channel_order,
    };
    let loader = TfLoader {
        input_op: args.input_op,
        output_op: args.output_op,
    };

    let host = ModelHost::new(loader, config);
    host.ensure_loaded()?;

    let image = read_image(&args.image)?;
    let classification = host.classify(&image)?;

    let json = serde_json::to_string(&classification)?;
    info!("{}", json);
    println!("{}", json);

    Ok(())
}
