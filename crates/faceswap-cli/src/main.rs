use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceswap_core::{
    FaceRole, LazySwapper, ModelPaths, Notice, OnnxFaceSwapper, RequestHandler, RequestState, StagingArea,
    SwapRequest, SwapperOptions, UploadedImage, CPU_DEVICE, DOWNLOAD_FILE_NAME,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faceswap", about = "Swap the face of one image onto another")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Swap the source face onto every face in the target image
    Swap {
        /// Image providing the face identity
        #[arg(short, long)]
        source: PathBuf,
        /// Image whose faces are replaced
        #[arg(short, long)]
        target: PathBuf,
        /// Where to write the JPEG result
        #[arg(short, long, default_value = DOWNLOAD_FILE_NAME)]
        output: PathBuf,
        /// Directory containing the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Execution device (-1 = CPU)
        #[arg(long, default_value_t = CPU_DEVICE, allow_negative_numbers = true)]
        device_id: i32,
    },
    /// Show which model files are installed
    Models {
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_image(role: FaceRole, path: &Path) -> Result<UploadedImage> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    Ok(UploadedImage::from_upload(role, file_name, None, bytes)?)
}

fn swap(source: &Path, target: &Path, output: &Path, model_dir: PathBuf, device_id: i32) -> Result<()> {
    let source = load_image(FaceRole::Source, source)?;
    let target = load_image(FaceRole::Target, target)?;

    let options = SwapperOptions {
        device_id,
        ..SwapperOptions::default()
    };
    let paths = ModelPaths::in_dir(&model_dir);
    let mut swapper = LazySwapper::new(move || OnnxFaceSwapper::load(&paths, &options));

    let handler = RequestHandler::new(StagingArea::system());
    let outcome = handler.handle(
        &mut swapper,
        SwapRequest {
            source: Some(&source),
            target: Some(&target),
            swap_requested: true,
        },
    );

    for notice in &outcome.notices {
        match notice {
            Notice::Info(m) => tracing::info!("{m}"),
            Notice::Warning(m) => eprintln!("warning: {m}"),
            Notice::Error(m) => eprintln!("error: {m}"),
        }
    }

    match (outcome.state, outcome.output) {
        (RequestState::Success, Some(result)) => {
            std::fs::write(output, &result.jpeg).with_context(|| format!("failed to write {}", output.display()))?;
            println!("Wrote {}x{} result to {}", result.width, result.height, output.display());
            Ok(())
        }
        (state, _) => bail!("face swap did not complete (state: {state:?})"),
    }
}

fn models(model_dir: PathBuf, json: bool) -> Result<()> {
    let status = ModelPaths::in_dir(&model_dir).status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Model directory: {}", model_dir.display());
    for model in &status {
        let mark = if model.present { "ok" } else { "MISSING" };
        println!("  {:<22} {mark}", model.name);
    }
    if status.iter().any(|m| !m.present) {
        println!("Download the missing files from the insightface model zoo into the directory above.");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Swap {
            source,
            target,
            output,
            model_dir,
            device_id,
        } => swap(
            &source,
            &target,
            &output,
            model_dir.unwrap_or_else(faceswap_core::default_model_dir),
            device_id,
        ),
        Commands::Models { model_dir, json } => {
            models(model_dir.unwrap_or_else(faceswap_core::default_model_dir), json)
        }
    }
}
