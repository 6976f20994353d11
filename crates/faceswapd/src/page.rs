//! HTML rendering of the upload / result page.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use faceswap_core::{Notice, RequestOutcome, RequestState, SwapOutput, UploadedImage};
use minijinja::Environment;
use serde::Serialize;

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");
const INDEX: &str = "index.html";

/// Everything the page shows for one request.
#[derive(Debug, Default, Serialize)]
pub struct PageView {
    pub notices: Vec<Notice>,
    pub previews: Option<Previews>,
    /// Set once a swap was attempted.
    pub swapping: bool,
    pub result: Option<ResultView>,
}

#[derive(Debug, Serialize)]
pub struct Previews {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Serialize)]
pub struct ResultView {
    /// `data:` URI backing both the image and the download link.
    pub src: String,
    pub width: u32,
    pub height: u32,
    pub file_name: &'static str,
}

impl PageView {
    /// The initial page: the prompt to upload both images.
    pub fn landing() -> Self {
        Self {
            notices: vec![Notice::Info(faceswap_core::MISSING_INPUT_PROMPT.to_string())],
            ..Self::default()
        }
    }

    pub fn from_outcome(outcome: RequestOutcome, previews: Option<Previews>) -> Self {
        let swapping = matches!(outcome.state, RequestState::Success | RequestState::Failed)
            && previews.is_some();
        Self {
            notices: outcome.notices,
            previews,
            swapping,
            result: outcome.output.map(ResultView::from),
        }
    }
}

impl Previews {
    /// Inline previews of both uploads; `None` unless both are present.
    pub fn of(source: Option<&UploadedImage>, target: Option<&UploadedImage>) -> Option<Self> {
        let (source, target) = (source?, target?);
        Some(Self {
            source: data_uri(source.format.mime(), &source.bytes),
            target: data_uri(target.format.mime(), &target.bytes),
        })
    }
}

impl From<SwapOutput> for ResultView {
    fn from(output: SwapOutput) -> Self {
        Self {
            src: data_uri("image/jpeg", &output.jpeg),
            width: output.width,
            height: output.height,
            file_name: output.file_name,
        }
    }
}

pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Compiled page templates.
pub struct Pages {
    env: Environment<'static>,
}

impl Pages {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(INDEX, INDEX_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render(&self, view: &PageView) -> Result<String, minijinja::Error> {
        self.env.get_template(INDEX)?.render(view)
    }
}
