use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;
use tokio::process::Command;

/// Colour of the drawn label.
pub const LABEL_COLOR: &str = "red";

pub const IMAGE_PREFIX: &str = "image_";

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("failed to write original image {path}: {source}")]
    WriteOriginal {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to invoke {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    ExitStatus {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// One image of a batch, numbered from 1 in submission order.
#[derive(Clone, Debug)]
pub struct ImageJob {
    pub number: usize,
    pub data: Vec<u8>,
    pub original_path: PathBuf,
    pub output_path: PathBuf,
}

impl ImageJob {
    pub fn new(number: usize, data: Vec<u8>, output_dir: &Path) -> Self {
        Self {
            number,
            data,
            original_path: output_dir.join(original_file_name(number)),
            output_path: output_dir.join(image_file_name(number)),
        }
    }
}

pub fn original_file_name(number: usize) -> String {
    format!("original_{}.png", number)
}

pub fn image_file_name(number: usize) -> String {
    format!("{}{}.png", IMAGE_PREFIX, number)
}

/// Parse the image number back out of an `image_<n>.png` file name.
pub fn image_number(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(IMAGE_PREFIX)?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

#[async_trait]
pub trait ImageTransformer: Send + Sync + std::fmt::Debug {
    /// Write `job.output_path` with `job.number` drawn onto the image.
    /// Nothing but the output file may be left behind.
    async fn transform(&self, job: &ImageJob) -> Result<(), TransformError>;
}

/// Draws the label with an external `ffmpeg`-compatible binary.
#[derive(Clone, Debug)]
pub struct CommandTransformer {
    tool: String,
}

impl CommandTransformer {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    fn filter(number: usize) -> String {
        format!(
            "drawtext=text='Image\\: {}':fontcolor={}:fontsize=h*0.05:x=(w-text_w)/2:y=(h-text_h)/2",
            number, LABEL_COLOR
        )
    }

    async fn run_tool(&self, job: &ImageJob) -> Result<(), TransformError> {
        let output = Command::new(&self.tool)
            .arg("-i")
            .arg(&job.original_path)
            .arg("-vf")
            .arg(Self::filter(job.number))
            .arg("-y")
            .arg(&job.output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| TransformError::Spawn {
                tool: self.tool.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TransformError::ExitStatus {
                tool: self.tool.clone(),
                status: output.status,
                stderr: stderr.lines().last().unwrap_or_default().to_string(),
            })
        }
    }
}

#[async_trait]
impl ImageTransformer for CommandTransformer {
    async fn transform(&self, job: &ImageJob) -> Result<(), TransformError> {
        tokio::fs::write(&job.original_path, &job.data)
            .await
            .map_err(|source| TransformError::WriteOriginal {
                path: job.original_path.clone(),
                source,
            })?;

        let result = self.run_tool(job).await;

        if let Err(e) = tokio::fs::remove_file(&job.original_path).await {
            tracing::warn!(
                "failed to remove {}: {}",
                job.original_path.display(),
                e
            );
        }
        if result.is_err() {
            // a failed run may leave a truncated output behind
            let _ = tokio::fs::remove_file(&job.output_path).await;
        }

        result
    }
}
