use super::{
    dispatch::ImageOutcome,
    transform::{image_file_name, image_number},
};
use chrono::{DateTime, Utc};
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicI64, Ordering},
};

/// Maps process records onto the served `output/` tree.
#[derive(Debug)]
pub struct OutputLayout {
    root: PathBuf,
    public_url: String,
    last_stamp: AtomicI64,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Directory served under `/output`.
    pub fn served_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// A creation time whose millisecond stamp was never handed out before, so
    /// every process gets its own directory.
    pub fn next_creation_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut candidate = now.timestamp_millis();
        let mut last = self.last_stamp.load(Ordering::SeqCst);
        loop {
            if candidate <= last {
                candidate = last + 1;
            }
            match self.last_stamp.compare_exchange(
                last,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => last = current,
            }
        }
        DateTime::<Utc>::from_timestamp_millis(candidate).unwrap_or(now)
    }

    pub fn output_url(created_at: &DateTime<Utc>) -> String {
        format!("/output/process_{}", created_at.timestamp_millis())
    }

    pub fn process_dir(&self, output_url: &str) -> PathBuf {
        self.root.join(output_url.trim_start_matches('/'))
    }

    /// Prefix for image URLs: the configured public URL, otherwise the origin
    /// the submission came in on.
    pub fn base_url<'a>(&'a self, origin: Option<&'a str>) -> &'a str {
        if !self.public_url.is_empty() {
            return &self.public_url;
        }
        origin.map(|o| o.trim_end_matches('/')).unwrap_or_default()
    }

    pub fn image_url(base_url: &str, output_url: &str, file_name: &str) -> String {
        format!("{}{}/{}", base_url, output_url, file_name)
    }

    /// URLs of the successfully labelled images, in image order.
    pub fn image_urls(
        &self,
        origin: Option<&str>,
        output_url: &str,
        outcomes: &[ImageOutcome],
    ) -> Vec<String> {
        let base_url = self.base_url(origin);
        outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| Self::image_url(base_url, output_url, &image_file_name(o.image_number)))
            .collect()
    }

    /// Image numbers present on disk as `image_<n>.png`, ascending.
    /// A missing directory lists as empty.
    pub async fn list_images(&self, dir: &Path) -> std::io::Result<Vec<usize>> {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let mut numbers = vec![];
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(number) = entry.file_name().to_str().and_then(image_number) {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Compare the outcome list with what actually landed on disk.
    /// Returns `true` when both agree.
    pub async fn verify(&self, dir: &Path, outcomes: &[ImageOutcome]) -> bool {
        let expected: Vec<usize> = outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.image_number)
            .collect();

        match self.list_images(dir).await {
            Ok(on_disk) if on_disk == expected => true,
            Ok(on_disk) => {
                tracing::warn!(
                    "output of {} does not match outcomes: expected {:?}, found {:?}",
                    dir.display(),
                    expected,
                    on_disk
                );
                false
            }
            Err(e) => {
                tracing::warn!("failed to list {}: {}", dir.display(), e);
                false
            }
        }
    }
}
