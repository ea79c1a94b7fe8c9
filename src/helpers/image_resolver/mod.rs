use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("GET {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: StatusCode },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What landed on disk.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: u64,
    pub sha256: String,
}

/// Stream `url` into `dest`.
///
/// The body goes to `<dest>.part` first and is renamed into place only once
/// the transfer completed, so `dest` either does not exist or is whole. The
/// partial file is removed on failure.
pub async fn download_to(client: &Client, url: &str, dest: &Path) -> Result<Downloaded, DownloadError> {
    let partial = partial_path(dest);

    match fetch(client, url, &partial).await {
        Ok(done) => {
            fs::rename(&partial, dest).map_err(|source| DownloadError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
            Ok(done)
        }
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(&partial)
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %partial.display(), error = %cleanup, "failed to remove partial download");
            }
            Err(err)
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn fetch(client: &Client, url: &str, out_path: &Path) -> Result<Downloaded, DownloadError> {
    let http_err = |source| DownloadError::Http {
        url: url.to_string(),
        source,
    };
    let io_err = |source| DownloadError::Io {
        path: out_path.to_path_buf(),
        source,
    };

    let res = client.get(url).send().await.map_err(http_err)?;

    let status = res.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status,
        });
    }

    let pb = progress_bar(res.content_length());
    pb.set_message(format!("Downloading {url}"));

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = File::create(out_path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;

    let mut body = res.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(http_err)?;
        file.write_all(&chunk).map_err(io_err)?;
        hasher.update(&chunk);

        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }
    file.sync_all().map_err(io_err)?;

    pb.finish_with_message(format!("Downloaded {url}"));

    Ok(Downloaded {
        bytes: downloaded,
        sha256: hex::encode(hasher.finalize()),
    })
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    let (pb, template) = match total {
        Some(total) => (
            ProgressBar::new(total),
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] \
             {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ),
        None => (
            ProgressBar::new_spinner(),
            "{msg}\n{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec})",
        ),
    };

    match ProgressStyle::with_template(template) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(err) => tracing::debug!(error = %err, "falling back to default progress style"),
    }
    pb
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::serve;

    #[tokio::test]
    async fn downloads_into_place_and_hashes() {
        let base = serve(Router::new().route("/img", get(|| async { "hello" }))).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("cache/img.qcow2");

        let done = download_to(&Client::new(), &format!("{base}/img"), &dest).await.unwrap();

        assert_eq!(done.bytes, 5);
        assert_eq!(
            done.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(fs::read_to_string(&dest).unwrap(), "hello");
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn error_status_leaves_nothing_behind() {
        let base = serve(Router::new().route("/img", get(|| async { StatusCode::NOT_FOUND }))).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("img.qcow2");

        let err = download_to(&Client::new(), &format!("{base}/img"), &dest).await.unwrap_err();

        assert!(matches!(err, DownloadError::Status { status, .. } if status == StatusCode::NOT_FOUND));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
